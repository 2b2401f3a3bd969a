use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;

use crate::{
    enrich::resolve_place,
    error::Result,
    files::{data_uri, DisplayMode},
    geocode::Geocoder,
    location::LocationProvider,
    photo_metadata::{Coordinates, NewPhoto, PhotoRecord},
    store::PhotoStore,
};

pub struct CapturedImage {
    pub bytes: Vec<u8>,
    pub source_uri: Option<String>,
}

/// Produces one image per call. `Ok(None)` means the user cancelled.
#[async_trait]
pub trait Camera: Send + Sync {
    async fn capture(&self) -> Result<Option<CapturedImage>>;
}

/// "Captures" an existing image file.
#[derive(Debug, Clone)]
pub struct FileCamera {
    path: PathBuf,
}

impl FileCamera {
    pub fn new(path: &Path) -> FileCamera {
        FileCamera {
            path: path.to_path_buf(),
        }
    }
}

#[async_trait]
impl Camera for FileCamera {
    async fn capture(&self) -> Result<Option<CapturedImage>> {
        let bytes = tokio::fs::read(&self.path).await?;
        Ok(Some(CapturedImage {
            bytes,
            source_uri: Some(self.path.to_string_lossy().to_string()),
        }))
    }
}

/// The add-a-photo workflow: capture, locate, store the file, label it,
/// then insert the record.
pub struct Capturer {
    store: Arc<PhotoStore>,
    location: Arc<dyn LocationProvider>,
    geocoder: Arc<dyn Geocoder>,
    location_timeout: Duration,
    geocode_timeout: Duration,
}

impl Capturer {
    pub fn new(
        store: Arc<PhotoStore>,
        location: Arc<dyn LocationProvider>,
        geocoder: Arc<dyn Geocoder>,
        location_timeout: Duration,
        geocode_timeout: Duration,
    ) -> Capturer {
        Capturer {
            store,
            location,
            geocoder,
            location_timeout,
            geocode_timeout,
        }
    }

    pub async fn capture_new(&self, camera: &dyn Camera) -> Result<Option<PhotoRecord>> {
        let Some(image) = camera.capture().await? else {
            tracing::info!("capture cancelled");
            return Ok(None);
        };

        let coordinates = self.position(&image.bytes).await;
        let files = self.store.files();
        let file_path = files.write(&image.bytes).await?;

        // Labelled before the first persist; the record does not exist yet
        let place = match coordinates {
            Some(coords) => resolve_place(self.geocoder.as_ref(), coords, self.geocode_timeout).await,
            None => None,
        };

        let display_path = match self.store.display_mode() {
            DisplayMode::DataUri => data_uri(&image.bytes),
            DisplayMode::Native => files.display_uri(&file_path),
        };

        let input = NewPhoto {
            file_path: file_path.clone(),
            display_path,
            coordinates,
            place,
        };
        match self.store.insert_new(input).await {
            Ok(record) => {
                tracing::debug!(
                    photo_id = record.id(),
                    source = ?image.source_uri,
                    "captured photo stored"
                );
                Ok(Some(record))
            }
            Err(e) => {
                if let Err(cleanup) = files.delete(&file_path).await {
                    tracing::warn!(path = %file_path, error = %cleanup, "could not remove orphaned file");
                }
                Err(e)
            }
        }
    }

    async fn position(&self, image: &[u8]) -> Option<Coordinates> {
        match tokio::time::timeout(self.location_timeout, self.location.current_position(image)).await {
            Ok(Ok(coords)) => coords,
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "position unavailable");
                None
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.location_timeout.as_millis() as u64,
                    "position lookup timed out"
                );
                None
            }
        }
    }
}

/// Every JPEG under `src_root`, sorted by path.
pub fn visit_images(src_root: &Path) -> Result<Vec<PathBuf>> {
    let walker = globwalk::GlobWalkerBuilder::from_patterns(src_root, &["**/*.{jpg,jpeg}"])
        .case_insensitive(true)
        .build()?;
    let mut paths: Vec<PathBuf> = walker
        .filter_map(|item| match item {
            Ok(entry) => Some(entry.into_path()),
            Err(e) => {
                tracing::warn!(error = %e, "skipping unreadable entry");
                None
            }
        })
        .collect();
    paths.sort();
    Ok(paths)
}
