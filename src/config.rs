use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use clap::Args;

use crate::{files::DisplayMode, spatial::MapOptions};

#[derive(Args, Debug, Clone)]
pub struct Config {
    /// Directory holding the collection, the photo files and the geocode cache
    #[arg(long, env = "PHOTOMAP_DATA_DIR", default_value = "photomap-data")]
    pub data_dir: PathBuf,
    /// How display paths are produced
    #[arg(long, env = "PHOTOMAP_DISPLAY_MODE", value_enum, default_value_t = DisplayMode::Native)]
    pub display_mode: DisplayMode,
    /// Reverse geocoding endpoint (Nominatim-compatible)
    #[arg(
        long,
        env = "PHOTOMAP_GEOCODE_URL",
        default_value = "https://nominatim.openstreetmap.org"
    )]
    pub geocode_url: String,
    #[arg(long, env = "PHOTOMAP_USER_AGENT", default_value = concat!("photomap/", env!("CARGO_PKG_VERSION")))]
    pub user_agent: String,
    #[arg(long, env = "PHOTOMAP_GEOCODE_TIMEOUT_MS", default_value_t = 8000)]
    pub geocode_timeout_ms: u64,
    #[arg(long, env = "PHOTOMAP_LOCATION_TIMEOUT_MS", default_value_t = 10000)]
    pub location_timeout_ms: u64,
    /// Padding in pixels around fitted map bounds
    #[arg(long, env = "PHOTOMAP_MAP_PADDING", default_value_t = 24)]
    pub map_padding: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_dir: PathBuf::from("photomap-data"),
            display_mode: DisplayMode::Native,
            geocode_url: "https://nominatim.openstreetmap.org".to_string(),
            user_agent: concat!("photomap/", env!("CARGO_PKG_VERSION")).to_string(),
            geocode_timeout_ms: 8000,
            location_timeout_ms: 10000,
            map_padding: 24,
        }
    }
}

impl Config {
    pub fn store_dir(&self) -> PathBuf {
        self.data_dir.join("store")
    }

    pub fn photos_dir(&self) -> PathBuf {
        self.data_dir.join("photos")
    }

    pub fn geocode_cache_dir(&self) -> PathBuf {
        self.data_dir.join("geocode")
    }

    pub fn geocode_timeout(&self) -> Duration {
        Duration::from_millis(self.geocode_timeout_ms)
    }

    pub fn location_timeout(&self) -> Duration {
        Duration::from_millis(self.location_timeout_ms)
    }

    pub fn map_options(&self) -> MapOptions {
        MapOptions {
            padding: self.map_padding,
            ..MapOptions::default()
        }
    }

    pub fn with_data_dir(mut self, data_dir: &Path) -> Config {
        self.data_dir = data_dir.to_path_buf();
        self
    }
}
