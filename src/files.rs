use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Mutex,
};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use tokio::{fs, io::AsyncWriteExt};

use crate::error::{Error, Result};

/// Storage for the image files themselves. Paths are opaque to the rest of
/// the crate.
#[async_trait]
pub trait FileStore: Send + Sync {
    async fn write(&self, bytes: &[u8]) -> Result<String>;
    async fn read(&self, path: &str) -> Result<Vec<u8>>;
    async fn delete(&self, path: &str) -> Result<()>;
    /// Source a renderer can load directly.
    fn display_uri(&self, path: &str) -> String;
}

/// How a record's display path is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum DisplayMode {
    /// Inline the file bytes as a base64 data URI, re-resolved on every load
    DataUri,
    /// Point at the stored file
    #[default]
    Native,
}

pub fn data_uri(bytes: &[u8]) -> String {
    format!("data:image/jpeg;base64,{}", STANDARD.encode(bytes))
}

/// Files named `<millis>.jpeg` under a directory.
#[derive(Debug, Clone)]
pub struct LocalFiles {
    root: PathBuf,
}

impl LocalFiles {
    pub fn new(root: &Path) -> Result<LocalFiles> {
        std::fs::create_dir_all(root)?;
        Ok(LocalFiles {
            root: root.to_path_buf(),
        })
    }

    // Records store bare file names; anything after the last separator is
    // taken as the name so older absolute paths still resolve.
    fn resolve(&self, path: &str) -> PathBuf {
        let name = path.rsplit(['/', '\\']).next().unwrap_or(path);
        self.root.join(name)
    }
}

#[async_trait]
impl FileStore for LocalFiles {
    async fn write(&self, bytes: &[u8]) -> Result<String> {
        let mut millis = Utc::now().timestamp_millis();
        loop {
            let name = format!("{}.jpeg", millis);
            let open = fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(self.root.join(&name))
                .await;
            match open {
                Ok(mut file) => {
                    file.write_all(bytes).await?;
                    file.flush().await?;
                    return Ok(name);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => millis += 1,
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        Ok(fs::read(self.resolve(path)).await?)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        Ok(fs::remove_file(self.resolve(path)).await?)
    }

    fn display_uri(&self, path: &str) -> String {
        format!("file://{}", self.resolve(path).display())
    }
}

/// Volatile file store, for tests.
#[derive(Debug, Default)]
pub struct MemoryFiles {
    files: Mutex<HashMap<String, Vec<u8>>>,
    next: Mutex<u64>,
}

impl MemoryFiles {
    pub fn new() -> MemoryFiles {
        MemoryFiles::default()
    }

    pub fn insert(&self, path: &str, bytes: &[u8]) {
        lock(&self.files).insert(path.to_string(), bytes.to_vec());
    }

    pub fn contains(&self, path: &str) -> bool {
        lock(&self.files).contains_key(path)
    }

    pub fn len(&self) -> usize {
        lock(&self.files).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl FileStore for MemoryFiles {
    async fn write(&self, bytes: &[u8]) -> Result<String> {
        let path = {
            let mut next = lock(&self.next);
            *next += 1;
            format!("{}.jpeg", *next)
        };
        self.insert(&path, bytes);
        Ok(path)
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        lock(&self.files)
            .get(path)
            .cloned()
            .ok_or_else(|| Error::Unavailable(format!("no such file: {}", path)))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        lock(&self.files)
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| Error::Unavailable(format!("no such file: {}", path)))
    }

    fn display_uri(&self, path: &str) -> String {
        format!("memory://{}", path)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
