use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Writing the collection to storage failed
    #[error("persistence failure: {0}")]
    Persistence(String),

    /// Persisted data could not be parsed
    #[error("corrupt data: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("exif error: {0}")]
    Exif(#[from] exif::Error),

    #[error("invalid glob pattern: {0}")]
    Glob(#[from] globwalk::GlobError),

    /// A collaborator could not produce a value (permission, sensor, network)
    #[error("unavailable: {0}")]
    Unavailable(String),
}
