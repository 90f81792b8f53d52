//! Error types shared by the snapshot sources

use thiserror::Error;

/// Result type for kuill-common operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while loading catalog or namespace snapshots
#[derive(Debug, Error)]
pub enum Error {
    /// Resource discovery against the backend failed
    #[error("discovery failed: {0}")]
    Discovery(String),

    /// Listing namespaces failed
    #[error("namespace listing failed: {0}")]
    Namespaces(String),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<kube::Error> for Error {
    fn from(e: kube::Error) -> Self {
        Error::Discovery(e.to_string())
    }
}
