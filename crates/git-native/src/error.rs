use std::path::PathBuf;

use devcell_core::remote::RemoteError;

#[derive(Debug, thiserror::Error)]
pub enum GitStorageError {
    #[error("not a git repository: {0}")]
    NotARepo(PathBuf),

    #[error("git error: {0}")]
    Gix(Box<dyn std::error::Error + Send + Sync>),

    #[error("invalid object id: {0}")]
    InvalidObjectId(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, GitStorageError>;

impl From<GitStorageError> for RemoteError {
    fn from(e: GitStorageError) -> Self {
        match e {
            GitStorageError::NotARepo(path) => RemoteError::NotFound(path.display().to_string()),
            GitStorageError::InvalidObjectId(id) => RemoteError::NotFound(id),
            other => RemoteError::Transient(other.to_string()),
        }
    }
}
