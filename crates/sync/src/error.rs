use devcell_core::remote::RemoteError;
use devcell_core::{ProjectId, SessionError};

use crate::pipeline::PullStatus;
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("repository not found: {0}")]
    RepositoryNotFound(String),

    #[error("failed to read branch head: {0}")]
    RefFetchFailed(String),

    #[error("failed to create blob for {path}: {source}")]
    BlobCreateFailed {
        path: String,
        #[source]
        source: RemoteError,
    },

    #[error("failed to create tree: {0}")]
    TreeCreateFailed(#[source] RemoteError),

    #[error("failed to create commit: {0}")]
    CommitCreateFailed(#[source] RemoteError),

    /// The branch moved between reading its head and updating it.
    #[error("branch {branch} advanced during sync; pull before syncing again")]
    NonFastForward { branch: String },

    /// Remote history diverged from the last synced commit and the caller
    /// has not confirmed the overwrite.
    #[error("remote has new commits ({}); pull before syncing", .0.remote_sha)]
    PullRequired(Box<PullStatus>),

    #[error("project {0} has no linked repository")]
    NotLinked(ProjectId),

    #[error("no repository credential for this user")]
    Unauthenticated,

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;

fn remote_to_session(e: &RemoteError, message: String) -> SessionError {
    match e {
        RemoteError::NotFound(_) => SessionError::NotFound(message),
        RemoteError::NonFastForward { .. } => SessionError::Conflict(message),
        RemoteError::RateLimited(_) => SessionError::RateLimited(message),
        RemoteError::Unauthorized => SessionError::Unavailable(message),
        RemoteError::Transient(_) => SessionError::Transient(message),
        RemoteError::Rejected(_) => SessionError::Internal(message),
    }
}

impl From<SyncError> for SessionError {
    fn from(e: SyncError) -> Self {
        let message = e.to_string();
        match &e {
            SyncError::RepositoryNotFound(_)
            | SyncError::RefFetchFailed(_)
            | SyncError::NotLinked(_) => SessionError::NotFound(message),
            SyncError::NonFastForward { .. } | SyncError::PullRequired(_) => {
                SessionError::Conflict(message)
            }
            SyncError::Unauthenticated => SessionError::Unavailable(message),
            SyncError::BlobCreateFailed { source, .. } => remote_to_session(source, message),
            SyncError::TreeCreateFailed(source)
            | SyncError::CommitCreateFailed(source)
            | SyncError::Remote(source) => remote_to_session(source, message),
            SyncError::Store(_) => SessionError::Internal(message),
        }
    }
}
