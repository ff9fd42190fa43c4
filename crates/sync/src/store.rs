//! Persistence seam for sync state.

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sync store error: {0}")]
    Backend(String),
}

/// Repository linked to a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectLink {
    pub repository_id: String,
    /// Commit the project was last synced to; `None` until the first sync.
    pub last_synced_sha: Option<String>,
}

/// Opaque key-value facts the sync service reads and writes:
/// `{repositoryId, lastSyncedSha}` per project and a token per user.
pub trait SyncStore: Send + Sync {
    fn project_link(&self, project_id: &str) -> Result<Option<ProjectLink>, StoreError>;

    /// Link (or relink) a repository; resets `last_synced_sha`.
    fn set_project_repo(&self, project_id: &str, repository_id: &str) -> Result<(), StoreError>;

    fn set_last_synced_sha(&self, project_id: &str, sha: &str) -> Result<(), StoreError>;

    fn clear_project_repo(&self, project_id: &str) -> Result<(), StoreError>;

    /// Stored credential; an empty string counts as absent.
    fn user_token(&self, user_id: &str) -> Result<Option<String>, StoreError>;

    fn set_user_token(&self, user_id: &str, token: &str) -> Result<(), StoreError>;
}
