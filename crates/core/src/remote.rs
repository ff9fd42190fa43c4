//! Seam to a git-compatible remote repository service.
//!
//! Every method is one rate-limited remote call. Composite sequences
//! (blobs -> tree -> commit -> ref) live in `devcell-sync`, never here.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Path + object id pair, used both for new tree entries and tree listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
    pub path: String,
    pub sha: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteCommit {
    pub sha: String,
    pub tree_sha: String,
    pub parent_shas: Vec<String>,
    pub message: String,
    pub date: Option<DateTime<Utc>>,
}

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("remote object not found: {0}")]
    NotFound(String),

    /// Ref update rejected because the branch no longer points at the
    /// expected parent.
    #[error("non-fast-forward update of {branch}")]
    NonFastForward { branch: String },

    #[error("rate limited by remote: {0}")]
    RateLimited(String),

    #[error("remote rejected credentials")]
    Unauthorized,

    #[error("remote unavailable: {0}")]
    Transient(String),

    #[error("remote rejected request: {0}")]
    Rejected(String),
}

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

#[async_trait]
pub trait RemoteRepository: Send + Sync {
    /// Map a stable repository id to the name used in every other call.
    async fn resolve_repo(&self, repo_id: &str) -> RemoteResult<Option<String>>;

    /// Commit sha the branch points to, if the branch exists.
    async fn branch_head(&self, repo: &str, branch: &str) -> RemoteResult<Option<String>>;

    async fn get_commit(&self, repo: &str, sha: &str) -> RemoteResult<Option<RemoteCommit>>;

    async fn create_blob(&self, repo: &str, content: &[u8]) -> RemoteResult<String>;

    /// New tree = `base_tree` with `entries` upserted.
    async fn create_tree(
        &self,
        repo: &str,
        base_tree: &str,
        entries: &[TreeEntry],
    ) -> RemoteResult<String>;

    async fn create_commit(
        &self,
        repo: &str,
        message: &str,
        tree: &str,
        parent: &str,
    ) -> RemoteResult<String>;

    /// Fast-forward-only ref update: must fail with
    /// [`RemoteError::NonFastForward`] unless the branch still points at
    /// `expected_parent`.
    async fn update_ref(
        &self,
        repo: &str,
        branch: &str,
        new_sha: &str,
        expected_parent: &str,
    ) -> RemoteResult<()>;

    /// Recursive listing of blob entries reachable from `tree_sha`.
    async fn list_tree(&self, repo: &str, tree_sha: &str) -> RemoteResult<Vec<TreeEntry>>;

    async fn get_blob(&self, repo: &str, sha: &str) -> RemoteResult<Vec<u8>>;
}

/// Builds the remote client a user's requests go through.
///
/// `token` is the user's stored access token; connectors that need none
/// (local bare repositories) ignore it.
pub trait RemoteConnector: Send + Sync {
    fn connect(&self, token: Option<&str>) -> RemoteResult<Arc<dyn RemoteRepository>>;
}
