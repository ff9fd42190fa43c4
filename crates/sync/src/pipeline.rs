use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::try_join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use devcell_core::paths::normalize_repo_path;
use devcell_core::remote::{RemoteError, RemoteRepository, TreeEntry};
use devcell_core::RepoFile;

use crate::error::{SyncError, SyncResult};

/// Tunables for one pipeline instance.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub branch: String,
    /// Files per blob-creation batch.
    pub blob_batch_size: usize,
    /// Blobs fetched concurrently per batch in [`RepositorySyncPipeline::get_latest_files`].
    pub fetch_batch_size: usize,
    /// Pause between batches; backpressure against the remote rate limit.
    pub batch_delay: Duration,
    /// Container directory stripped from file paths before they enter the repository.
    pub project_root: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            branch: "main".to_string(),
            blob_batch_size: 7,
            fetch_batch_size: 10,
            batch_delay: Duration::from_secs(1),
            project_root: "/project".to_string(),
        }
    }
}

/// Result of a successful [`RepositorySyncPipeline::create_commit`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitOutcome {
    pub commit_sha: String,
    pub parent_sha: String,
    pub tree_sha: String,
    pub file_count: usize,
}

/// Divergence check result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullStatus {
    pub needs_pull: bool,
    pub remote_sha: String,
    pub message: Option<String>,
    pub date: Option<DateTime<Utc>>,
}

/// Turns an in-memory file set into one fast-forward commit on a remote
/// repository, and reads remote state back for divergence checks.
///
/// A started `create_commit` runs to completion or hard failure. Objects
/// written before a failure are unreferenced and therefore inert; nothing is
/// retried.
pub struct RepositorySyncPipeline {
    remote: Arc<dyn RemoteRepository>,
    config: PipelineConfig,
}

impl RepositorySyncPipeline {
    pub fn new(remote: Arc<dyn RemoteRepository>, config: PipelineConfig) -> Self {
        Self { remote, config }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    async fn resolve(&self, repo_id: &str) -> SyncResult<String> {
        self.remote
            .resolve_repo(repo_id)
            .await?
            .ok_or_else(|| SyncError::RepositoryNotFound(repo_id.to_string()))
    }

    /// Current branch head and its tree.
    async fn head(&self, repo: &str) -> SyncResult<(String, String)> {
        let branch = &self.config.branch;
        let head = self
            .remote
            .branch_head(repo, branch)
            .await
            .map_err(|e| SyncError::RefFetchFailed(format!("{repo}@{branch}: {e}")))?
            .ok_or_else(|| SyncError::RefFetchFailed(format!("{repo} has no branch {branch}")))?;
        let commit = self
            .remote
            .get_commit(repo, &head)
            .await
            .map_err(|e| SyncError::RefFetchFailed(format!("commit {head}: {e}")))?
            .ok_or_else(|| SyncError::RefFetchFailed(format!("commit {head} missing")))?;
        Ok((head, commit.tree_sha))
    }

    pub async fn create_commit(
        &self,
        repo_id: &str,
        files: &[RepoFile],
        message: &str,
    ) -> SyncResult<CommitOutcome> {
        let repo = self.resolve(repo_id).await?;
        let (parent_sha, base_tree) = self.head(&repo).await?;
        debug!(repo = %repo, parent = %parent_sha, files = files.len(), "starting sync");

        let batch_size = self.config.blob_batch_size.max(1);
        let mut entries = Vec::with_capacity(files.len());
        for (batch_index, batch) in files.chunks(batch_size).enumerate() {
            if batch_index > 0 {
                tokio::time::sleep(self.config.batch_delay).await;
            }
            for file in batch {
                let path = normalize_repo_path(&file.path, &self.config.project_root);
                let sha = self
                    .remote
                    .create_blob(&repo, file.content.as_bytes())
                    .await
                    .map_err(|source| SyncError::BlobCreateFailed {
                        path: path.clone(),
                        source,
                    })?;
                entries.push(TreeEntry { path, sha });
            }
            debug!(repo = %repo, batch = batch_index, size = batch.len(), "blob batch written");
        }

        let tree_sha = self
            .remote
            .create_tree(&repo, &base_tree, &entries)
            .await
            .map_err(SyncError::TreeCreateFailed)?;
        let commit_sha = self
            .remote
            .create_commit(&repo, message, &tree_sha, &parent_sha)
            .await
            .map_err(SyncError::CommitCreateFailed)?;

        match self
            .remote
            .update_ref(&repo, &self.config.branch, &commit_sha, &parent_sha)
            .await
        {
            Ok(()) => {}
            Err(RemoteError::NonFastForward { branch }) => {
                warn!(repo = %repo, branch = %branch, commit = %commit_sha, "ref update rejected");
                return Err(SyncError::NonFastForward { branch });
            }
            Err(e) => return Err(e.into()),
        }

        info!(repo = %repo, commit = %commit_sha, parent = %parent_sha, files = files.len(), "synced");
        Ok(CommitOutcome {
            commit_sha,
            parent_sha,
            tree_sha,
            file_count: files.len(),
        })
    }

    /// `needs_pull` unless `local_sha` is present and equals the remote head.
    pub async fn check_if_pull_needed(
        &self,
        repo_id: &str,
        local_sha: Option<&str>,
    ) -> SyncResult<PullStatus> {
        let repo = self.resolve(repo_id).await?;
        let branch = &self.config.branch;
        let remote_sha = self
            .remote
            .branch_head(&repo, branch)
            .await
            .map_err(|e| SyncError::RefFetchFailed(format!("{repo}@{branch}: {e}")))?
            .ok_or_else(|| SyncError::RefFetchFailed(format!("{repo} has no branch {branch}")))?;
        let commit = self.remote.get_commit(&repo, &remote_sha).await?;

        Ok(PullStatus {
            needs_pull: local_sha != Some(remote_sha.as_str()),
            message: commit.as_ref().map(|c| c.message.clone()),
            date: commit.and_then(|c| c.date),
            remote_sha,
        })
    }

    /// Text content of every file at the remote branch head.
    pub async fn get_latest_files(&self, repo_id: &str) -> SyncResult<Vec<RepoFile>> {
        let repo = self.resolve(repo_id).await?;
        let (_, tree) = self.head(&repo).await?;
        let entries = self.remote.list_tree(&repo, &tree).await?;

        let batch_size = self.config.fetch_batch_size.max(1);
        let mut files = Vec::with_capacity(entries.len());
        for (batch_index, batch) in entries.chunks(batch_size).enumerate() {
            if batch_index > 0 {
                tokio::time::sleep(self.config.batch_delay).await;
            }
            let (remote, repo_name) = (&self.remote, repo.as_str());
            let fetched = try_join_all(batch.iter().map(|entry| async move {
                let bytes = remote.get_blob(repo_name, &entry.sha).await?;
                Ok::<_, SyncError>(RepoFile::new(
                    entry.path.clone(),
                    String::from_utf8_lossy(&bytes).into_owned(),
                ))
            }))
            .await?;
            files.extend(fetched);
        }
        debug!(repo = %repo, files = files.len(), "fetched remote files");
        Ok(files)
    }
}
