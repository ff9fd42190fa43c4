use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::DateTime;
use gix::ObjectId;
use tracing::{debug, info};

use devcell_core::remote::{
    RemoteCommit, RemoteConnector, RemoteError, RemoteRepository, RemoteResult, TreeEntry,
};

use crate::error::{GitStorageError, Result};
use crate::ops::{self, gix_err};

/// [`RemoteRepository`] over repositories on local disk.
///
/// Repository names resolve to `<root>/<name>.git` (bare) or `<root>/<name>`.
/// Objects are written straight into the object database; branch updates go
/// through a compare-and-swap ref transaction, so concurrent writers see
/// [`RemoteError::NonFastForward`] exactly like they would from a hosted
/// remote.
#[derive(Debug, Clone)]
pub struct NativeRemote {
    repos_root: PathBuf,
}

impl NativeRemote {
    pub fn new(repos_root: impl Into<PathBuf>) -> Self {
        Self {
            repos_root: repos_root.into(),
        }
    }

    fn repo_dir(&self, name: &str) -> Option<PathBuf> {
        if name.is_empty() || name.split('/').any(|s| s.is_empty() || s == "." || s == "..") {
            return None;
        }
        let bare = self.repos_root.join(format!("{name}.git"));
        if bare.is_dir() {
            return Some(bare);
        }
        let plain = self.repos_root.join(name);
        plain.is_dir().then_some(plain)
    }

    /// Run a blocking gix operation against repository `name`.
    async fn with_repo<T, F>(&self, name: &str, op: F) -> RemoteResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&gix::Repository) -> Result<T> + Send + 'static,
    {
        let dir = self
            .repo_dir(name)
            .ok_or_else(|| RemoteError::NotFound(format!("repository {name}")))?;
        tokio::task::spawn_blocking(move || -> Result<T> {
            let repo = ops::open_repo(&dir)?;
            op(&repo)
        })
        .await
        .map_err(|e| RemoteError::Transient(format!("git task failed: {e}")))?
        .map_err(RemoteError::from)
    }
}

fn branch_ref(branch: &str) -> String {
    format!("refs/heads/{branch}")
}

#[async_trait]
impl RemoteRepository for NativeRemote {
    async fn resolve_repo(&self, repo_id: &str) -> RemoteResult<Option<String>> {
        Ok(self.repo_dir(repo_id).map(|_| repo_id.to_string()))
    }

    async fn branch_head(&self, repo: &str, branch: &str) -> RemoteResult<Option<String>> {
        let ref_name = branch_ref(branch);
        self.with_repo(repo, move |r| {
            Ok(ops::find_ref_tip(r, &ref_name)?.map(|id| id.to_string()))
        })
        .await
    }

    async fn get_commit(&self, repo: &str, sha: &str) -> RemoteResult<Option<RemoteCommit>> {
        let Ok(id) = ops::parse_id(sha) else {
            return Ok(None);
        };
        self.with_repo(repo, move |r| {
            let Some(object) = r.try_find_object(id).map_err(gix_err)? else {
                return Ok(None);
            };
            let commit = object.try_into_commit().map_err(gix_err)?;
            let tree = commit.tree_id().map_err(gix_err)?;
            let message = String::from_utf8_lossy(commit.message_raw_sloppy().as_ref())
                .trim_end()
                .to_string();
            let seconds = commit.time().map_err(gix_err)?.seconds;
            Ok(Some(RemoteCommit {
                sha: id.to_string(),
                tree_sha: tree.to_string(),
                parent_shas: commit.parent_ids().map(|p| p.to_string()).collect(),
                message,
                date: DateTime::from_timestamp(seconds, 0),
            }))
        })
        .await
    }

    async fn create_blob(&self, repo: &str, content: &[u8]) -> RemoteResult<String> {
        let content = content.to_vec();
        self.with_repo(repo, move |r| {
            let id = r.write_blob(&content).map_err(gix_err)?.detach();
            debug!(blob = %id, bytes = content.len(), "wrote blob");
            Ok(id.to_string())
        })
        .await
    }

    async fn create_tree(
        &self,
        repo: &str,
        base_tree: &str,
        entries: &[TreeEntry],
    ) -> RemoteResult<String> {
        let base = ops::parse_id(base_tree)?;
        let entries = entries
            .iter()
            .map(|e| Ok((e.path.clone(), ops::parse_id(&e.sha)?)))
            .collect::<Result<Vec<(String, ObjectId)>>>()?;
        self.with_repo(repo, move |r| {
            Ok(ops::write_tree_with(r, base, &entries)?.to_string())
        })
        .await
    }

    async fn create_commit(
        &self,
        repo: &str,
        message: &str,
        tree: &str,
        parent: &str,
    ) -> RemoteResult<String> {
        let tree = ops::parse_id(tree)?;
        let parent = ops::parse_id(parent)?;
        let message = message.to_string();
        self.with_repo(repo, move |r| {
            Ok(ops::write_commit(r, tree, Some(parent), &message)?.to_string())
        })
        .await
    }

    async fn update_ref(
        &self,
        repo: &str,
        branch: &str,
        new_sha: &str,
        expected_parent: &str,
    ) -> RemoteResult<()> {
        let new_tip = ops::parse_id(new_sha)?;
        let expected = ops::parse_id(expected_parent)?;
        let ref_name = branch_ref(branch);
        let branch_name = branch.to_string();

        let moved = self
            .with_repo(repo, move |r| {
                // Only a direct child of the current tip fast-forwards.
                let commit = r.find_commit(new_tip).map_err(gix_err)?;
                if commit.parent_ids().next().map(|p| p.detach()) != Some(expected) {
                    return Ok(false);
                }
                match ops::set_ref_tip(r, &ref_name, Some(expected), new_tip, "devcell sync") {
                    Ok(()) => Ok(true),
                    Err(err) => {
                        let current = ops::find_ref_tip(r, &ref_name)?.map(|id| id.detach());
                        if current != Some(expected) {
                            Ok(false)
                        } else {
                            Err(err)
                        }
                    }
                }
            })
            .await?;

        if !moved {
            return Err(RemoteError::NonFastForward {
                branch: branch_name,
            });
        }
        info!(repo, branch, commit = new_sha, "advanced branch");
        Ok(())
    }

    async fn list_tree(&self, repo: &str, tree_sha: &str) -> RemoteResult<Vec<TreeEntry>> {
        let tree = ops::parse_id(tree_sha)?;
        self.with_repo(repo, move |r| {
            Ok(ops::list_blobs(r, tree)?
                .into_iter()
                .map(|(path, id)| TreeEntry {
                    path,
                    sha: id.to_string(),
                })
                .collect())
        })
        .await
    }

    async fn get_blob(&self, repo: &str, sha: &str) -> RemoteResult<Vec<u8>> {
        let id = ops::parse_id(sha)?;
        let sha = sha.to_string();
        self.with_repo(repo, move |r| {
            ops::read_blob(r, id)?.ok_or(GitStorageError::InvalidObjectId(sha))
        })
        .await
    }
}

/// Every user shares the same on-disk repositories; tokens are ignored.
#[derive(Debug, Clone)]
pub struct NativeConnector {
    remote: Arc<NativeRemote>,
}

impl NativeConnector {
    pub fn new(repos_root: impl AsRef<Path>) -> Self {
        Self {
            remote: Arc::new(NativeRemote::new(repos_root.as_ref())),
        }
    }
}

impl RemoteConnector for NativeConnector {
    fn connect(&self, _token: Option<&str>) -> RemoteResult<Arc<dyn RemoteRepository>> {
        Ok(self.remote.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{init_test_repo, run_git};

    fn fixture() -> (tempfile::TempDir, NativeRemote) {
        let tmp = tempfile::tempdir().unwrap();
        init_test_repo(&tmp.path().join("site"));
        let remote = NativeRemote::new(tmp.path());
        (tmp, remote)
    }

    #[tokio::test]
    async fn resolves_existing_repositories_only() {
        let (_tmp, remote) = fixture();
        assert_eq!(remote.resolve_repo("site").await.unwrap().as_deref(), Some("site"));
        assert_eq!(remote.resolve_repo("missing").await.unwrap(), None);
        assert_eq!(remote.resolve_repo("../site").await.unwrap(), None);
    }

    #[tokio::test]
    async fn commit_round_trip_through_trait() {
        let (tmp, remote) = fixture();
        let head = remote.branch_head("site", "main").await.unwrap().unwrap();
        let commit = remote.get_commit("site", &head).await.unwrap().unwrap();
        assert_eq!(commit.message, "init");
        assert!(commit.date.is_some());

        let blob = remote.create_blob("site", b"<h1>hi</h1>\n").await.unwrap();
        let tree = remote
            .create_tree(
                "site",
                &commit.tree_sha,
                &[TreeEntry {
                    path: "public/index.html".into(),
                    sha: blob,
                }],
            )
            .await
            .unwrap();
        let new_commit = remote
            .create_commit("site", "Add index", &tree, &head)
            .await
            .unwrap();
        remote
            .update_ref("site", "main", &new_commit, &head)
            .await
            .unwrap();

        assert_eq!(
            remote.branch_head("site", "main").await.unwrap().as_deref(),
            Some(new_commit.as_str())
        );
        let mut paths: Vec<String> = remote
            .list_tree("site", &tree)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.path)
            .collect();
        paths.sort();
        assert_eq!(paths, vec!["README.md", "public/index.html", "src/main.rs"]);

        // The working copy sees the commit as a regular git commit.
        run_git(&tmp.path().join("site"), &["cat-file", "-e", &new_commit]);
    }

    #[tokio::test]
    async fn stale_parent_is_non_fast_forward() {
        let (_tmp, remote) = fixture();
        let head = remote.branch_head("site", "main").await.unwrap().unwrap();
        let commit = remote.get_commit("site", &head).await.unwrap().unwrap();

        let first = remote
            .create_commit("site", "first", &commit.tree_sha, &head)
            .await
            .unwrap();
        let second = remote
            .create_commit("site", "second", &commit.tree_sha, &head)
            .await
            .unwrap();
        remote.update_ref("site", "main", &first, &head).await.unwrap();

        let err = remote
            .update_ref("site", "main", &second, &head)
            .await
            .unwrap_err();
        assert!(
            matches!(err, RemoteError::NonFastForward { .. }),
            "expected NonFastForward, got: {err}"
        );
        assert_eq!(
            remote.branch_head("site", "main").await.unwrap().as_deref(),
            Some(first.as_str())
        );
    }

    #[tokio::test]
    async fn get_blob_reads_back_content() {
        let (_tmp, remote) = fixture();
        let sha = remote.create_blob("site", b"payload").await.unwrap();
        assert_eq!(remote.get_blob("site", &sha).await.unwrap(), b"payload");
    }

    #[test]
    fn connector_shares_one_remote() {
        let tmp = tempfile::tempdir().unwrap();
        let connector = NativeConnector::new(tmp.path());
        assert!(connector.connect(None).is_ok());
        assert!(connector.connect(Some("ignored")).is_ok());
    }
}
