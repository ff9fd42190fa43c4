//! In-memory remote and store for tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::time::Instant;

use devcell_core::remote::{
    RemoteCommit, RemoteConnector, RemoteError, RemoteRepository, RemoteResult, TreeEntry,
};
use devcell_core::{ProjectId, UserId};

use crate::store::{ProjectLink, StoreError, SyncStore};

#[derive(Default)]
struct RepoState {
    branches: HashMap<String, String>,
    commits: HashMap<String, RemoteCommit>,
    trees: HashMap<String, BTreeMap<String, String>>,
    blobs: HashMap<String, Vec<u8>>,
}

#[derive(Default)]
struct State {
    ids: HashMap<String, String>,
    repos: HashMap<String, RepoState>,
    blob_calls: Vec<Instant>,
    fail_blob_after: Option<usize>,
    latency: Duration,
    next: u64,
}

impl State {
    fn repo(&mut self, name: &str) -> RemoteResult<&mut RepoState> {
        self.repos
            .get_mut(name)
            .ok_or_else(|| RemoteError::NotFound(name.to_string()))
    }

    fn next_id(&mut self, prefix: &str) -> String {
        self.next += 1;
        format!("{prefix}{:04}", self.next)
    }
}

/// Remote with fast-forward enforcement and call recording.
#[derive(Default)]
pub struct MemoryRemote {
    state: Mutex<State>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create `name` (reachable as `repo_id`) with one commit on `main`.
    pub fn seed_repo(&self, repo_id: &str, name: &str, files: &[(&str, &str)]) {
        self.seed_empty_repo(repo_id, name);
        let mut state = self.state.lock().unwrap();
        let tree_sha = state.next_id("tree");
        let commit_sha = state.next_id("commit");
        let repo = state.repos.get_mut(name).unwrap();
        let mut tree = BTreeMap::new();
        for (path, content) in files {
            let sha = blob_sha(content.as_bytes());
            repo.blobs.insert(sha.clone(), content.as_bytes().to_vec());
            tree.insert(path.to_string(), sha);
        }
        repo.trees.insert(tree_sha.clone(), tree);
        repo.commits.insert(
            commit_sha.clone(),
            RemoteCommit {
                sha: commit_sha.clone(),
                tree_sha,
                parent_shas: Vec::new(),
                message: "Initial commit".to_string(),
                date: Some(chrono::Utc::now()),
            },
        );
        repo.branches.insert("main".to_string(), commit_sha);
    }

    /// Repository without any branch.
    pub fn seed_empty_repo(&self, repo_id: &str, name: &str) {
        let mut state = self.state.lock().unwrap();
        state.ids.insert(repo_id.to_string(), name.to_string());
        state.repos.entry(name.to_string()).or_default();
    }

    /// Every call sleeps this long before touching state.
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().unwrap().latency = latency;
    }

    /// Let `n` blob creations succeed, fail every one after.
    pub fn fail_blob_after(&self, n: usize) {
        self.state.lock().unwrap().fail_blob_after = Some(n);
    }

    pub fn blob_calls(&self) -> Vec<Instant> {
        self.state.lock().unwrap().blob_calls.clone()
    }

    pub fn head(&self, name: &str, branch: &str) -> Option<String> {
        let state = self.state.lock().unwrap();
        state.repos.get(name)?.branches.get(branch).cloned()
    }

    pub fn commit(&self, sha: &str) -> Option<RemoteCommit> {
        let state = self.state.lock().unwrap();
        state
            .repos
            .values()
            .find_map(|r| r.commits.get(sha).cloned())
    }

    pub fn commit_count(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.repos.values().map(|r| r.commits.len()).sum()
    }

    pub fn tree_paths(&self, tree_sha: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .repos
            .values()
            .find_map(|r| r.trees.get(tree_sha))
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Simulate a push from elsewhere: a new commit on `branch` that rewrites `path`.
    pub fn push_external(&self, name: &str, branch: &str, path: &str, content: &str) -> String {
        let mut state = self.state.lock().unwrap();
        let tree_sha = state.next_id("tree");
        let commit_sha = state.next_id("commit");
        let repo = state.repos.get_mut(name).unwrap();
        let parent = repo.branches.get(branch).cloned().unwrap();
        let mut tree = repo.trees[&repo.commits[&parent].tree_sha].clone();
        let sha = blob_sha(content.as_bytes());
        repo.blobs.insert(sha.clone(), content.as_bytes().to_vec());
        tree.insert(path.to_string(), sha);
        repo.trees.insert(tree_sha.clone(), tree);
        repo.commits.insert(
            commit_sha.clone(),
            RemoteCommit {
                sha: commit_sha.clone(),
                tree_sha,
                parent_shas: vec![parent],
                message: format!("Update {path}"),
                date: Some(chrono::Utc::now()),
            },
        );
        repo.branches.insert(branch.to_string(), commit_sha.clone());
        commit_sha
    }

    async fn delay(&self) {
        let latency = self.state.lock().unwrap().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

fn blob_sha(content: &[u8]) -> String {
    Sha256::digest(content)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

#[async_trait]
impl RemoteRepository for MemoryRemote {
    async fn resolve_repo(&self, repo_id: &str) -> RemoteResult<Option<String>> {
        self.delay().await;
        Ok(self.state.lock().unwrap().ids.get(repo_id).cloned())
    }

    async fn branch_head(&self, repo: &str, branch: &str) -> RemoteResult<Option<String>> {
        self.delay().await;
        let mut state = self.state.lock().unwrap();
        Ok(state.repo(repo)?.branches.get(branch).cloned())
    }

    async fn get_commit(&self, repo: &str, sha: &str) -> RemoteResult<Option<RemoteCommit>> {
        self.delay().await;
        let mut state = self.state.lock().unwrap();
        Ok(state.repo(repo)?.commits.get(sha).cloned())
    }

    async fn create_blob(&self, repo: &str, content: &[u8]) -> RemoteResult<String> {
        self.delay().await;
        let mut state = self.state.lock().unwrap();
        if let Some(limit) = state.fail_blob_after {
            if state.blob_calls.len() >= limit {
                return Err(RemoteError::RateLimited("blob quota exhausted".into()));
            }
        }
        state.blob_calls.push(Instant::now());
        let sha = blob_sha(content);
        state.repo(repo)?.blobs.insert(sha.clone(), content.to_vec());
        Ok(sha)
    }

    async fn create_tree(
        &self,
        repo: &str,
        base_tree: &str,
        entries: &[TreeEntry],
    ) -> RemoteResult<String> {
        self.delay().await;
        let mut state = self.state.lock().unwrap();
        let sha = state.next_id("tree");
        let repo = state.repo(repo)?;
        let mut tree = repo
            .trees
            .get(base_tree)
            .cloned()
            .ok_or_else(|| RemoteError::Rejected(format!("unknown base tree {base_tree}")))?;
        for entry in entries {
            if !repo.blobs.contains_key(&entry.sha) {
                return Err(RemoteError::Rejected(format!("unknown blob {}", entry.sha)));
            }
            tree.insert(entry.path.clone(), entry.sha.clone());
        }
        repo.trees.insert(sha.clone(), tree);
        Ok(sha)
    }

    async fn create_commit(
        &self,
        repo: &str,
        message: &str,
        tree: &str,
        parent: &str,
    ) -> RemoteResult<String> {
        self.delay().await;
        let mut state = self.state.lock().unwrap();
        let sha = state.next_id("commit");
        let repo = state.repo(repo)?;
        if !repo.trees.contains_key(tree) {
            return Err(RemoteError::Rejected(format!("unknown tree {tree}")));
        }
        repo.commits.insert(
            sha.clone(),
            RemoteCommit {
                sha: sha.clone(),
                tree_sha: tree.to_string(),
                parent_shas: vec![parent.to_string()],
                message: message.to_string(),
                date: Some(chrono::Utc::now()),
            },
        );
        Ok(sha)
    }

    async fn update_ref(
        &self,
        repo: &str,
        branch: &str,
        new_sha: &str,
        expected_parent: &str,
    ) -> RemoteResult<()> {
        self.delay().await;
        let mut state = self.state.lock().unwrap();
        let repo = state.repo(repo)?;
        if repo.branches.get(branch).map(String::as_str) != Some(expected_parent) {
            return Err(RemoteError::NonFastForward {
                branch: branch.to_string(),
            });
        }
        repo.branches.insert(branch.to_string(), new_sha.to_string());
        Ok(())
    }

    async fn list_tree(&self, repo: &str, tree_sha: &str) -> RemoteResult<Vec<TreeEntry>> {
        self.delay().await;
        let mut state = self.state.lock().unwrap();
        let tree = state
            .repo(repo)?
            .trees
            .get(tree_sha)
            .ok_or_else(|| RemoteError::NotFound(tree_sha.to_string()))?;
        Ok(tree
            .iter()
            .map(|(path, sha)| TreeEntry {
                path: path.clone(),
                sha: sha.clone(),
            })
            .collect())
    }

    async fn get_blob(&self, repo: &str, sha: &str) -> RemoteResult<Vec<u8>> {
        self.delay().await;
        let mut state = self.state.lock().unwrap();
        state
            .repo(repo)?
            .blobs
            .get(sha)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(sha.to_string()))
    }
}

/// Hands out one shared [`MemoryRemote`] to any caller with a token.
pub struct MemoryConnector {
    remote: Arc<MemoryRemote>,
}

impl MemoryConnector {
    pub fn new(remote: Arc<MemoryRemote>) -> Self {
        Self { remote }
    }
}

impl RemoteConnector for MemoryConnector {
    fn connect(&self, token: Option<&str>) -> RemoteResult<Arc<dyn RemoteRepository>> {
        token.ok_or(RemoteError::Unauthorized)?;
        Ok(self.remote.clone())
    }
}

/// [`SyncStore`] held in memory.
#[derive(Default)]
pub struct MemorySyncStore {
    links: Mutex<HashMap<ProjectId, ProjectLink>>,
    tokens: Mutex<HashMap<UserId, String>>,
}

impl MemorySyncStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw stored token, including empty strings written by logout.
    pub fn raw_token(&self, user_id: &str) -> Option<String> {
        self.tokens.lock().unwrap().get(user_id).cloned()
    }
}

impl SyncStore for MemorySyncStore {
    fn project_link(&self, project_id: &str) -> Result<Option<ProjectLink>, StoreError> {
        Ok(self.links.lock().unwrap().get(project_id).cloned())
    }

    fn set_project_repo(
        &self,
        project_id: &str,
        repository_id: &str,
    ) -> Result<(), StoreError> {
        self.links.lock().unwrap().insert(
            project_id.to_string(),
            ProjectLink {
                repository_id: repository_id.to_string(),
                last_synced_sha: None,
            },
        );
        Ok(())
    }

    fn set_last_synced_sha(&self, project_id: &str, sha: &str) -> Result<(), StoreError> {
        match self.links.lock().unwrap().get_mut(project_id) {
            Some(link) => {
                link.last_synced_sha = Some(sha.to_string());
                Ok(())
            }
            None => Err(StoreError::Backend(format!("project {project_id} not linked"))),
        }
    }

    fn clear_project_repo(&self, project_id: &str) -> Result<(), StoreError> {
        self.links.lock().unwrap().remove(project_id);
        Ok(())
    }

    fn user_token(&self, user_id: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .tokens
            .lock()
            .unwrap()
            .get(user_id)
            .filter(|t| !t.is_empty())
            .cloned())
    }

    fn set_user_token(&self, user_id: &str, token: &str) -> Result<(), StoreError> {
        self.tokens
            .lock()
            .unwrap()
            .insert(user_id.to_string(), token.to_string());
        Ok(())
    }
}
