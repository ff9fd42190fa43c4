use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A file keyed by its repository path (see [`crate::paths::normalize_repo_path`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoFile {
    pub path: String,
    pub content: String,
}

impl RepoFile {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }
}

/// Local changes relative to the last known remote state.
///
/// Local edits mutate this optimistically; [`ChangedFilesSnapshot::compute`]
/// replaces it wholesale when the remote head is fetched again.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedFilesSnapshot {
    pub modified: BTreeSet<String>,
    pub created: BTreeSet<String>,
    pub deleted: BTreeSet<String>,
}

impl ChangedFilesSnapshot {
    /// Three-way classification of `local` against `remote`.
    pub fn compute(local: &[RepoFile], remote: &[RepoFile]) -> Self {
        let remote_digests: BTreeMap<&str, [u8; 32]> = remote
            .iter()
            .map(|f| (f.path.as_str(), digest(&f.content)))
            .collect();
        let local_paths: BTreeSet<&str> = local.iter().map(|f| f.path.as_str()).collect();

        let mut snapshot = Self::default();
        for file in local {
            match remote_digests.get(file.path.as_str()) {
                None => {
                    snapshot.created.insert(file.path.clone());
                }
                Some(remote_digest) if *remote_digest != digest(&file.content) => {
                    snapshot.modified.insert(file.path.clone());
                }
                Some(_) => {}
            }
        }
        for path in remote_digests.keys() {
            if !local_paths.contains(path) {
                snapshot.deleted.insert((*path).to_string());
            }
        }
        snapshot
    }

    pub fn is_empty(&self) -> bool {
        self.modified.is_empty() && self.created.is_empty() && self.deleted.is_empty()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn record_saved(&mut self, path: &str) {
        if !self.created.contains(path) {
            self.modified.insert(path.to_string());
        }
    }

    pub fn record_created(&mut self, path: &str) {
        // Re-creating a file deleted since the last sync is an edit of it.
        if self.deleted.remove(path) {
            self.modified.insert(path.to_string());
        } else {
            self.created.insert(path.to_string());
        }
    }

    pub fn record_deleted(&mut self, path: &str) {
        self.modified.remove(path);
        if !self.created.remove(path) {
            self.deleted.insert(path.to_string());
        }
    }

    /// Deletes under a removed folder: every tracked path below `prefix/`.
    pub fn record_deleted_prefix(&mut self, prefix: &str, known_paths: &[String]) {
        let dir = format!("{}/", prefix.trim_end_matches('/'));
        for path in known_paths {
            if path.starts_with(&dir) {
                self.record_deleted(path);
            }
        }
    }

    pub fn record_renamed(&mut self, from: &str, to: &str) {
        self.record_deleted(from);
        self.record_created(to);
    }
}

fn digest(content: &str) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(content.as_bytes()));
    out
}
