//! Project file tree: snapshots, live refresh and CRUD through the container.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use devcell_core::paths::{file_name, join, normalize_repo_path, parent_dir, resolve_in_root};
use devcell_core::{FileNode, RepoFile, SessionError, SessionResult, build_file_tree};
use devcell_runtime_config::ContainerSettings;

use crate::container::{ContainerRuntime, FsEvent, FsEventKind};

/// Mirrors one project's directory for clients.
///
/// Every snapshot is a full rebuild from a container listing, so two reads
/// without an intervening change return equal trees. All client paths are
/// resolved against the project root before reaching the container.
pub struct FileTreeMirror {
    container: Arc<dyn ContainerRuntime>,
    root: String,
    excluded: Vec<String>,
    archive_excluded: Vec<String>,
    max_file_bytes: usize,
}

impl FileTreeMirror {
    pub fn new(
        container: Arc<dyn ContainerRuntime>,
        settings: &ContainerSettings,
        max_file_bytes: usize,
    ) -> Self {
        Self {
            root: container.project_root().to_string(),
            container,
            excluded: settings.excluded_dirs.clone(),
            archive_excluded: settings.archive_excluded_dirs.clone(),
            max_file_bytes,
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn resolve(&self, path: &str) -> SessionResult<String> {
        resolve_in_root(&self.root, path)
    }

    /// Repository path for an absolute container path.
    pub fn repo_path(&self, path: &str) -> String {
        normalize_repo_path(path, &self.root)
    }

    pub async fn get_file_tree(&self) -> SessionResult<Vec<FileNode>> {
        snapshot(self.container.as_ref(), &self.root, &self.excluded).await
    }

    /// Watch the root and each top-level directory, pushing a fresh snapshot
    /// into `on_change` after structural events. Directories created at the
    /// top level later are picked up as they appear.
    pub async fn start_watching(
        &self,
        on_change: mpsc::UnboundedSender<Vec<FileNode>>,
    ) -> SessionResult<WatchSubscription> {
        let (tx, mut rx) = mpsc::unbounded_channel::<FsEvent>();
        let mut handles = vec![self.container.watch_dir(&self.root, tx.clone()).await?];

        let tree = self.get_file_tree().await?;
        for node in tree.iter().filter(|n| n.is_folder()) {
            match self.container.watch_dir(node.id(), tx.clone()).await {
                Ok(handle) => handles.push(handle),
                Err(e) => warn!(dir = node.id(), error = %e, "failed to watch directory"),
            }
        }
        info!(root = %self.root, watched = handles.len(), "file tree watch started");

        let container = self.container.clone();
        let root = self.root.clone();
        let excluded = self.excluded.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if !event.kind.is_structural() {
                    continue;
                }
                let mut created = vec![event];
                // Coalesce a burst into one refresh.
                while let Ok(next) = rx.try_recv() {
                    created.push(next);
                }
                created.retain(|e| e.kind == FsEventKind::Created && parent_dir(&e.path) == root);

                let tree = match snapshot(container.as_ref(), &root, &excluded).await {
                    Ok(tree) => tree,
                    Err(e) => {
                        warn!(root = %root, error = %e, "file tree refresh failed");
                        continue;
                    }
                };
                for event in &created {
                    if FileNode::find(&tree, &event.path).is_some_and(FileNode::is_folder) {
                        match container.watch_dir(&event.path, tx.clone()).await {
                            Ok(handle) => handles.push(handle),
                            Err(e) => warn!(dir = %event.path, error = %e, "failed to watch directory"),
                        }
                    }
                }
                if on_change.send(tree).is_err() {
                    break;
                }
            }
            debug!(root = %root, "file tree watch stopped");
        });

        Ok(WatchSubscription { task })
    }

    pub async fn get_file(&self, path: &str) -> SessionResult<String> {
        let path = self.resolve(path)?;
        let bytes = self.container.read_file(&path).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Write `content`; bodies over the size limit are refused before
    /// anything touches the container.
    pub async fn save_file(&self, path: &str, content: &str) -> SessionResult<Vec<FileNode>> {
        let path = self.resolve(path)?;
        if content.len() > self.max_file_bytes {
            return Err(SessionError::ResourceLimit(format!(
                "{path} is {} bytes, limit is {}",
                content.len(),
                self.max_file_bytes
            )));
        }
        self.container.write_file(&path, content.as_bytes()).await?;
        self.settle(&path).await
    }

    pub async fn create_file(&self, path: &str) -> SessionResult<Vec<FileNode>> {
        let path = self.resolve(path)?;
        self.container.write_file(&path, b"").await?;
        self.settle(&path).await
    }

    pub async fn create_folder(&self, path: &str) -> SessionResult<Vec<FileNode>> {
        let path = self.resolve(path)?;
        self.container.make_dir(&path).await?;
        self.settle(&path).await
    }

    /// Rename within the same directory. Returns the new path and tree.
    pub async fn rename_file(
        &self,
        path: &str,
        new_name: &str,
    ) -> SessionResult<(String, Vec<FileNode>)> {
        if new_name.is_empty() || new_name.contains('/') || new_name == "." || new_name == ".." {
            return Err(SessionError::InvalidRequest(format!(
                "invalid file name: {new_name:?}"
            )));
        }
        let from = self.resolve(path)?;
        let to = self.resolve(&join(parent_dir(&from), new_name))?;
        self.relocate(&from, &to).await
    }

    /// Move a file into `target_dir`, keeping its name.
    pub async fn move_file(
        &self,
        path: &str,
        target_dir: &str,
    ) -> SessionResult<(String, Vec<FileNode>)> {
        let from = self.resolve(path)?;
        let dir = self.resolve(target_dir)?;
        let to = self.resolve(&join(&dir, file_name(&from)))?;
        self.relocate(&from, &to).await
    }

    pub async fn delete_file(&self, path: &str) -> SessionResult<Vec<FileNode>> {
        let path = self.resolve(path)?;
        self.container.remove(&path, false).await?;
        self.settle(parent_dir(&path)).await
    }

    pub async fn delete_folder(&self, path: &str) -> SessionResult<Vec<FileNode>> {
        let path = self.resolve(path)?;
        if path == self.root {
            return Err(SessionError::PermissionDenied(
                "refusing to delete the project root".into(),
            ));
        }
        self.container.remove(&path, true).await?;
        self.settle(parent_dir(&path)).await
    }

    /// Gzipped tar of the project, base64 encoded. Heavy dependency
    /// directories are left out and the temporary archive is removed.
    pub async fn get_files_for_download(&self) -> SessionResult<String> {
        let name = format!(".devcell-download-{}.tar.gz", uuid::Uuid::new_v4());
        let archive = join(parent_dir(&self.root), &name);

        let mut args = vec![
            "tar".to_string(),
            "-czf".to_string(),
            format!("../{name}"),
        ];
        args.extend(self.archive_excluded.iter().map(|d| format!("--exclude={d}")));
        args.push(".".to_string());

        let output = self.container.run_command(&self.root, &args).await?;
        if !output.success() {
            let _ = self.container.remove(&archive, false).await;
            return Err(SessionError::Internal(format!(
                "archive failed ({}): {}",
                output.status,
                output.stderr.trim()
            )));
        }

        let bytes = self.container.read_file(&archive).await;
        if let Err(e) = self.container.remove(&archive, false).await {
            warn!(archive = %archive, error = %e, "failed to remove temporary archive");
        }
        let bytes = bytes?;
        debug!(bytes = bytes.len(), "built project archive");
        Ok(STANDARD.encode(bytes))
    }

    /// Every project file as a repository-relative [`RepoFile`], skipping
    /// the tree exclusions and dependency directories.
    pub async fn read_all_files(&self) -> SessionResult<Vec<RepoFile>> {
        let mut excluded = self.excluded.clone();
        excluded.extend(self.archive_excluded.iter().cloned());
        let entries = self.container.list_paths(&self.root, &excluded).await?;

        let mut files = Vec::new();
        for entry in entries.iter().filter(|e| !e.is_dir) {
            let path = join(&self.root, &entry.path);
            let bytes = self.container.read_file(&path).await?;
            files.push(RepoFile::new(
                entry.path.clone(),
                String::from_utf8_lossy(&bytes).into_owned(),
            ));
        }
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }

    async fn relocate(&self, from: &str, to: &str) -> SessionResult<(String, Vec<FileNode>)> {
        if from == to {
            return Ok((to.to_string(), self.get_file_tree().await?));
        }
        let content = self.container.read_file(from).await?;
        self.container.write_file(to, &content).await?;
        self.container.remove(from, false).await?;
        let tree = self.settle(to).await?;
        Ok((to.to_string(), tree))
    }

    /// Post-write bookkeeping: ownership then a fresh snapshot.
    async fn settle(&self, path: &str) -> SessionResult<Vec<FileNode>> {
        if let Err(e) = self.container.fix_ownership(path).await {
            warn!(path, error = %e, "failed to fix ownership");
        }
        self.get_file_tree().await
    }
}

async fn snapshot(
    container: &dyn ContainerRuntime,
    root: &str,
    excluded: &[String],
) -> SessionResult<Vec<FileNode>> {
    let entries = container.list_paths(root, excluded).await?;
    Ok(build_file_tree(root, &entries))
}

/// Live watch of a project tree; dropping it stops refreshes and releases
/// every directory watch.
pub struct WatchSubscription {
    task: JoinHandle<()>,
}

impl Drop for WatchSubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}
