//! [`ContainerRuntime`] backed by a host directory per project.
//!
//! Container paths are mapped under `<workspaces_root>/<project_id>`, so
//! `/project/src/a.rs` lives at `<workspaces_root>/<project_id>/project/src/a.rs`.
//! Shells run in a local PTY with the project directory as working directory.

use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use notify::{Event, EventKind, RecursiveMode, Watcher};
use portable_pty::{Child, CommandBuilder, MasterPty, PtySize, native_pty_system};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use devcell_core::{PathEntry, SessionError, SessionResult};
use devcell_runtime_config::ContainerSettings;

use crate::container::{
    CommandOutput, ContainerProvider, ContainerRuntime, FsEvent, FsEventKind, TerminalChannels,
    TerminalControl, TerminalSize, WatchHandle,
};

pub struct LocalContainer {
    workspace: PathBuf,
    project_root: String,
    routing_host: String,
    shell: String,
    owner: Option<(u32, u32)>,
}

impl LocalContainer {
    pub fn new(workspace: impl Into<PathBuf>, settings: &ContainerSettings) -> Self {
        Self {
            workspace: workspace.into(),
            project_root: format!("/{}", settings.project_dir.trim_matches('/')),
            routing_host: settings.routing_host.clone(),
            shell: settings.shell.clone(),
            owner: settings
                .owner_uid
                .map(|uid| (uid, settings.owner_gid.unwrap_or(uid))),
        }
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    fn host_path(&self, path: &str) -> SessionResult<PathBuf> {
        let mut host = self.workspace.clone();
        for component in Path::new(path.trim_start_matches('/')).components() {
            match component {
                Component::Normal(part) => host.push(part),
                Component::CurDir => {}
                _ => {
                    return Err(SessionError::PermissionDenied(format!(
                        "path escapes workspace: {path}"
                    )));
                }
            }
        }
        Ok(host)
    }
}

fn to_container_path(workspace: &Path, host: &Path) -> Option<String> {
    let rel = host.strip_prefix(workspace).ok()?;
    let parts: Vec<_> = rel
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => part.to_str(),
            _ => None,
        })
        .collect();
    Some(format!("/{}", parts.join("/")))
}

fn pty_err(e: impl std::fmt::Display) -> SessionError {
    SessionError::Internal(format!("pty: {e}"))
}

#[async_trait]
impl ContainerRuntime for LocalContainer {
    fn project_root(&self) -> &str {
        &self.project_root
    }

    fn routing_host(&self) -> &str {
        &self.routing_host
    }

    async fn list_paths(&self, dir: &str, excluded: &[String]) -> SessionResult<Vec<PathEntry>> {
        let base = self.host_path(dir)?;
        let mut entries = Vec::new();
        let mut pending = vec![base.clone()];
        while let Some(current) = pending.pop() {
            let mut reader = tokio::fs::read_dir(&current).await?;
            while let Some(entry) = reader.next_entry().await? {
                let path = entry.path();
                let Some(rel) = path.strip_prefix(&base).ok().and_then(Path::to_str) else {
                    continue;
                };
                let rel = rel.replace('\\', "/");
                if entry.file_type().await?.is_dir() {
                    if excluded.iter().any(|x| entry.file_name() == x.as_str()) {
                        continue;
                    }
                    entries.push(PathEntry::dir(rel));
                    pending.push(path);
                } else {
                    entries.push(PathEntry::file(rel));
                }
            }
        }
        Ok(entries)
    }

    async fn read_file(&self, path: &str) -> SessionResult<Vec<u8>> {
        Ok(tokio::fs::read(self.host_path(path)?).await?)
    }

    async fn write_file(&self, path: &str, content: &[u8]) -> SessionResult<()> {
        let host = self.host_path(path)?;
        if let Some(parent) = host.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(host, content).await?;
        Ok(())
    }

    async fn remove(&self, path: &str, recursive: bool) -> SessionResult<()> {
        let host = self.host_path(path)?;
        let meta = tokio::fs::symlink_metadata(&host).await?;
        if meta.is_dir() {
            if recursive {
                tokio::fs::remove_dir_all(host).await?;
            } else {
                tokio::fs::remove_dir(host).await?;
            }
        } else {
            tokio::fs::remove_file(host).await?;
        }
        Ok(())
    }

    async fn make_dir(&self, path: &str) -> SessionResult<()> {
        tokio::fs::create_dir_all(self.host_path(path)?).await?;
        Ok(())
    }

    async fn watch_dir(
        &self,
        dir: &str,
        events: mpsc::UnboundedSender<FsEvent>,
    ) -> SessionResult<WatchHandle> {
        let host = self.host_path(dir)?;
        let workspace = self.workspace.clone();
        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            match res {
                Ok(event) => {
                    let kind = match event.kind {
                        EventKind::Create(_) => FsEventKind::Created,
                        EventKind::Remove(_) => FsEventKind::Removed,
                        EventKind::Modify(notify::event::ModifyKind::Name(_)) => {
                            FsEventKind::Renamed
                        }
                        EventKind::Modify(_) => FsEventKind::Modified,
                        _ => return,
                    };
                    for path in event.paths {
                        if let Some(path) = to_container_path(&workspace, &path) {
                            let _ = events.send(FsEvent { kind, path });
                        }
                    }
                }
                Err(e) => error!("watcher error: {e}"),
            }
        })
        .map_err(|e| SessionError::Internal(format!("failed to create watcher: {e}")))?;

        watcher
            .watch(&host, RecursiveMode::NonRecursive)
            .map_err(|e| SessionError::Internal(format!("failed to watch {dir}: {e}")))?;
        debug!(dir, "watching directory");
        Ok(WatchHandle::new(watcher))
    }

    async fn run_command(&self, cwd: &str, args: &[String]) -> SessionResult<CommandOutput> {
        let (program, rest) = args
            .split_first()
            .ok_or_else(|| SessionError::InvalidRequest("empty command".into()))?;
        let output = tokio::process::Command::new(program)
            .args(rest)
            .current_dir(self.host_path(cwd)?)
            .output()
            .await?;
        Ok(CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn fix_ownership(&self, path: &str) -> SessionResult<()> {
        let Some((uid, gid)) = self.owner else {
            return Ok(());
        };
        let host = self.host_path(path)?;
        let status = tokio::process::Command::new("chown")
            .arg("-R")
            .arg(format!("{uid}:{gid}"))
            .arg(&host)
            .status()
            .await?;
        if !status.success() {
            return Err(SessionError::Internal(format!(
                "chown {uid}:{gid} {} exited with {status}",
                host.display()
            )));
        }
        Ok(())
    }

    async fn open_terminal(&self, size: TerminalSize) -> SessionResult<TerminalChannels> {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows: size.rows,
                cols: size.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(pty_err)?;

        let mut cmd = CommandBuilder::new(&self.shell);
        cmd.cwd(self.host_path(&self.project_root)?);
        cmd.env("TERM", "xterm-256color");
        let child = pair.slave.spawn_command(cmd).map_err(pty_err)?;
        drop(pair.slave);

        let mut reader = pair.master.try_clone_reader().map_err(pty_err)?;
        let writer = pair.master.take_writer().map_err(pty_err)?;

        let (tx, rx) = mpsc::unbounded_channel();
        std::thread::spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        info!(shell = %self.shell, "opened terminal");
        Ok(TerminalChannels {
            output: rx,
            control: Box::new(PtyControl {
                master: Mutex::new(pair.master),
                writer: Mutex::new(writer),
                child: Mutex::new(child),
            }),
        })
    }
}

struct PtyControl {
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
    child: Mutex<Box<dyn Child + Send + Sync>>,
}

impl TerminalControl for PtyControl {
    fn write(&self, data: &[u8]) -> SessionResult<()> {
        let mut writer = self.writer.lock().unwrap_or_else(|p| p.into_inner());
        writer.write_all(data)?;
        writer.flush()?;
        Ok(())
    }

    fn resize(&self, size: TerminalSize) -> SessionResult<()> {
        self.master
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .resize(PtySize {
                rows: size.rows,
                cols: size.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(pty_err)
    }

    fn kill(&self) -> SessionResult<()> {
        let mut child = self.child.lock().unwrap_or_else(|p| p.into_inner());
        if let Err(e) = child.kill() {
            // Already exited.
            debug!("kill terminal: {e}");
        }
        let _ = child.try_wait();
        Ok(())
    }
}

/// Hands out one [`LocalContainer`] per project, creating its workspace on
/// first use.
pub struct LocalContainerProvider {
    settings: ContainerSettings,
}

impl LocalContainerProvider {
    pub fn new(settings: ContainerSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl ContainerProvider for LocalContainerProvider {
    async fn connect(&self, project_id: &str) -> SessionResult<Arc<dyn ContainerRuntime>> {
        if project_id.is_empty()
            || project_id == "."
            || project_id.contains(['/', '\\'])
            || project_id.contains("..")
        {
            return Err(SessionError::InvalidRequest(format!(
                "invalid project id: {project_id:?}"
            )));
        }
        let workspace = Path::new(&self.settings.workspaces_root).join(project_id);
        let container = LocalContainer::new(workspace, &self.settings);
        let root = container.host_path(container.project_root())?;
        if let Err(e) = tokio::fs::create_dir_all(&root).await {
            warn!(project_id, error = %e, "failed to create workspace");
            return Err(SessionError::Unavailable(format!(
                "workspace for {project_id} is not available"
            )));
        }
        Ok(Arc::new(container))
    }
}
