//! Boundary to the project's container: filesystem, commands and PTYs.
//!
//! Every path crossing this boundary is a container path (`/project/src/a.rs`);
//! implementations decide how that maps onto real storage.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use devcell_core::{PathEntry, SessionResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FsEventKind {
    Created,
    Removed,
    Renamed,
    Modified,
}

impl FsEventKind {
    /// Whether the event can change the shape of the file tree.
    pub fn is_structural(self) -> bool {
        !matches!(self, Self::Modified)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsEvent {
    pub kind: FsEventKind,
    pub path: String,
}

/// Keeps a directory watch alive; dropping it stops delivery.
pub struct WatchHandle {
    _inner: Box<dyn Any + Send>,
}

impl WatchHandle {
    pub fn new(inner: impl Any + Send) -> Self {
        Self {
            _inner: Box::new(inner),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    pub rows: u16,
    pub cols: u16,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

/// Input side of an open PTY.
pub trait TerminalControl: Send + Sync {
    fn write(&self, data: &[u8]) -> SessionResult<()>;
    fn resize(&self, size: TerminalSize) -> SessionResult<()>;
    /// Terminate the shell. The output channel closes once it exits.
    fn kill(&self) -> SessionResult<()>;
}

pub struct TerminalChannels {
    pub output: mpsc::UnboundedReceiver<Vec<u8>>,
    pub control: Box<dyn TerminalControl>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Container path of the project directory, e.g. `/project`.
    fn project_root(&self) -> &str;

    /// Host name that routes into this container; feeds preview URLs.
    fn routing_host(&self) -> &str;

    /// Recursive listing of `dir`, relative to it. Directories whose name is
    /// in `excluded` are neither listed nor descended into.
    async fn list_paths(&self, dir: &str, excluded: &[String]) -> SessionResult<Vec<PathEntry>>;

    async fn read_file(&self, path: &str) -> SessionResult<Vec<u8>>;

    /// Create or replace `path`, creating parent directories as needed.
    async fn write_file(&self, path: &str, content: &[u8]) -> SessionResult<()>;

    async fn remove(&self, path: &str, recursive: bool) -> SessionResult<()>;

    async fn make_dir(&self, path: &str) -> SessionResult<()>;

    /// Non-recursive watch of `dir`.
    async fn watch_dir(
        &self,
        dir: &str,
        events: mpsc::UnboundedSender<FsEvent>,
    ) -> SessionResult<WatchHandle>;

    /// Run `args` with `cwd` as working directory.
    async fn run_command(&self, cwd: &str, args: &[String]) -> SessionResult<CommandOutput>;

    /// Hand `path` back to the project user after the service wrote to it.
    async fn fix_ownership(&self, path: &str) -> SessionResult<()>;

    async fn open_terminal(&self, size: TerminalSize) -> SessionResult<TerminalChannels>;
}

/// Resolves a project id to its running container.
#[async_trait]
pub trait ContainerProvider: Send + Sync {
    async fn connect(&self, project_id: &str) -> SessionResult<Arc<dyn ContainerRuntime>>;
}
