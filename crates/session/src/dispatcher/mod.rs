//! Routes socket requests to project sessions.
//!
//! One [`SessionDispatcher`] serves every project. It owns the connection
//! registry, the per-project lock table and one [`ProjectSession`] per live
//! project. Every request resolves to exactly one [`Ack`]; errors never
//! escape as anything else.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::Utc;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use devcell_core::{
    ChangedFilesSnapshot, Connection, ConnectionId, FileNode, ProjectId, SessionError,
    SessionResult,
};
use devcell_runtime_config::{ContainerSettings, SessionSettings};
use devcell_sync::{SyncError, SyncService};

use crate::container::{ContainerProvider, TerminalSize};
use crate::deploy::Deployer;
use crate::file_tree::{FileTreeMirror, WatchSubscription};
use crate::lock::LockManager;
use crate::protocol::{Ack, ClientFrame, Request, ServerEvent, ServerMessage};
use crate::registry::ConnectionRegistry;
use crate::terminal::{TerminalInfo, TerminalOutput, TerminalSessionBroker};

#[cfg(test)]
mod tests;

/// Outbound half of one client socket.
pub type ConnectionSink = mpsc::UnboundedSender<ServerMessage>;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub session: SessionSettings,
    pub container: ContainerSettings,
    /// Upper bound on how long a caller waits for an ack. Work that is
    /// already running is not cancelled when it elapses.
    pub request_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            session: SessionSettings::default(),
            container: ContainerSettings::default(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Live state for one project: its file tree, shells and pending changes.
struct ProjectSession {
    mirror: FileTreeMirror,
    terminals: TerminalSessionBroker,
    changes: Mutex<ChangedFilesSnapshot>,
    watch: Mutex<Option<WatchSubscription>>,
    teardown: Mutex<Option<JoinHandle<()>>>,
}

impl ProjectSession {
    fn changes(&self) -> MutexGuard<'_, ChangedFilesSnapshot> {
        self.changes.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn cancel_teardown(&self) {
        if let Some(handle) = self
            .teardown
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        {
            handle.abort();
        }
    }

    fn set_teardown(&self, handle: JoinHandle<()>) {
        let previous = self
            .teardown
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Stop watching and kill every shell.
    fn close(&self) {
        self.watch.lock().unwrap_or_else(|p| p.into_inner()).take();
        self.terminals.close_all();
    }
}

/// A failed request: the error plus optional structured detail for the ack.
struct Failure {
    error: SessionError,
    data: Option<Value>,
}

impl From<SessionError> for Failure {
    fn from(error: SessionError) -> Self {
        Self { error, data: None }
    }
}

impl From<SyncError> for Failure {
    fn from(e: SyncError) -> Self {
        let data = match &e {
            SyncError::PullRequired(status) => Some(json!({ "pullStatus": status })),
            _ => None,
        };
        Self {
            error: e.into(),
            data,
        }
    }
}

impl Failure {
    fn into_ack(self) -> Ack {
        let mut ack = Ack::err(&self.error);
        if let Some(Value::Object(data)) = self.data {
            ack.data = data;
        }
        ack
    }
}

type Outcome = Result<Value, Failure>;

/// Table entry for one project. The cell is filled once the container is
/// up, without the table lock held, so a slow start only delays its own
/// project.
type SessionSlot = Arc<tokio::sync::OnceCell<Arc<ProjectSession>>>;

struct Inner {
    config: DispatcherConfig,
    provider: Arc<dyn ContainerProvider>,
    sync: Arc<SyncService>,
    deployer: Option<Arc<dyn Deployer>>,
    locks: LockManager,
    registry: Mutex<ConnectionRegistry>,
    sinks: Mutex<HashMap<ConnectionId, ConnectionSink>>,
    sessions: Mutex<HashMap<ProjectId, SessionSlot>>,
}

impl Inner {
    fn registry(&self) -> MutexGuard<'_, ConnectionRegistry> {
        self.registry.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn sinks(&self) -> MutexGuard<'_, HashMap<ConnectionId, ConnectionSink>> {
        self.sinks.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<ProjectId, SessionSlot>> {
        self.sessions.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn live_session(&self, project_id: &str) -> Option<Arc<ProjectSession>> {
        self.sessions()
            .get(project_id)
            .and_then(|slot| slot.get().cloned())
    }

    fn send_to(&self, connection_id: &str, message: ServerMessage) {
        if let Some(sink) = self.sinks().get(connection_id) {
            let _ = sink.send(message);
        }
    }

    fn broadcast(&self, project_id: &str, message: ServerMessage) {
        let targets = self.registry().connections_for(project_id);
        let sinks = self.sinks();
        for conn in targets {
            if let Some(sink) = sinks.get(&conn.connection_id) {
                let _ = sink.send(message.clone());
            }
        }
    }

    fn broadcast_tree(&self, project_id: &str, tree: &[FileNode]) {
        self.broadcast(
            project_id,
            ServerMessage::Event(ServerEvent::FileTree {
                tree: tree.to_vec(),
            }),
        );
    }

    fn teardown(&self, project_id: &str) {
        let removed = {
            let mut sessions = self.sessions();
            if self.registry().connection_count(project_id) > 0 {
                return;
            }
            sessions.remove(project_id)
        };
        if let Some(session) = removed.and_then(|slot| slot.get().cloned()) {
            session.close();
            info!(project_id, "project session torn down");
        }
    }

    /// Register `conn` against the session held by `slot`. Returns `None`
    /// when a teardown replaced the slot since it was looked up.
    ///
    /// Runs under the table lock so a pending teardown cannot observe the
    /// project as empty in between.
    fn register(
        &self,
        slot: &SessionSlot,
        session: &ProjectSession,
        conn: &Connection,
        sink: &ConnectionSink,
    ) -> Option<bool> {
        let sessions = self.sessions();
        let current = sessions.get(&conn.project_id)?;
        if !Arc::ptr_eq(current, slot) {
            return None;
        }
        session.cancel_teardown();
        self.sinks().insert(conn.connection_id.clone(), sink.clone());
        let mut registry = self.registry();
        Some(
            registry.add_connection(conn.clone())
                && conn.is_owner
                && registry.owner_count(&conn.project_id) == 1,
        )
    }

    /// Drop a slot whose container failed to start, unless someone else has
    /// since filled or replaced it.
    fn discard_failed(&self, project_id: &str, slot: &SessionSlot) {
        let mut sessions = self.sessions();
        let stale = sessions
            .get(project_id)
            .is_some_and(|current| Arc::ptr_eq(current, slot) && current.get().is_none());
        if stale && self.registry().connection_count(project_id) == 0 {
            sessions.remove(project_id);
        }
    }
}

#[derive(Clone)]
pub struct SessionDispatcher {
    inner: Arc<Inner>,
}

impl SessionDispatcher {
    pub fn new(
        config: DispatcherConfig,
        provider: Arc<dyn ContainerProvider>,
        sync: Arc<SyncService>,
        deployer: Option<Arc<dyn Deployer>>,
    ) -> Self {
        let locks = LockManager::new(Duration::from_millis(
            config.session.lock_contention_warn_ms,
        ));
        Self {
            inner: Arc::new(Inner {
                config,
                provider,
                sync,
                deployer,
                locks,
                registry: Mutex::new(ConnectionRegistry::new()),
                sinks: Mutex::new(HashMap::new()),
                sessions: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn sync(&self) -> &Arc<SyncService> {
        &self.inner.sync
    }

    pub fn owner_is_connected(&self, project_id: &str) -> bool {
        self.inner.registry().owner_is_connected(project_id)
    }

    pub fn connection_count(&self, project_id: &str) -> usize {
        self.inner.registry().connection_count(project_id)
    }

    pub fn has_session(&self, project_id: &str) -> bool {
        self.inner.live_session(project_id).is_some()
    }

    /// Attach a connection, creating the project session on first use.
    ///
    /// With `require_owner_presence` set, collaborators are refused while no
    /// owner connection is attached.
    pub async fn connect(&self, conn: &Connection, sink: ConnectionSink) -> SessionResult<()> {
        let inner = &self.inner;
        let project_id = conn.project_id.as_str();
        if inner.config.session.require_owner_presence
            && !conn.is_owner
            && !inner.registry().owner_is_connected(project_id)
        {
            warn!(
                project_id,
                user_id = %conn.user_id,
                "collaborator refused: owner not connected"
            );
            return Err(SessionError::PermissionDenied(
                "the project owner is not connected".into(),
            ));
        }

        let first_owner = loop {
            let slot = inner
                .sessions()
                .entry(project_id.to_string())
                .or_default()
                .clone();
            let session = match slot.get_or_try_init(|| self.open_session(project_id)).await {
                Ok(session) => session.clone(),
                Err(e) => {
                    inner.discard_failed(project_id, &slot);
                    return Err(e);
                }
            };
            match inner.register(&slot, &session, conn, &sink) {
                Some(first_owner) => break first_owner,
                None => debug!(project_id, "session torn down while connecting, reopening"),
            }
        };

        info!(
            project_id,
            connection_id = %conn.connection_id,
            user_id = %conn.user_id,
            is_owner = conn.is_owner,
            "connection opened"
        );
        if first_owner {
            inner.broadcast(
                project_id,
                ServerMessage::Event(ServerEvent::OwnerPresence { connected: true }),
            );
        }
        Ok(())
    }

    /// Detach a connection. The last one out starts the teardown timer.
    pub fn disconnect(&self, conn: &Connection) {
        let inner = &self.inner;
        let project_id = conn.project_id.as_str();
        let sessions = inner.sessions();
        inner.sinks().remove(&conn.connection_id);
        let (removed, owner_left, remaining) = {
            let mut registry = inner.registry();
            let removed = registry.remove_connection(project_id, &conn.connection_id);
            (
                removed.is_some(),
                conn.is_owner && !registry.owner_is_connected(project_id),
                registry.connection_count(project_id),
            )
        };
        if !removed {
            return;
        }
        info!(
            project_id,
            connection_id = %conn.connection_id,
            is_owner = conn.is_owner,
            "connection closed"
        );

        if owner_left {
            inner.broadcast(
                project_id,
                ServerMessage::Event(ServerEvent::OwnerPresence { connected: false }),
            );
        }
        if remaining == 0 {
            if let Some(session) = sessions.get(project_id).and_then(|slot| slot.get()) {
                let grace = Duration::from_secs(inner.config.session.teardown_grace_secs);
                let weak = Arc::downgrade(&self.inner);
                let project = project_id.to_string();
                debug!(project_id, grace_secs = grace.as_secs(), "scheduling session teardown");
                session.set_teardown(tokio::spawn(async move {
                    tokio::time::sleep(grace).await;
                    if let Some(inner) = weak.upgrade() {
                        inner.teardown(&project);
                    }
                }));
            }
        }
    }

    /// Close every session and tell every client the server is going away.
    pub fn shutdown(&self) {
        let sessions: Vec<_> = self.inner.sessions().drain().collect();
        for (project_id, slot) in sessions {
            let Some(session) = slot.get() else {
                continue;
            };
            session.cancel_teardown();
            session.close();
            debug!(project_id = %project_id, "project session closed for shutdown");
        }
        let message = ServerMessage::Event(ServerEvent::Disconnect {
            reason: "server shutting down".into(),
        });
        for sink in self.inner.sinks().values() {
            let _ = sink.send(message.clone());
        }
    }

    /// Parse and handle one raw text frame.
    pub async fn handle_text(&self, conn: &Connection, text: &str) -> ServerMessage {
        match ClientFrame::parse(text) {
            Ok(frame) => self.handle(conn, frame).await,
            Err(e) => {
                warn!(connection_id = %conn.connection_id, error = %e, "malformed frame");
                ServerMessage::Ack {
                    id: None,
                    ack: Ack::err(&e),
                }
            }
        }
    }

    pub async fn handle(&self, conn: &Connection, frame: ClientFrame) -> ServerMessage {
        let ack = match frame.request() {
            Ok(request) => self.handle_request(conn, request).await,
            Err(e) => {
                warn!(
                    connection_id = %conn.connection_id,
                    event = %frame.event,
                    error = %e,
                    "rejected request"
                );
                Ack::err(&e)
            }
        };
        ServerMessage::Ack { id: frame.id, ack }
    }

    async fn handle_request(&self, conn: &Connection, request: Request) -> Ack {
        let event = request.name();
        let unbounded = request.unbounded();
        let this = self.clone();
        let caller = conn.clone();
        // Spawned so a timeout abandons the wait without cancelling work
        // that has side effects already in flight.
        let task = tokio::spawn(async move { this.dispatch(&caller, request).await });

        // Sync and deploy scale with the file count; their ack must carry
        // the real outcome or a retry would repeat the commit.
        let joined = if unbounded {
            Ok(task.await)
        } else {
            tokio::time::timeout(self.inner.config.request_timeout, task).await
        };

        match joined {
            Ok(Ok(Ok(data))) => Ack::ok(data),
            Ok(Ok(Err(failure))) => {
                warn!(
                    project_id = %conn.project_id,
                    connection_id = %conn.connection_id,
                    event,
                    code = failure.error.kind().code(),
                    error = %failure.error,
                    "request failed"
                );
                failure.into_ack()
            }
            Ok(Err(e)) => {
                error!(project_id = %conn.project_id, event, error = %e, "request handler aborted");
                Ack::err(&SessionError::internal("request handler aborted"))
            }
            Err(_) => {
                warn!(project_id = %conn.project_id, event, "request timed out");
                Ack::err(&SessionError::Transient(format!("{event} timed out")))
            }
        }
    }

    fn session(&self, project_id: &str) -> SessionResult<Arc<ProjectSession>> {
        self.inner.live_session(project_id).ok_or_else(|| {
            SessionError::Unavailable(format!("no active session for project {project_id}"))
        })
    }

    fn deployer(&self) -> SessionResult<&Arc<dyn Deployer>> {
        self.inner
            .deployer
            .as_ref()
            .ok_or_else(|| SessionError::Unavailable("deploy service is not configured".into()))
    }

    async fn open_session(&self, project_id: &str) -> SessionResult<Arc<ProjectSession>> {
        let config = &self.inner.config;
        let container = self.inner.provider.connect(project_id).await?;
        let session = Arc::new(ProjectSession {
            mirror: FileTreeMirror::new(
                container.clone(),
                &config.container,
                config.session.max_file_bytes,
            ),
            terminals: TerminalSessionBroker::new(
                container,
                config.session.max_terminals_per_project,
                config.container.preview_url_template.clone(),
            ),
            changes: Mutex::new(ChangedFilesSnapshot::default()),
            watch: Mutex::new(None),
            teardown: Mutex::new(None),
        });

        let (tx, rx) = mpsc::unbounded_channel();
        match session.mirror.start_watching(tx).await {
            Ok(subscription) => {
                *session.watch.lock().unwrap_or_else(|p| p.into_inner()) = Some(subscription);
                tokio::spawn(forward_tree_updates(
                    Arc::downgrade(&self.inner),
                    project_id.to_string(),
                    rx,
                ));
            }
            Err(e) => warn!(project_id, error = %e, "live file tree unavailable"),
        }
        info!(project_id, root = session.mirror.root(), "project session created");
        Ok(session)
    }

    async fn open_terminal(
        &self,
        conn: &Connection,
        session: &ProjectSession,
        id: &str,
        size: TerminalSize,
    ) -> SessionResult<TerminalInfo> {
        let (tx, rx) = mpsc::unbounded_channel();
        let info = session.terminals.create_terminal(id, size, tx).await?;
        tokio::spawn(forward_terminal_output(
            Arc::downgrade(&self.inner),
            conn.project_id.clone(),
            conn.connection_id.clone(),
            rx,
        ));
        Ok(info)
    }

    async fn dispatch(&self, conn: &Connection, request: Request) -> Outcome {
        if request.owner_only() && !conn.is_owner {
            return Err(SessionError::PermissionDenied(format!(
                "{} is limited to the project owner",
                request.name()
            ))
            .into());
        }
        let inner = &self.inner;
        let project_id = conn.project_id.as_str();
        let session = self.session(project_id)?;
        let mirror = &session.mirror;
        let locks = &inner.locks;

        match request {
            Request::ListApps {} => Ok(json!({ "apps": self.deployer()?.list_apps().await? })),
            Request::GetAppCreatedAt { name } => {
                let created_at = self.deployer()?.get_app_created_at(&name).await?;
                Ok(json!({ "createdAt": created_at }))
            }
            Request::AppExists { name } => {
                Ok(json!({ "exists": self.deployer()?.app_exists(&name).await? }))
            }
            Request::Deploy { name } => {
                let deployer = self.deployer()?;
                let result = locks
                    .acquire(project_id, || async {
                        let files = mirror.read_all_files().await?;
                        deployer.deploy(&name, &files).await
                    })
                    .await?;
                Ok(json!({ "deployment": result }))
            }

            Request::CreateTerminal { id, rows, cols } => {
                let size = TerminalSize { rows, cols };
                let info = locks
                    .acquire(project_id, || self.open_terminal(conn, &session, &id, size))
                    .await?;
                Ok(json!({ "terminal": info }))
            }
            Request::ResizeTerminal { id, rows, cols } => {
                session.terminals.resize(&id, TerminalSize { rows, cols })?;
                Ok(Value::Null)
            }
            Request::TerminalData { id, data } => {
                session.terminals.write(&id, &data)?;
                Ok(Value::Null)
            }
            Request::CloseTerminal { id } => {
                session.terminals.close(&id)?;
                Ok(Value::Null)
            }

            Request::GetFileTree {} => Ok(json!({ "tree": mirror.get_file_tree().await? })),
            Request::GetFile { path } => {
                let content = mirror.get_file(&path).await?;
                Ok(json!({ "path": mirror.resolve(&path)?, "content": content }))
            }
            Request::SaveFile { path, content } => {
                let resolved = mirror.resolve(&path)?;
                let tree = locks
                    .acquire(project_id, || mirror.save_file(&resolved, &content))
                    .await?;
                session.changes().record_saved(&mirror.repo_path(&resolved));
                inner.broadcast_tree(project_id, &tree);
                Ok(json!({ "tree": tree }))
            }
            Request::CreateFile { path } => {
                let resolved = mirror.resolve(&path)?;
                let tree = locks
                    .acquire(project_id, || mirror.create_file(&resolved))
                    .await?;
                session.changes().record_created(&mirror.repo_path(&resolved));
                inner.broadcast_tree(project_id, &tree);
                Ok(json!({ "tree": tree }))
            }
            Request::CreateFolder { path } => {
                let tree = locks
                    .acquire(project_id, || mirror.create_folder(&path))
                    .await?;
                inner.broadcast_tree(project_id, &tree);
                Ok(json!({ "tree": tree }))
            }
            Request::RenameFile { path, new_name } => {
                let from = mirror.resolve(&path)?;
                let (to, tree) = locks
                    .acquire(project_id, || mirror.rename_file(&from, &new_name))
                    .await?;
                session
                    .changes()
                    .record_renamed(&mirror.repo_path(&from), &mirror.repo_path(&to));
                inner.broadcast_tree(project_id, &tree);
                Ok(json!({ "path": to, "tree": tree }))
            }
            Request::MoveFile { path, target_dir } => {
                let from = mirror.resolve(&path)?;
                let (to, tree) = locks
                    .acquire(project_id, || mirror.move_file(&from, &target_dir))
                    .await?;
                session
                    .changes()
                    .record_renamed(&mirror.repo_path(&from), &mirror.repo_path(&to));
                inner.broadcast_tree(project_id, &tree);
                Ok(json!({ "path": to, "tree": tree }))
            }
            Request::DeleteFile { path } => {
                let resolved = mirror.resolve(&path)?;
                let tree = locks
                    .acquire(project_id, || mirror.delete_file(&resolved))
                    .await?;
                session.changes().record_deleted(&mirror.repo_path(&resolved));
                inner.broadcast_tree(project_id, &tree);
                Ok(json!({ "tree": tree }))
            }
            Request::DeleteFolder { path } => {
                let resolved = mirror.resolve(&path)?;
                let (known, tree) = locks
                    .acquire(project_id, || async {
                        let before = mirror.get_file_tree().await?;
                        let tree = mirror.delete_folder(&resolved).await?;
                        SessionResult::Ok((FileNode::file_ids(&before), tree))
                    })
                    .await?;
                let known: Vec<String> = known.iter().map(|p| mirror.repo_path(p)).collect();
                session
                    .changes()
                    .record_deleted_prefix(&mirror.repo_path(&resolved), &known);
                inner.broadcast_tree(project_id, &tree);
                Ok(json!({ "tree": tree }))
            }
            Request::DownloadArchive {} => {
                let archive = mirror.get_files_for_download().await?;
                Ok(json!({ "archive": archive, "fileName": format!("{project_id}.tar.gz") }))
            }

            Request::CreateCommit { message, resolved } => {
                let outcome = locks
                    .acquire(project_id, || async {
                        let files = mirror.read_all_files().await?;
                        let outcome = inner
                            .sync
                            .create_commit(&conn.user_id, &conn.project_id, &files, &message, resolved)
                            .await?;
                        Ok::<_, Failure>(outcome)
                    })
                    .await?;
                session.changes().clear();
                info!(
                    project_id,
                    commit = %outcome.commit_sha,
                    files = outcome.file_count,
                    "project synced"
                );
                Ok(json!({ "commit": outcome }))
            }
            Request::CheckIfPullNeeded {} => {
                let status = inner
                    .sync
                    .check_if_pull_needed(&conn.user_id, &conn.project_id)
                    .await?;
                Ok(json!(status))
            }
            Request::GetLatestFiles {} => {
                let remote = inner
                    .sync
                    .get_latest_files(&conn.user_id, &conn.project_id)
                    .await?;
                let local = mirror.read_all_files().await?;
                let snapshot = ChangedFilesSnapshot::compute(&local, &remote);
                *session.changes() = snapshot.clone();
                Ok(json!({ "files": remote, "changedFiles": snapshot }))
            }
            Request::GetChangedFiles {} => {
                let snapshot = session.changes().clone();
                Ok(json!({ "changedFiles": snapshot }))
            }
            Request::LinkRepo { repository_id } => {
                let name = inner
                    .sync
                    .link_repo(&conn.user_id, &conn.project_id, &repository_id)
                    .await?;
                session.changes().clear();
                Ok(json!({ "repository": name }))
            }
            Request::RemoveRepo {} => {
                inner.sync.remove_repo(&conn.project_id)?;
                session.changes().clear();
                Ok(Value::Null)
            }
            Request::LogoutUser {} => {
                inner.sync.logout_user(&conn.user_id)?;
                Ok(Value::Null)
            }

            Request::Heartbeat {} => Ok(json!({ "serverTime": Utc::now() })),
        }
    }
}

async fn forward_tree_updates(
    inner: Weak<Inner>,
    project_id: String,
    mut trees: mpsc::UnboundedReceiver<Vec<FileNode>>,
) {
    while let Some(tree) = trees.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        debug!(project_id = %project_id, "file tree refreshed");
        inner.broadcast_tree(&project_id, &tree);
    }
}

/// Shell output goes back to the connection that opened the terminal;
/// preview URLs go to everyone on the project.
async fn forward_terminal_output(
    inner: Weak<Inner>,
    project_id: String,
    requester: ConnectionId,
    mut output: mpsc::UnboundedReceiver<TerminalOutput>,
) {
    while let Some(event) = output.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match event {
            TerminalOutput::Data { terminal_id, data } => inner.send_to(
                &requester,
                ServerMessage::Event(ServerEvent::TerminalResponse { terminal_id, data }),
            ),
            TerminalOutput::PreviewUrl {
                terminal_id,
                port,
                url,
            } => inner.broadcast(
                &project_id,
                ServerMessage::Event(ServerEvent::PreviewUrl {
                    terminal_id,
                    port,
                    url,
                }),
            ),
            TerminalOutput::Closed { terminal_id } => inner.send_to(
                &requester,
                ServerMessage::Event(ServerEvent::TerminalClosed { terminal_id }),
            ),
        }
    }
}
