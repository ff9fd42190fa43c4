//! In-memory container, provider and deployer for tests.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::Instant;

use devcell_core::paths::{join, parent_dir};
use devcell_core::{PathEntry, RepoFile, SessionError, SessionResult};

use crate::container::{
    CommandOutput, ContainerProvider, ContainerRuntime, FsEvent, FsEventKind, TerminalChannels,
    TerminalControl, TerminalSize, WatchHandle,
};
use crate::deploy::{AppSummary, DeployResult, Deployer};

struct Watcher {
    dir: String,
    events: mpsc::UnboundedSender<FsEvent>,
    alive: Arc<AtomicBool>,
}

struct WatchGuard(Arc<AtomicBool>);

impl Drop for WatchGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct State {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
    watchers: Vec<Watcher>,
    writes: usize,
    write_spans: Vec<(Instant, Instant)>,
    ownership: Vec<String>,
    commands: Vec<Vec<String>>,
    terminals: Vec<Arc<FakeTerminal>>,
}

impl State {
    fn add_parents(&mut self, path: &str) {
        let mut dir = parent_dir(path);
        while dir != "/" {
            self.dirs.insert(dir.to_string());
            dir = parent_dir(dir);
        }
    }
}

/// Container whose filesystem is a map. Records writes, ownership fixes,
/// commands and terminals so tests can assert on them.
pub struct FakeContainer {
    root: String,
    host: String,
    write_delay: Mutex<Duration>,
    state: Mutex<State>,
}

fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    format!("/{}", parts.join("/"))
}

fn not_found(path: &str) -> SessionError {
    SessionError::Io(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        format!("{path}: no such file or directory"),
    ))
}

impl FakeContainer {
    pub fn new(project_root: &str) -> Self {
        let root = normalize(project_root);
        let mut state = State::default();
        state.dirs.insert(root.clone());
        state.add_parents(&root);
        Self {
            root,
            host: "sandbox.test".to_string(),
            write_delay: Mutex::new(Duration::ZERO),
            state: Mutex::new(state),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Seed a file without counting it as a write.
    pub fn put_file(&self, path: &str, content: &str) {
        let path = normalize(path);
        let mut state = self.state();
        state.add_parents(&path);
        state.files.insert(path, content.as_bytes().to_vec());
    }

    pub fn put_dir(&self, path: &str) {
        let path = normalize(path);
        let mut state = self.state();
        state.add_parents(&path);
        state.dirs.insert(path);
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.state()
            .files
            .get(&normalize(path))
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    pub fn file_paths(&self) -> Vec<String> {
        self.state().files.keys().cloned().collect()
    }

    pub fn write_count(&self) -> usize {
        self.state().writes
    }

    /// Each `write_file` sleeps this long, recording its span.
    pub fn set_write_delay(&self, delay: Duration) {
        *self.write_delay.lock().unwrap() = delay;
    }

    pub fn write_spans(&self) -> Vec<(Instant, Instant)> {
        self.state().write_spans.clone()
    }

    pub fn ownership_fixes(&self) -> Vec<String> {
        self.state().ownership.clone()
    }

    pub fn commands(&self) -> Vec<Vec<String>> {
        self.state().commands.clone()
    }

    /// Directories with a live watch, in registration order.
    pub fn watched_dirs(&self) -> Vec<String> {
        self.state()
            .watchers
            .iter()
            .filter(|w| w.alive.load(Ordering::SeqCst))
            .map(|w| w.dir.clone())
            .collect()
    }

    /// Deliver a filesystem event to live watchers of `path`'s directory.
    pub fn emit(&self, path: &str, kind: FsEventKind) {
        let path = normalize(path);
        let dir = parent_dir(&path).to_string();
        for watcher in self.state().watchers.iter() {
            if watcher.dir == dir && watcher.alive.load(Ordering::SeqCst) {
                let _ = watcher.events.send(FsEvent {
                    kind,
                    path: path.clone(),
                });
            }
        }
    }

    pub fn terminals(&self) -> Vec<Arc<FakeTerminal>> {
        self.state().terminals.clone()
    }

    fn is_dir(&self, path: &str) -> bool {
        self.state().dirs.contains(path)
    }
}

#[async_trait]
impl ContainerRuntime for FakeContainer {
    fn project_root(&self) -> &str {
        &self.root
    }

    fn routing_host(&self) -> &str {
        &self.host
    }

    async fn list_paths(&self, dir: &str, excluded: &[String]) -> SessionResult<Vec<PathEntry>> {
        let dir = normalize(dir);
        let prefix = format!("{}/", dir.trim_end_matches('/'));
        let state = self.state();
        if !state.dirs.contains(&dir) {
            return Err(not_found(&dir));
        }
        let hidden = |rel: &str, is_dir: bool| {
            let segments: Vec<&str> = rel.split('/').collect();
            let dirs = if is_dir {
                &segments[..]
            } else {
                &segments[..segments.len() - 1]
            };
            dirs.iter().any(|s| excluded.iter().any(|x| x == s))
        };

        let mut entries = Vec::new();
        for path in &state.dirs {
            if let Some(rel) = path.strip_prefix(&prefix) {
                if !hidden(rel, true) {
                    entries.push(PathEntry::dir(rel));
                }
            }
        }
        for path in state.files.keys() {
            if let Some(rel) = path.strip_prefix(&prefix) {
                if !hidden(rel, false) {
                    entries.push(PathEntry::file(rel));
                }
            }
        }
        Ok(entries)
    }

    async fn read_file(&self, path: &str) -> SessionResult<Vec<u8>> {
        let path = normalize(path);
        self.state()
            .files
            .get(&path)
            .cloned()
            .ok_or_else(|| not_found(&path))
    }

    async fn write_file(&self, path: &str, content: &[u8]) -> SessionResult<()> {
        let path = normalize(path);
        let delay = *self.write_delay.lock().unwrap();
        let start = Instant::now();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state();
        state.writes += 1;
        state.write_spans.push((start, Instant::now()));
        state.add_parents(&path);
        state.files.insert(path, content.to_vec());
        Ok(())
    }

    async fn remove(&self, path: &str, recursive: bool) -> SessionResult<()> {
        let path = normalize(path);
        if self.is_dir(&path) {
            let prefix = format!("{path}/");
            let mut state = self.state();
            let has_children = state.files.keys().any(|p| p.starts_with(&prefix))
                || state.dirs.iter().any(|p| p.starts_with(&prefix));
            if has_children && !recursive {
                return Err(SessionError::Conflict(format!("{path} is not empty")));
            }
            state.files.retain(|p, _| !p.starts_with(&prefix));
            state.dirs.retain(|p| *p != path && !p.starts_with(&prefix));
            return Ok(());
        }
        self.state()
            .files
            .remove(&path)
            .map(|_| ())
            .ok_or_else(|| not_found(&path))
    }

    async fn make_dir(&self, path: &str) -> SessionResult<()> {
        let path = normalize(path);
        let mut state = self.state();
        state.add_parents(&path);
        state.dirs.insert(path);
        Ok(())
    }

    async fn watch_dir(
        &self,
        dir: &str,
        events: mpsc::UnboundedSender<FsEvent>,
    ) -> SessionResult<WatchHandle> {
        let alive = Arc::new(AtomicBool::new(true));
        self.state().watchers.push(Watcher {
            dir: normalize(dir),
            events,
            alive: alive.clone(),
        });
        Ok(WatchHandle::new(WatchGuard(alive)))
    }

    /// `tar -czf <out> ...` writes a placeholder archive; everything else
    /// succeeds without effect.
    async fn run_command(&self, cwd: &str, args: &[String]) -> SessionResult<CommandOutput> {
        self.state().commands.push(args.to_vec());
        if args.first().map(String::as_str) == Some("tar") {
            if let Some(pos) = args.iter().position(|a| a == "-czf") {
                let out = normalize(&join(cwd, &args[pos + 1]));
                let content = format!("archive of {}", normalize(cwd));
                self.state().files.insert(out, content.into_bytes());
            }
        }
        Ok(CommandOutput::default())
    }

    async fn fix_ownership(&self, path: &str) -> SessionResult<()> {
        self.state().ownership.push(normalize(path));
        Ok(())
    }

    async fn open_terminal(&self, size: TerminalSize) -> SessionResult<TerminalChannels> {
        let (tx, rx) = mpsc::unbounded_channel();
        let terminal = Arc::new(FakeTerminal {
            output: Mutex::new(Some(tx)),
            input: Mutex::new(Vec::new()),
            sizes: Mutex::new(vec![size]),
            killed: AtomicBool::new(false),
        });
        self.state().terminals.push(terminal.clone());
        Ok(TerminalChannels {
            output: rx,
            control: Box::new(FakeTerminalControl(terminal)),
        })
    }
}

/// Scriptable shell: tests print output and inspect what was typed.
pub struct FakeTerminal {
    output: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    input: Mutex<Vec<u8>>,
    sizes: Mutex<Vec<TerminalSize>>,
    killed: AtomicBool,
}

impl FakeTerminal {
    pub fn print(&self, text: &str) {
        if let Some(tx) = self.output.lock().unwrap().as_ref() {
            let _ = tx.send(text.as_bytes().to_vec());
        }
    }

    /// The shell exits: the output stream ends.
    pub fn exit(&self) {
        self.output.lock().unwrap().take();
    }

    pub fn input(&self) -> String {
        String::from_utf8_lossy(&self.input.lock().unwrap()).into_owned()
    }

    pub fn sizes(&self) -> Vec<TerminalSize> {
        self.sizes.lock().unwrap().clone()
    }

    pub fn killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }
}

struct FakeTerminalControl(Arc<FakeTerminal>);

impl TerminalControl for FakeTerminalControl {
    fn write(&self, data: &[u8]) -> SessionResult<()> {
        self.0.input.lock().unwrap().extend_from_slice(data);
        Ok(())
    }

    fn resize(&self, size: TerminalSize) -> SessionResult<()> {
        self.0.sizes.lock().unwrap().push(size);
        Ok(())
    }

    fn kill(&self) -> SessionResult<()> {
        self.0.killed.store(true, Ordering::SeqCst);
        self.0.exit();
        Ok(())
    }
}

/// One [`FakeContainer`] per project id, created on first connect.
pub struct FakeProvider {
    root: String,
    containers: Mutex<HashMap<String, Arc<FakeContainer>>>,
    connects: Mutex<usize>,
    connect_delays: Mutex<HashMap<String, Duration>>,
}

impl FakeProvider {
    pub fn new(project_root: &str) -> Self {
        Self {
            root: project_root.to_string(),
            containers: Mutex::new(HashMap::new()),
            connects: Mutex::new(0),
            connect_delays: Mutex::new(HashMap::new()),
        }
    }

    /// Make container startup for `project_id` take `delay`.
    pub fn set_connect_delay(&self, project_id: &str, delay: Duration) {
        self.connect_delays
            .lock()
            .unwrap()
            .insert(project_id.to_string(), delay);
    }

    pub fn container(&self, project_id: &str) -> Arc<FakeContainer> {
        self.containers
            .lock()
            .unwrap()
            .entry(project_id.to_string())
            .or_insert_with(|| Arc::new(FakeContainer::new(&self.root)))
            .clone()
    }

    pub fn connects(&self) -> usize {
        *self.connects.lock().unwrap()
    }
}

#[async_trait]
impl ContainerProvider for FakeProvider {
    async fn connect(&self, project_id: &str) -> SessionResult<Arc<dyn ContainerRuntime>> {
        *self.connects.lock().unwrap() += 1;
        let delay = self.connect_delays.lock().unwrap().get(project_id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.container(project_id))
    }
}

/// Deployer that keeps apps in memory and records every deploy.
#[derive(Default)]
pub struct RecordingDeployer {
    apps: Mutex<BTreeMap<String, DateTime<Utc>>>,
    deploys: Mutex<Vec<(String, Vec<RepoFile>)>>,
}

impl RecordingDeployer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deploys(&self) -> Vec<(String, Vec<RepoFile>)> {
        self.deploys.lock().unwrap().clone()
    }
}

#[async_trait]
impl Deployer for RecordingDeployer {
    async fn list_apps(&self) -> SessionResult<Vec<AppSummary>> {
        Ok(self
            .apps
            .lock()
            .unwrap()
            .iter()
            .map(|(name, created)| AppSummary {
                name: name.clone(),
                created_at: Some(*created),
            })
            .collect())
    }

    async fn get_app_created_at(&self, name: &str) -> SessionResult<Option<DateTime<Utc>>> {
        Ok(self.apps.lock().unwrap().get(name).copied())
    }

    async fn deploy(&self, name: &str, files: &[RepoFile]) -> SessionResult<DeployResult> {
        self.apps
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_insert_with(Utc::now);
        self.deploys
            .lock()
            .unwrap()
            .push((name.to_string(), files.to_vec()));
        Ok(DeployResult {
            name: name.to_string(),
            url: Some(format!("https://{name}.apps.test")),
            status: Some("live".to_string()),
        })
    }
}
