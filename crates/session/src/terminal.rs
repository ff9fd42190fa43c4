//! Per-project PTY sessions and dev-server preview detection.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, LazyLock, Mutex};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use devcell_core::{SessionError, SessionResult};

use crate::container::{ContainerRuntime, TerminalControl, TerminalSize};

static ANSI_ESCAPE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07]*\x07").unwrap());

static LOCAL_PORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:localhost|127\.0\.0\.1|0\.0\.0\.0|\[::\]):(\d{2,5})\b").unwrap()
});

/// Unterminated output kept back for port scanning, so a URL split across
/// reads is seen whole. Longer partial lines are scanned as they are.
const MAX_PARTIAL_LINE: usize = 4096;

/// Ports announced as `localhost:PORT` style URLs, in order of appearance.
pub fn detect_ports(output: &str) -> Vec<u16> {
    scan_ports(output, false)
}

/// Ports in an unterminated line. A match running to the end of the text is
/// skipped since more digits may still arrive.
fn detect_settled_ports(partial: &str) -> Vec<u16> {
    scan_ports(partial, true)
}

fn scan_ports(output: &str, settled_only: bool) -> Vec<u16> {
    let plain = ANSI_ESCAPE_RE.replace_all(output, "");
    let mut ports = Vec::new();
    for caps in LOCAL_PORT_RE.captures_iter(&plain) {
        let Some(digits) = caps.get(1) else {
            continue;
        };
        if settled_only && digits.end() == plain.len() {
            continue;
        }
        if let Ok(port) = digits.as_str().parse::<u16>() {
            if port > 0 && !ports.contains(&port) {
                ports.push(port);
            }
        }
    }
    ports
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalInfo {
    pub id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalOutput {
    Data { terminal_id: String, data: String },
    PreviewUrl { terminal_id: String, port: u16, url: String },
    Closed { terminal_id: String },
}

struct TerminalEntry {
    info: TerminalInfo,
    control: Arc<dyn TerminalControl>,
}

type TerminalTable = Arc<Mutex<HashMap<String, TerminalEntry>>>;

/// Owns a project's shells and relays their output.
///
/// Creation is expected to run under the project lock so the count check and
/// the insert cannot interleave with another creation.
pub struct TerminalSessionBroker {
    container: Arc<dyn ContainerRuntime>,
    max_terminals: usize,
    preview_template: String,
    terminals: TerminalTable,
}

impl TerminalSessionBroker {
    pub fn new(
        container: Arc<dyn ContainerRuntime>,
        max_terminals: usize,
        preview_template: impl Into<String>,
    ) -> Self {
        Self {
            container,
            max_terminals,
            preview_template: preview_template.into(),
            terminals: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<String, TerminalEntry>> {
        self.terminals.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Open a shell for `id` and start relaying its output into `output`.
    ///
    /// Creating an id that already exists returns the existing terminal.
    pub async fn create_terminal(
        &self,
        id: &str,
        size: TerminalSize,
        output: mpsc::UnboundedSender<TerminalOutput>,
    ) -> SessionResult<TerminalInfo> {
        if id.is_empty() {
            return Err(SessionError::InvalidRequest("terminal id is empty".into()));
        }
        {
            let table = self.table();
            if let Some(existing) = table.get(id) {
                return Ok(existing.info.clone());
            }
            if table.len() >= self.max_terminals {
                return Err(SessionError::ResourceLimit(format!(
                    "at most {} terminals per project",
                    self.max_terminals
                )));
            }
        }

        let channels = self.container.open_terminal(size).await?;
        let info = TerminalInfo {
            id: id.to_string(),
            created_at: Utc::now(),
        };
        let control: Arc<dyn TerminalControl> = Arc::from(channels.control);
        self.table().insert(
            id.to_string(),
            TerminalEntry {
                info: info.clone(),
                control,
            },
        );

        tokio::spawn(relay(
            info.clone(),
            channels.output,
            output,
            self.terminals.clone(),
            self.preview_template.clone(),
            self.container.routing_host().to_string(),
        ));
        info!(terminal_id = id, rows = size.rows, cols = size.cols, "terminal created");
        Ok(info)
    }

    /// Forward client keystrokes. Unknown ids are ignored.
    pub fn write(&self, id: &str, data: &str) -> SessionResult<()> {
        match self.control(id) {
            Some(control) => control.write(data.as_bytes()),
            None => {
                debug!(terminal_id = id, "data for unknown terminal");
                Ok(())
            }
        }
    }

    pub fn resize(&self, id: &str, size: TerminalSize) -> SessionResult<()> {
        match self.control(id) {
            Some(control) => control.resize(size),
            None => Ok(()),
        }
    }

    /// Kill the shell and forget it. Unknown ids are ignored.
    pub fn close(&self, id: &str) -> SessionResult<()> {
        let entry = self.table().remove(id);
        if let Some(entry) = entry {
            entry.control.kill()?;
            info!(terminal_id = id, "terminal closed");
        }
        Ok(())
    }

    pub fn close_all(&self) {
        let entries: Vec<_> = self.table().drain().collect();
        for (id, entry) in entries {
            if let Err(e) = entry.control.kill() {
                warn!(terminal_id = %id, error = %e, "failed to kill terminal");
            }
        }
    }

    pub fn terminal_count(&self) -> usize {
        self.table().len()
    }

    fn control(&self, id: &str) -> Option<Arc<dyn TerminalControl>> {
        self.table().get(id).map(|e| e.control.clone())
    }
}

async fn relay(
    info: TerminalInfo,
    mut pty: mpsc::UnboundedReceiver<Vec<u8>>,
    output: mpsc::UnboundedSender<TerminalOutput>,
    terminals: TerminalTable,
    template: String,
    host: String,
) {
    let terminal_id = info.id.clone();
    let mut announced = HashSet::new();
    let mut partial = String::new();
    while let Some(chunk) = pty.recv().await {
        let data = String::from_utf8_lossy(&chunk).into_owned();

        partial.push_str(&data);
        let scan = match partial.rfind('\n') {
            Some(idx) => {
                let rest = partial.split_off(idx + 1);
                std::mem::replace(&mut partial, rest)
            }
            None if partial.len() > MAX_PARTIAL_LINE => std::mem::take(&mut partial),
            None => String::new(),
        };
        let mut ports = detect_ports(&scan);
        ports.extend(detect_settled_ports(&partial));
        for port in ports {
            if announced.insert(port) {
                let url = render_preview_url(&template, &host, port);
                info!(terminal_id = %terminal_id, port, url = %url, "dev server detected");
                let _ = output.send(TerminalOutput::PreviewUrl {
                    terminal_id: terminal_id.clone(),
                    port,
                    url,
                });
            }
        }

        if output
            .send(TerminalOutput::Data {
                terminal_id: terminal_id.clone(),
                data,
            })
            .is_err()
        {
            break;
        }
    }

    let stale = {
        // The id may have been reused by a newer terminal since this one closed.
        let mut table = terminals.lock().unwrap_or_else(|p| p.into_inner());
        match table.get(&terminal_id) {
            Some(entry) if entry.info == info => table.remove(&terminal_id),
            _ => None,
        }
    };
    if let Some(entry) = stale {
        let _ = entry.control.kill();
    }
    debug!(terminal_id = %terminal_id, "terminal output ended");
    let _ = output.send(TerminalOutput::Closed { terminal_id });
}

fn render_preview_url(template: &str, host: &str, port: u16) -> String {
    template
        .replace("{port}", &port.to_string())
        .replace("{host}", host)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeContainer;

    #[test]
    fn detects_ports_through_ansi_noise() {
        let out = "\x1b[32m  ➜  Local:   \x1b[1mhttp://localhost:\x1b[22m5173/\x1b[0m\n\
                   listening on 0.0.0.0:8080 and 127.0.0.1:8080";
        assert_eq!(detect_ports(out), vec![5173, 8080]);
        assert!(detect_ports("no ports here: 1234").is_empty());
    }

    #[test]
    fn preview_url_fills_port_and_host() {
        assert_eq!(
            render_preview_url("https://{port}-{host}", "sbx.example.dev", 8080),
            "https://8080-sbx.example.dev"
        );
    }

    fn broker(container: &Arc<FakeContainer>, max: usize) -> TerminalSessionBroker {
        TerminalSessionBroker::new(container.clone(), max, "https://{port}-{host}")
    }

    #[tokio::test]
    async fn cap_is_enforced_and_duplicate_ids_are_reused() {
        let container = Arc::new(FakeContainer::new("/project"));
        let broker = broker(&container, 2);
        let (tx, _rx) = mpsc::unbounded_channel();

        let first = broker
            .create_terminal("t1", TerminalSize::default(), tx.clone())
            .await
            .unwrap();
        let again = broker
            .create_terminal("t1", TerminalSize::default(), tx.clone())
            .await
            .unwrap();
        assert_eq!(first, again);
        broker
            .create_terminal("t2", TerminalSize::default(), tx.clone())
            .await
            .unwrap();

        let err = broker
            .create_terminal("t3", TerminalSize::default(), tx)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::ResourceLimit(_)), "got {err}");
        assert_eq!(container.terminals().len(), 2);
    }

    #[tokio::test]
    async fn preview_url_is_announced_once_per_port() {
        let container = Arc::new(FakeContainer::new("/project"));
        let broker = broker(&container, 4);
        let (tx, mut rx) = mpsc::unbounded_channel();
        broker
            .create_terminal("t1", TerminalSize::default(), tx)
            .await
            .unwrap();
        let pty = container.terminals().remove(0);

        pty.print("ready on http://localhost:30");
        pty.print("00/\n");
        pty.print("again http://localhost:3000/\n");
        pty.exit();

        let mut previews = Vec::new();
        let mut data = String::new();
        while let Some(event) = rx.recv().await {
            match event {
                TerminalOutput::PreviewUrl { port, url, .. } => previews.push((port, url)),
                TerminalOutput::Data { data: chunk, .. } => data.push_str(&chunk),
                TerminalOutput::Closed { terminal_id } => {
                    assert_eq!(terminal_id, "t1");
                    break;
                }
            }
        }
        assert_eq!(previews, vec![(3000, "https://3000-sandbox.test".to_string())]);
        assert!(data.contains("again"));
        assert_eq!(broker.terminal_count(), 0);
    }

    #[test]
    fn unfinished_port_numbers_are_held_back() {
        assert_eq!(detect_settled_ports("ready on http://localhost:51"), Vec::<u16>::new());
        assert_eq!(detect_settled_ports("ready on http://localhost:5173/"), vec![5173]);
    }

    #[tokio::test]
    async fn banner_without_newline_is_announced() {
        let container = Arc::new(FakeContainer::new("/project"));
        let broker = broker(&container, 4);
        let (tx, mut rx) = mpsc::unbounded_channel();
        broker
            .create_terminal("t1", TerminalSize::default(), tx)
            .await
            .unwrap();
        let pty = container.terminals().remove(0);

        pty.print("  Local:   http://localhost:5173/ ");
        match rx.recv().await {
            Some(TerminalOutput::PreviewUrl { port, .. }) => assert_eq!(port, 5173),
            other => panic!("expected a preview url, got {other:?}"),
        }

        pty.print("\nready\n");
        pty.exit();
        let mut previews = 0;
        while let Some(event) = rx.recv().await {
            match event {
                TerminalOutput::PreviewUrl { .. } => previews += 1,
                TerminalOutput::Data { .. } => {}
                TerminalOutput::Closed { .. } => break,
            }
        }
        assert_eq!(previews, 0);
    }

    #[tokio::test]
    async fn unknown_ids_are_noops_and_close_kills() {
        let container = Arc::new(FakeContainer::new("/project"));
        let broker = broker(&container, 4);
        broker.write("nope", "ls\n").unwrap();
        broker.resize("nope", TerminalSize { rows: 1, cols: 1 }).unwrap();
        broker.close("nope").unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        broker
            .create_terminal("t1", TerminalSize::default(), tx)
            .await
            .unwrap();
        broker.write("t1", "ls\n").unwrap();
        broker.resize("t1", TerminalSize { rows: 40, cols: 120 }).unwrap();
        broker.close("t1").unwrap();

        let pty = container.terminals().remove(0);
        assert_eq!(pty.input(), "ls\n");
        assert_eq!(pty.sizes().last(), Some(&TerminalSize { rows: 40, cols: 120 }));
        assert!(pty.killed());
        assert_eq!(broker.terminal_count(), 0);
    }
}
