//! Socket message shapes.
//!
//! Clients send `{"id": 7, "event": "saveFile", "payload": {...}}` and get
//! back exactly one `{"type": "ack", "id": 7, "ack": {"success": true, ...}}`.
//! Server-initiated messages are `{"type": "event", "event": "fileTree", ...}`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use devcell_core::{FileNode, SessionError};

use crate::container::TerminalSize;

#[derive(Debug, Clone, Deserialize)]
pub struct ClientFrame {
    #[serde(default)]
    pub id: Option<u64>,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
}

impl ClientFrame {
    pub fn parse(text: &str) -> Result<Self, SessionError> {
        serde_json::from_str(text)
            .map_err(|e| SessionError::InvalidRequest(format!("malformed frame: {e}")))
    }

    /// Decode `event` + `payload` into a typed request. A missing or `null`
    /// payload is treated as `{}`.
    pub fn request(&self) -> Result<Request, SessionError> {
        let payload = match &self.payload {
            Value::Null => Value::Object(Map::new()),
            other => other.clone(),
        };
        let tagged = serde_json::json!({ "event": self.event, "payload": payload });
        serde_json::from_value(tagged)
            .map_err(|e| SessionError::InvalidRequest(format!("{}: {e}", self.event)))
    }
}

fn default_rows() -> u16 {
    TerminalSize::default().rows
}

fn default_cols() -> u16 {
    TerminalSize::default().cols
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(
    tag = "event",
    content = "payload",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum Request {
    ListApps {},
    GetAppCreatedAt { name: String },
    AppExists { name: String },
    Deploy { name: String },

    CreateTerminal {
        id: String,
        #[serde(default = "default_rows")]
        rows: u16,
        #[serde(default = "default_cols")]
        cols: u16,
    },
    ResizeTerminal { id: String, rows: u16, cols: u16 },
    TerminalData { id: String, data: String },
    CloseTerminal { id: String },

    GetFileTree {},
    GetFile { path: String },
    SaveFile { path: String, content: String },
    CreateFile { path: String },
    CreateFolder { path: String },
    RenameFile { path: String, new_name: String },
    MoveFile { path: String, target_dir: String },
    DeleteFile { path: String },
    DeleteFolder { path: String },
    DownloadArchive {},

    CreateCommit {
        message: String,
        #[serde(default)]
        resolved: bool,
    },
    CheckIfPullNeeded {},
    GetLatestFiles {},
    GetChangedFiles {},
    LinkRepo { repository_id: String },
    RemoveRepo {},
    LogoutUser {},

    Heartbeat {},
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ListApps {} => "listApps",
            Self::GetAppCreatedAt { .. } => "getAppCreatedAt",
            Self::AppExists { .. } => "appExists",
            Self::Deploy { .. } => "deploy",
            Self::CreateTerminal { .. } => "createTerminal",
            Self::ResizeTerminal { .. } => "resizeTerminal",
            Self::TerminalData { .. } => "terminalData",
            Self::CloseTerminal { .. } => "closeTerminal",
            Self::GetFileTree {} => "getFileTree",
            Self::GetFile { .. } => "getFile",
            Self::SaveFile { .. } => "saveFile",
            Self::CreateFile { .. } => "createFile",
            Self::CreateFolder { .. } => "createFolder",
            Self::RenameFile { .. } => "renameFile",
            Self::MoveFile { .. } => "moveFile",
            Self::DeleteFile { .. } => "deleteFile",
            Self::DeleteFolder { .. } => "deleteFolder",
            Self::DownloadArchive {} => "downloadArchive",
            Self::CreateCommit { .. } => "createCommit",
            Self::CheckIfPullNeeded {} => "checkIfPullNeeded",
            Self::GetLatestFiles {} => "getLatestFiles",
            Self::GetChangedFiles {} => "getChangedFiles",
            Self::LinkRepo { .. } => "linkRepo",
            Self::RemoveRepo {} => "removeRepo",
            Self::LogoutUser {} => "logoutUser",
            Self::Heartbeat {} => "heartbeat",
        }
    }

    /// Operations that change project-wide state and are limited to owners.
    pub fn owner_only(&self) -> bool {
        matches!(
            self,
            Self::Deploy { .. }
                | Self::CreateCommit { .. }
                | Self::LinkRepo { .. }
                | Self::RemoveRepo {}
        )
    }

    /// Requests whose run time grows with the number of project files. They
    /// are awaited to completion instead of being cut off by the request
    /// timeout.
    pub fn unbounded(&self) -> bool {
        matches!(
            self,
            Self::Deploy { .. } | Self::CreateCommit { .. } | Self::GetLatestFiles {}
        )
    }
}

/// Reply to one request. Extra result fields are flattened next to
/// `success`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ack {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl Ack {
    pub fn ok(data: Value) -> Self {
        let data = match data {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("data".to_string(), other);
                map
            }
        };
        Self {
            success: true,
            error: None,
            code: None,
            data,
        }
    }

    pub fn err(e: &SessionError) -> Self {
        Self {
            success: false,
            error: Some(e.to_string()),
            code: Some(e.kind().code()),
            data: Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(
    tag = "event",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    FileTree { tree: Vec<FileNode> },
    TerminalResponse { terminal_id: String, data: String },
    PreviewUrl { terminal_id: String, port: u16, url: String },
    TerminalClosed { terminal_id: String },
    OwnerPresence { connected: bool },
    Disconnect { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    Ack { id: Option<u64>, ack: Ack },
    Event(ServerEvent),
}

impl ServerMessage {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            tracing::error!(error = %e, "failed to encode server message");
            r#"{"type":"ack","id":null,"ack":{"success":false,"code":"internal"}}"#.to_string()
        })
    }
}
