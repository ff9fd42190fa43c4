//! Shared runtime configuration types for the devcell server.
//!
//! The server reads `devcell.toml` into [`DevcellConfig`]; every field has a
//! serde default so a missing or partial file is always valid. Loading from
//! disk lives in the server binary; this crate only owns the schema,
//! defaults, environment overrides and normalization.

use serde::{Deserialize, Serialize};

/// Canonical config file name.
pub const CONFIG_FILE_NAME: &str = "devcell.toml";

/// Top-level configuration (persisted as `devcell.toml`).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DevcellConfig {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub container: ContainerSettings,
    #[serde(default)]
    pub sync: SyncSettings,
    #[serde(default)]
    pub deploy: DeploySettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    #[serde(default = "default_max_terminals")]
    pub max_terminals_per_project: usize,
    /// Upper bound for a single `saveFile` body, in bytes.
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: usize,
    /// How long a project session survives with zero connections.
    #[serde(default = "default_teardown_grace_secs")]
    pub teardown_grace_secs: u64,
    /// Reject collaborator connections while no owner is connected.
    #[serde(default = "default_false")]
    pub require_owner_presence: bool,
    #[serde(default = "default_lock_contention_warn_ms")]
    pub lock_contention_warn_ms: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_terminals_per_project: default_max_terminals(),
            max_file_bytes: default_max_file_bytes(),
            teardown_grace_secs: default_teardown_grace_secs(),
            require_owner_presence: false,
            lock_contention_warn_ms: default_lock_contention_warn_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSettings {
    /// Host directory holding one workspace per project id.
    #[serde(default = "default_workspaces_root")]
    pub workspaces_root: String,
    /// Project directory inside each workspace.
    #[serde(default = "default_project_dir")]
    pub project_dir: String,
    /// Directory names never listed in the file tree.
    #[serde(default = "default_excluded_dirs")]
    pub excluded_dirs: Vec<String>,
    /// Directory names left out of download archives.
    #[serde(default = "default_archive_excluded_dirs")]
    pub archive_excluded_dirs: Vec<String>,
    #[serde(default = "default_routing_host")]
    pub routing_host: String,
    /// `{port}` and `{host}` are substituted.
    #[serde(default = "default_preview_url_template")]
    pub preview_url_template: String,
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default)]
    pub owner_uid: Option<u32>,
    #[serde(default)]
    pub owner_gid: Option<u32>,
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            workspaces_root: default_workspaces_root(),
            project_dir: default_project_dir(),
            excluded_dirs: default_excluded_dirs(),
            archive_excluded_dirs: default_archive_excluded_dirs(),
            routing_host: default_routing_host(),
            preview_url_template: default_preview_url_template(),
            shell: default_shell(),
            owner_uid: None,
            owner_gid: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    #[serde(default)]
    pub method: SyncMethod,
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default = "default_blob_batch_size")]
    pub blob_batch_size: usize,
    #[serde(default = "default_fetch_batch_size")]
    pub fetch_batch_size: usize,
    /// Pause between batches, in milliseconds, to stay under the remote rate limit.
    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    /// Directory of bare repositories used when `method = "native"`.
    #[serde(default)]
    pub native_repos_root: Option<String>,
    #[serde(default = "default_database_path")]
    pub database_path: String,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            method: SyncMethod::Api,
            api_base_url: default_api_base_url(),
            branch: default_branch(),
            blob_batch_size: default_blob_batch_size(),
            fetch_batch_size: default_fetch_batch_size(),
            batch_delay_ms: default_batch_delay_ms(),
            http_timeout_secs: default_http_timeout_secs(),
            native_repos_root: None,
            database_path: default_database_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncMethod {
    /// GitHub-compatible git-data REST API.
    #[default]
    #[serde(alias = "github", alias = "rest")]
    Api,
    /// Bare repositories on local disk, written through gix.
    #[serde(alias = "git_native", alias = "git-native", alias = "local")]
    Native,
    /// Unknown values are normalized by [`apply_compat_fallbacks`].
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DeploySettings {
    /// Deployment service base URL; deploy operations are unavailable when unset.
    #[serde(default)]
    pub base_url: Option<String>,
}

// ── Serde default functions ─────────────────────────────────────────────

fn default_false() -> bool {
    false
}
fn default_bind() -> String {
    "0.0.0.0:3000".to_string()
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_max_terminals() -> usize {
    4
}
fn default_max_file_bytes() -> usize {
    5 * 1024 * 1024
}
fn default_teardown_grace_secs() -> u64 {
    300
}
fn default_lock_contention_warn_ms() -> u64 {
    5_000
}
fn default_workspaces_root() -> String {
    "/var/lib/devcell/workspaces".to_string()
}
fn default_project_dir() -> String {
    "project".to_string()
}
fn default_excluded_dirs() -> Vec<String> {
    vec!["node_modules".to_string(), ".git".to_string()]
}
fn default_archive_excluded_dirs() -> Vec<String> {
    vec![
        "node_modules".to_string(),
        "venv".to_string(),
        ".venv".to_string(),
        "__pycache__".to_string(),
    ]
}
fn default_routing_host() -> String {
    "localhost".to_string()
}
fn default_preview_url_template() -> String {
    "https://{port}-{host}".to_string()
}
fn default_shell() -> String {
    "/bin/bash".to_string()
}
fn default_api_base_url() -> String {
    "https://api.github.com".to_string()
}
fn default_branch() -> String {
    "main".to_string()
}
fn default_blob_batch_size() -> usize {
    7
}
fn default_fetch_batch_size() -> usize {
    10
}
fn default_batch_delay_ms() -> u64 {
    1_000
}
fn default_http_timeout_secs() -> u64 {
    30
}
fn default_database_path() -> String {
    "devcell.db".to_string()
}

/// Apply environment overrides (`DEVCELL_BIND`, `DEVCELL_WORKSPACES_ROOT`,
/// `DEVCELL_DATABASE_PATH`) on top of a loaded config.
pub fn apply_env_overrides<F>(config: &mut DevcellConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
    if let Some(bind) = non_empty("DEVCELL_BIND") {
        config.server.bind = bind;
    }
    if let Some(root) = non_empty("DEVCELL_WORKSPACES_ROOT") {
        config.container.workspaces_root = root;
    }
    if let Some(path) = non_empty("DEVCELL_DATABASE_PATH") {
        config.sync.database_path = path;
    }
}

/// Apply compatibility fallbacks after loading raw TOML.
/// Returns true when any field was updated.
pub fn apply_compat_fallbacks(config: &mut DevcellConfig) -> bool {
    let mut changed = false;

    if config.sync.method == SyncMethod::Unknown {
        config.sync.method = if config.sync.native_repos_root.is_some() {
            SyncMethod::Native
        } else {
            SyncMethod::Api
        };
        changed = true;
    }

    // Zero-sized batches would never make progress.
    if config.sync.blob_batch_size == 0 {
        config.sync.blob_batch_size = default_blob_batch_size();
        changed = true;
    }
    if config.sync.fetch_batch_size == 0 {
        config.sync.fetch_batch_size = default_fetch_batch_size();
        changed = true;
    }
    if config.session.max_terminals_per_project == 0 {
        config.session.max_terminals_per_project = default_max_terminals();
        changed = true;
    }

    changed
}
