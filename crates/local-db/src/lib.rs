use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::Mutex;

use devcell_sync::{ProjectLink, StoreError, SyncStore};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS project_repos (
    project_id      TEXT PRIMARY KEY,
    repository_id   TEXT NOT NULL,
    last_synced_sha TEXT,
    updated_at      TEXT NOT NULL DEFAULT (datetime('now'))
);
CREATE TABLE IF NOT EXISTS user_tokens (
    user_id    TEXT PRIMARY KEY,
    token      TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
";

/// SQLite store for per-project repository links and per-user credentials.
/// Thread-safe: wraps the connection in a Mutex so it can be shared via `Arc<LocalDb>`.
pub struct LocalDb {
    conn: Mutex<Connection>,
}

impl LocalDb {
    /// Open (or create) the database at a specific path.
    pub fn open_path(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create dir for {}", path.display()))?;
        }
        let conn =
            Connection::open(path).with_context(|| format!("open db {}", path.display()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory database, used by tests and ephemeral deployments.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|p| p.into_inner())
    }

    // ── Project links ──────────────────────────────────────────────────

    pub fn get_project_link(&self, project_id: &str) -> Result<Option<ProjectLink>> {
        let link = self
            .conn()
            .query_row(
                "SELECT repository_id, last_synced_sha FROM project_repos WHERE project_id = ?1",
                params![project_id],
                |row| {
                    Ok(ProjectLink {
                        repository_id: row.get(0)?,
                        last_synced_sha: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(link)
    }

    pub fn link_project(&self, project_id: &str, repository_id: &str) -> Result<()> {
        self.conn().execute(
            "INSERT INTO project_repos (project_id, repository_id, last_synced_sha, updated_at) \
             VALUES (?1, ?2, NULL, datetime('now')) \
             ON CONFLICT(project_id) DO UPDATE SET repository_id=excluded.repository_id, \
             last_synced_sha=NULL, updated_at=datetime('now')",
            params![project_id, repository_id],
        )?;
        Ok(())
    }

    /// Record the commit a project was synced to. Fails for unlinked projects.
    pub fn record_synced_sha(&self, project_id: &str, sha: &str) -> Result<()> {
        let updated = self.conn().execute(
            "UPDATE project_repos SET last_synced_sha = ?2, updated_at = datetime('now') \
             WHERE project_id = ?1",
            params![project_id, sha],
        )?;
        anyhow::ensure!(updated == 1, "project {project_id} has no linked repository");
        Ok(())
    }

    pub fn unlink_project(&self, project_id: &str) -> Result<()> {
        self.conn().execute(
            "DELETE FROM project_repos WHERE project_id = ?1",
            params![project_id],
        )?;
        Ok(())
    }

    // ── Credentials ────────────────────────────────────────────────────

    /// Stored token, verbatim (an empty string is returned as-is).
    pub fn get_token(&self, user_id: &str) -> Result<Option<String>> {
        let token = self
            .conn()
            .query_row(
                "SELECT token FROM user_tokens WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(token)
    }

    pub fn put_token(&self, user_id: &str, token: &str) -> Result<()> {
        self.conn().execute(
            "INSERT INTO user_tokens (user_id, token, updated_at) \
             VALUES (?1, ?2, datetime('now')) \
             ON CONFLICT(user_id) DO UPDATE SET token=excluded.token, updated_at=datetime('now')",
            params![user_id, token],
        )?;
        Ok(())
    }
}

fn store_err(e: anyhow::Error) -> StoreError {
    StoreError::Backend(format!("{e:#}"))
}

impl SyncStore for LocalDb {
    fn project_link(&self, project_id: &str) -> Result<Option<ProjectLink>, StoreError> {
        self.get_project_link(project_id).map_err(store_err)
    }

    fn set_project_repo(&self, project_id: &str, repository_id: &str) -> Result<(), StoreError> {
        self.link_project(project_id, repository_id)
            .map_err(store_err)
    }

    fn set_last_synced_sha(&self, project_id: &str, sha: &str) -> Result<(), StoreError> {
        self.record_synced_sha(project_id, sha).map_err(store_err)
    }

    fn clear_project_repo(&self, project_id: &str) -> Result<(), StoreError> {
        self.unlink_project(project_id).map_err(store_err)
    }

    fn user_token(&self, user_id: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .get_token(user_id)
            .map_err(store_err)?
            .filter(|t| !t.is_empty()))
    }

    fn set_user_token(&self, user_id: &str, token: &str) -> Result<(), StoreError> {
        self.put_token(user_id, token).map_err(store_err)
    }
}
