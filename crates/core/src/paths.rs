//! Path helpers for container paths (always `/`-separated, never host paths).

use crate::error::{SessionError, SessionResult};

/// Strip a leading slash and the project-root prefix, yielding the path used
/// inside the remote repository (`/home/user/project/src/a.rs` -> `src/a.rs`).
pub fn normalize_repo_path(path: &str, project_root: &str) -> String {
    let root = project_root.trim_matches('/');
    let trimmed = path.trim_start_matches('/');
    let rel = if root.is_empty() {
        trimmed
    } else if trimmed == root {
        ""
    } else {
        trimmed
            .strip_prefix(root)
            .and_then(|rest| rest.strip_prefix('/'))
            .unwrap_or(trimmed)
    };
    rel.trim_start_matches('/').to_string()
}

/// Resolve a client-supplied path against `project_root`, refusing anything
/// that would land outside of it.
///
/// Relative paths are taken relative to the root. `.` segments and repeated
/// slashes are collapsed; any `..` segment is rejected outright.
pub fn resolve_in_root(project_root: &str, path: &str) -> SessionResult<String> {
    let root = format!("/{}", project_root.trim_matches('/'));
    let candidate = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{root}/{path}")
    };

    let mut segments = Vec::new();
    for segment in candidate.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                return Err(SessionError::PermissionDenied(format!(
                    "path escapes project root: {path}"
                )));
            }
            other => segments.push(other),
        }
    }
    let resolved = format!("/{}", segments.join("/"));

    let root_prefix = format!("{}/", root.trim_end_matches('/'));
    if resolved == root || resolved.starts_with(&root_prefix) || root == "/" {
        Ok(resolved)
    } else {
        Err(SessionError::PermissionDenied(format!(
            "path outside project root: {path}"
        )))
    }
}

/// Final segment of a `/`-separated path.
pub fn file_name(path: &str) -> &str {
    path.trim_end_matches('/').rsplit('/').next().unwrap_or(path)
}

/// Everything before the final segment; `/` for top-level entries.
pub fn parent_dir(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &trimmed[..idx],
    }
}

pub fn join(dir: &str, name: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), name.trim_start_matches('/'))
}
