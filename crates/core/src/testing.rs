use crate::{Connection, PathEntry, RepoFile};

/// Owner connection for `project` with a predictable id.
pub fn owner(project: &str) -> Connection {
    connection("owner", project, true)
}

/// Collaborator (non-owner) connection for `project`.
pub fn collaborator(project: &str) -> Connection {
    connection("guest", project, false)
}

pub fn connection(user: &str, project: &str, is_owner: bool) -> Connection {
    Connection {
        connection_id: format!("conn-{}", next_id()),
        user_id: user.to_string(),
        project_id: project.to_string(),
        is_owner,
    }
}

/// Parse `find`-style lines (`dir/` marks directories).
pub fn listing(lines: &[&str]) -> Vec<PathEntry> {
    lines.iter().filter_map(|l| PathEntry::parse(l)).collect()
}

/// `n` small files named `file-00.txt`, `file-01.txt`, ...
pub fn numbered_files(n: usize) -> Vec<RepoFile> {
    (0..n)
        .map(|i| RepoFile::new(format!("file-{i:02}.txt"), format!("content {i}\n")))
        .collect()
}

fn next_id() -> u32 {
    use std::sync::atomic::{AtomicU32, Ordering};
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}
