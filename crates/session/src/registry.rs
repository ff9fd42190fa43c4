//! Which connections are attached to which project.

use std::collections::HashMap;

use devcell_core::{Connection, ConnectionId, ProjectId};

#[derive(Debug, Default)]
struct ProjectConnections {
    connections: HashMap<ConnectionId, Connection>,
    owner_count: usize,
}

/// Per-project connection set plus a count of attached owner connections.
///
/// The owner count tracks connections, not users: an owner with two tabs
/// open counts twice, so closing one tab keeps the owner present.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    projects: HashMap<ProjectId, ProjectConnections>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `conn`. Returns `false` when the id was already present, in
    /// which case nothing changes.
    pub fn add_connection(&mut self, conn: Connection) -> bool {
        let project = self.projects.entry(conn.project_id.clone()).or_default();
        if project.connections.contains_key(&conn.connection_id) {
            return false;
        }
        if conn.is_owner {
            project.owner_count += 1;
        }
        project.connections.insert(conn.connection_id.clone(), conn);
        true
    }

    /// Detach a connection. Unknown ids are ignored.
    pub fn remove_connection(
        &mut self,
        project_id: &str,
        connection_id: &str,
    ) -> Option<Connection> {
        let project = self.projects.get_mut(project_id)?;
        let removed = project.connections.remove(connection_id)?;
        if removed.is_owner {
            project.owner_count = project.owner_count.saturating_sub(1);
        }
        if project.connections.is_empty() {
            self.projects.remove(project_id);
        }
        Some(removed)
    }

    pub fn owner_is_connected(&self, project_id: &str) -> bool {
        self.owner_count(project_id) > 0
    }

    pub fn owner_count(&self, project_id: &str) -> usize {
        self.projects
            .get(project_id)
            .map_or(0, |p| p.owner_count)
    }

    pub fn connection_count(&self, project_id: &str) -> usize {
        self.projects
            .get(project_id)
            .map_or(0, |p| p.connections.len())
    }

    pub fn connections_for(&self, project_id: &str) -> Vec<Connection> {
        self.projects
            .get(project_id)
            .map(|p| p.connections.values().cloned().collect())
            .unwrap_or_default()
    }
}
