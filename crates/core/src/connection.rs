use serde::{Deserialize, Serialize};

pub type ProjectId = String;
pub type UserId = String;
pub type ConnectionId = String;

/// One attached client socket.
///
/// `is_owner` is decided once at connect time by the auth collaborator and
/// never changes for the lifetime of the connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    pub project_id: ProjectId,
    pub is_owner: bool,
}

impl Connection {
    /// Build a connection with a fresh random id.
    pub fn new(user_id: impl Into<String>, project_id: impl Into<String>, is_owner: bool) -> Self {
        Self {
            connection_id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            project_id: project_id.into(),
            is_owner,
        }
    }
}
