pub mod changes;
pub mod connection;
pub mod error;
pub mod paths;
pub mod remote;
pub mod tree;

pub use changes::{ChangedFilesSnapshot, RepoFile};
pub use connection::{Connection, ConnectionId, ProjectId, UserId};
pub use error::{ErrorKind, SessionError, SessionResult};
pub use remote::{RemoteCommit, RemoteConnector, RemoteError, RemoteRepository, RemoteResult, TreeEntry};
pub use tree::{FileNode, PathEntry, build_file_tree};

#[cfg(any(test, feature = "testing"))]
pub mod testing;
