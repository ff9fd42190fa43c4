//! Per-project session coordination for devcell.
//!
//! A [`SessionDispatcher`] attaches client sockets to project sessions. Each
//! session mirrors the container's file tree, owns the project's shells and
//! routes repository sync and deploy requests, with mutations serialized per
//! project through a [`LockManager`].

pub mod container;
pub mod deploy;
pub mod dispatcher;
pub mod file_tree;
pub mod local;
pub mod lock;
pub mod protocol;
pub mod registry;
pub mod terminal;

pub use container::{ContainerProvider, ContainerRuntime, FsEvent, FsEventKind, TerminalSize};
pub use deploy::{AppSummary, DeployResult, Deployer, HttpDeployer};
pub use dispatcher::{ConnectionSink, DispatcherConfig, SessionDispatcher};
pub use file_tree::{FileTreeMirror, WatchSubscription};
pub use local::{LocalContainer, LocalContainerProvider};
pub use lock::LockManager;
pub use protocol::{Ack, ClientFrame, Request, ServerEvent, ServerMessage};
pub use registry::ConnectionRegistry;
pub use terminal::{TerminalInfo, TerminalOutput, TerminalSessionBroker, detect_ports};

#[cfg(any(test, feature = "testing"))]
pub mod testing;
