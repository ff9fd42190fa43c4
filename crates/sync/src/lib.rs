//! Repository sync for devcell projects.
//!
//! [`RepositorySyncPipeline`] builds one commit per sync out of blob, tree,
//! commit and fast-forward ref primitives, batched against the remote's rate
//! limit. [`SyncService`] layers project links, per-user clients and the
//! divergence guard on top.

pub mod error;
pub mod pipeline;
pub mod service;
pub mod store;

pub use error::{SyncError, SyncResult};
pub use pipeline::{CommitOutcome, PipelineConfig, PullStatus, RepositorySyncPipeline};
pub use service::SyncService;
pub use store::{ProjectLink, StoreError, SyncStore};

#[cfg(any(test, feature = "testing"))]
pub mod testing;
