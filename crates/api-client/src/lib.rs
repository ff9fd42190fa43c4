//! REST client for GitHub-compatible git-data APIs.
//!
//! [`GitHubClient`] implements [`devcell_core::RemoteRepository`] one HTTP
//! call per method; [`GitHubConnector`] builds a client per user token.

pub mod github;
pub mod retry;

pub use github::{GitHubClient, GitHubConnector};
pub use retry::RetryConfig;
