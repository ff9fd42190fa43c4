//! Repository sync backend over local git repositories, written with gix.
//!
//! [`NativeRemote`] speaks the same blob/tree/commit/ref protocol as the
//! hosted REST remote, so the sync pipeline can target either one.

pub mod error;
pub mod ops;
pub mod remote;

#[cfg(test)]
pub(crate) mod test_utils;

pub use error::{GitStorageError, Result};
pub use remote::{NativeConnector, NativeRemote};
