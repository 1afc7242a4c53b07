//! The virtual filesystem API for the [`tilevault`](https://docs.rs/tilevault/latest/tilevault/index.html) crate.
//!
//! A tilevault backend is a system that stores the directory tree of an array:
//! a local filesystem, an object store, a distributed filesystem, etc.
//! Backends implement the [`VfsBackend`] capability trait and are selected by
//! URI scheme through the [`Vfs`] facade, so the engine core never inspects
//! schemes itself.
//!
//! This crate includes an in-memory backend. The local filesystem backend
//! lives in the `tilevault_filesystem` crate.
//!
//! ## Licence
//! `tilevault_storage` is licensed under either of
//! - the Apache License, Version 2.0 or <http://www.apache.org/licenses/LICENSE-2.0> or
//! - the MIT license or <http://opensource.org/licenses/MIT>, at your option.

mod backend;
mod memory;
mod uri;
mod vfs;

use thiserror::Error;

pub use backend::{FileLock, LockGuard, VfsBackend};
pub use memory::MemoryBackend;
pub use uri::{Uri, UriError};
pub use vfs::Vfs;

/// The type for bytes returned by read methods.
///
/// An alias for [`bytes::Bytes`].
pub type Bytes = bytes::Bytes;

/// A storage error.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    /// An IO error.
    #[error(transparent)]
    IOError(#[from] std::io::Error),
    /// The URI does not exist.
    #[error("no such file or directory: {0}")]
    NotFound(Uri),
    /// An invalid URI.
    #[error(transparent)]
    UriError(#[from] UriError),
    /// No backend is registered for the URI scheme.
    #[error("no backend registered for scheme {0:?}")]
    UnknownScheme(String),
    /// A write operation was attempted on a read only backend.
    #[error("a write operation was attempted on a read only backend")]
    ReadOnly,
    /// The requested method is not supported by the backend.
    #[error("{0}")]
    Unsupported(String),
    /// Any other error.
    #[error("{0}")]
    Other(String),
}

impl From<&str> for StorageError {
    fn from(err: &str) -> Self {
        Self::Other(err.to_string())
    }
}

impl From<String> for StorageError {
    fn from(err: String) -> Self {
        Self::Other(err)
    }
}
