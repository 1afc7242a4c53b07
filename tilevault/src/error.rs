use thiserror::Error;

use crate::storage::{StorageError, Uri, UriError};

/// A storage engine error.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The URI does not exist or is not the expected kind of object.
    #[error("not found: {0}")]
    NotFound(String),
    /// A create operation would overwrite an existing object.
    #[error("already exists: {0}")]
    AlreadyExists(Uri),
    /// The operation requires an open array, or the array is open in the
    /// wrong mode.
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// A bad configuration value, key length, subarray, or buffer.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The offered encryption key does not match the array's validation
    /// record.
    #[error("encryption key mismatch")]
    Unauthorized,
    /// A virtual filesystem failure, surfaced unchanged.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// The query observed cancellation at a checkpoint.
    #[error("query cancelled")]
    Cancelled,
    /// The on-disk format version is not understood by this engine.
    #[error("unsupported format version {0}")]
    UnsupportedVersion(u32),
    /// An exclusive lock could not be obtained within its bound, or a
    /// retirement target was not in the expected state.
    #[error("conflict: {0}")]
    Conflict(String),
    /// The operation is delegated to an external collaborator that is not
    /// installed (sparse execution, non-identity filters, REST).
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl From<UriError> for Error {
    fn from(err: UriError) -> Self {
        Self::InvalidArgument(err.to_string())
    }
}

/// A specialized result type for storage engine operations.
pub type Result<T> = std::result::Result<T, Error>;
