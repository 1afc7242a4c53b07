use crate::{Bytes, StorageError, Uri};

/// An acquired advisory lock. Dropping the guard releases the lock.
pub trait LockGuard: Send {}

/// An exclusive advisory file lock handle returned by
/// [`VfsBackend::flock_exclusive`].
///
/// The lock is held until the handle is dropped (or passed to
/// [`Vfs::funlock`](crate::Vfs::funlock)).
pub struct FileLock(#[allow(dead_code)] Box<dyn LockGuard>);

impl FileLock {
    /// Wrap a backend lock guard.
    #[must_use]
    pub fn new(guard: Box<dyn LockGuard>) -> Self {
        Self(guard)
    }
}

impl std::fmt::Debug for FileLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FileLock")
    }
}

/// The capability of a filesystem backend.
///
/// All operations are blocking. Backends must be internally thread-safe.
/// Directory-capable stores implement the directory operations natively;
/// flat stores may emulate them.
pub trait VfsBackend: Send + Sync {
    /// Read `nbytes` from `uri` starting at byte `offset`.
    ///
    /// # Errors
    /// Returns [`StorageError::NotFound`] if the file does not exist and an
    /// error if fewer than `nbytes` are available at `offset`.
    fn read(&self, uri: &Uri, offset: u64, nbytes: u64) -> Result<Bytes, StorageError>;

    /// Read an entire file.
    fn read_all(&self, uri: &Uri) -> Result<Bytes, StorageError>;

    /// Append `data` to the file at `uri`, creating it if absent.
    fn write(&self, uri: &Uri, data: &[u8]) -> Result<(), StorageError>;

    /// Create a directory (and any missing parents).
    fn create_dir(&self, uri: &Uri) -> Result<(), StorageError>;

    /// Create an empty file if one does not exist.
    fn touch(&self, uri: &Uri) -> Result<(), StorageError>;

    /// Whether `uri` is an existing directory.
    fn is_dir(&self, uri: &Uri) -> Result<bool, StorageError>;

    /// Whether `uri` is an existing file.
    fn is_file(&self, uri: &Uri) -> Result<bool, StorageError>;

    /// The size of the file at `uri` in bytes.
    fn file_size(&self, uri: &Uri) -> Result<u64, StorageError>;

    /// The immediate children of the directory at `uri`, in sorted order.
    fn ls(&self, uri: &Uri) -> Result<Vec<Uri>, StorageError>;

    /// Remove the file at `uri`. Removing a missing file is not an error.
    fn remove_file(&self, uri: &Uri) -> Result<(), StorageError>;

    /// Remove the directory at `uri` and everything beneath it.
    fn remove_dir(&self, uri: &Uri) -> Result<(), StorageError>;

    /// Rename `from` to `to`, overwriting `to` if it exists.
    fn move_path(&self, from: &Uri, to: &Uri) -> Result<(), StorageError>;

    /// Acquire an exclusive advisory lock on the file at `uri`, blocking
    /// until it is available. The file is created if absent.
    fn flock_exclusive(&self, uri: &Uri) -> Result<FileLock, StorageError>;
}
