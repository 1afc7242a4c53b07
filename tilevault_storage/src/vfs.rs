use std::collections::HashMap;
use std::sync::Arc;

use crate::{Bytes, FileLock, MemoryBackend, StorageError, Uri, VfsBackend};

/// The virtual filesystem facade.
///
/// A [`Vfs`] routes every operation to the [`VfsBackend`] registered for the
/// URI scheme. An in-memory backend is registered for `mem` by default.
#[derive(Clone)]
pub struct Vfs {
    backends: HashMap<String, Arc<dyn VfsBackend>>,
}

impl std::fmt::Debug for Vfs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut schemes: Vec<&str> = self.backends.keys().map(String::as_str).collect();
        schemes.sort_unstable();
        f.debug_struct("Vfs").field("schemes", &schemes).finish()
    }
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}

impl Vfs {
    /// Create a facade with the in-memory backend registered for `mem`.
    #[must_use]
    pub fn new() -> Self {
        let mut vfs = Self {
            backends: HashMap::new(),
        };
        vfs.register("mem", Arc::new(MemoryBackend::new()));
        vfs
    }

    /// Register `backend` for `scheme`, replacing any previous registration.
    pub fn register(&mut self, scheme: impl Into<String>, backend: Arc<dyn VfsBackend>) {
        self.backends.insert(scheme.into(), backend);
    }

    fn backend(&self, uri: &Uri) -> Result<&Arc<dyn VfsBackend>, StorageError> {
        self.backends
            .get(uri.scheme())
            .ok_or_else(|| StorageError::UnknownScheme(uri.scheme().to_string()))
    }

    /// Read `nbytes` from `uri` starting at byte `offset`.
    pub fn read(&self, uri: &Uri, offset: u64, nbytes: u64) -> Result<Bytes, StorageError> {
        self.backend(uri)?.read(uri, offset, nbytes)
    }

    /// Read an entire file.
    pub fn read_all(&self, uri: &Uri) -> Result<Bytes, StorageError> {
        self.backend(uri)?.read_all(uri)
    }

    /// Append `data` to the file at `uri`, creating it if absent.
    pub fn write(&self, uri: &Uri, data: &[u8]) -> Result<(), StorageError> {
        self.backend(uri)?.write(uri, data)
    }

    /// Create a directory (and any missing parents).
    pub fn create_dir(&self, uri: &Uri) -> Result<(), StorageError> {
        self.backend(uri)?.create_dir(uri)
    }

    /// Create an empty file if one does not exist.
    pub fn touch(&self, uri: &Uri) -> Result<(), StorageError> {
        self.backend(uri)?.touch(uri)
    }

    /// Whether `uri` is an existing directory.
    pub fn is_dir(&self, uri: &Uri) -> Result<bool, StorageError> {
        self.backend(uri)?.is_dir(uri)
    }

    /// Whether `uri` is an existing file.
    pub fn is_file(&self, uri: &Uri) -> Result<bool, StorageError> {
        self.backend(uri)?.is_file(uri)
    }

    /// The size of the file at `uri` in bytes.
    pub fn file_size(&self, uri: &Uri) -> Result<u64, StorageError> {
        self.backend(uri)?.file_size(uri)
    }

    /// The immediate children of the directory at `uri`, in sorted order.
    pub fn ls(&self, uri: &Uri) -> Result<Vec<Uri>, StorageError> {
        self.backend(uri)?.ls(uri)
    }

    /// Remove the file at `uri`.
    pub fn remove_file(&self, uri: &Uri) -> Result<(), StorageError> {
        self.backend(uri)?.remove_file(uri)
    }

    /// Remove the directory at `uri` and everything beneath it.
    pub fn remove_dir(&self, uri: &Uri) -> Result<(), StorageError> {
        self.backend(uri)?.remove_dir(uri)
    }

    /// Rename `from` to `to`, overwriting `to` if it exists.
    ///
    /// # Errors
    /// Returns [`StorageError::Unsupported`] if `from` and `to` use
    /// different schemes.
    pub fn move_path(&self, from: &Uri, to: &Uri) -> Result<(), StorageError> {
        if from.scheme() != to.scheme() {
            return Err(StorageError::Unsupported(format!(
                "cannot move across schemes ({} -> {})",
                from.scheme(),
                to.scheme()
            )));
        }
        self.backend(from)?.move_path(from, to)
    }

    /// Acquire an exclusive advisory lock on the file at `uri`, blocking
    /// until it is available.
    pub fn flock_exclusive(&self, uri: &Uri) -> Result<FileLock, StorageError> {
        self.backend(uri)?.flock_exclusive(uri)
    }

    /// Release an advisory lock acquired with [`Vfs::flock_exclusive`].
    pub fn funlock(&self, lock: FileLock) {
        drop(lock);
    }
}
