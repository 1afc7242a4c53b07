use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, RwLock};

use crate::{Bytes, FileLock, LockGuard, StorageError, Uri, VfsBackend};

#[derive(Debug, Default)]
struct MemoryInner {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
}

#[derive(Default)]
struct LockTable {
    held: Mutex<HashSet<String>>,
    released: Condvar,
}

struct MemoryLockGuard {
    table: Arc<LockTable>,
    path: String,
}

impl LockGuard for MemoryLockGuard {}

impl Drop for MemoryLockGuard {
    fn drop(&mut self) {
        self.table.held.lock().remove(&self.path);
        self.table.released.notify_all();
    }
}

/// An in-memory backend, primarily for testing.
///
/// Advisory locks are emulated per backend instance, so they exclude other
/// threads of the same process but not other processes.
#[derive(Default)]
pub struct MemoryBackend {
    inner: RwLock<MemoryInner>,
    locks: Arc<LockTable>,
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MemoryBackend")
    }
}

impl MemoryBackend {
    /// Create an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn is_dir_locked(inner: &MemoryInner, path: &str) -> bool {
        let prefix = format!("{path}/");
        inner.dirs.contains(path)
            || inner.dirs.range(prefix.clone()..).next().is_some_and(|d| d.starts_with(&prefix))
            || inner.files.range(prefix.clone()..).next().is_some_and(|(f, _)| f.starts_with(&prefix))
    }
}

impl VfsBackend for MemoryBackend {
    fn read(&self, uri: &Uri, offset: u64, nbytes: u64) -> Result<Bytes, StorageError> {
        let inner = self.inner.read();
        let data = inner
            .files
            .get(uri.path())
            .ok_or_else(|| StorageError::NotFound(uri.clone()))?;
        let offset = usize::try_from(offset).map_err(|e| StorageError::Other(e.to_string()))?;
        let nbytes = usize::try_from(nbytes).map_err(|e| StorageError::Other(e.to_string()))?;
        let end = offset.checked_add(nbytes).filter(|end| *end <= data.len());
        let Some(end) = end else {
            return Err(StorageError::IOError(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("read of {nbytes} bytes at {offset} past end of {uri}"),
            )));
        };
        Ok(Bytes::copy_from_slice(&data[offset..end]))
    }

    fn read_all(&self, uri: &Uri) -> Result<Bytes, StorageError> {
        let inner = self.inner.read();
        let data = inner
            .files
            .get(uri.path())
            .ok_or_else(|| StorageError::NotFound(uri.clone()))?;
        Ok(Bytes::copy_from_slice(data))
    }

    fn write(&self, uri: &Uri, data: &[u8]) -> Result<(), StorageError> {
        let mut inner = self.inner.write();
        inner
            .files
            .entry(uri.path().to_string())
            .or_default()
            .extend_from_slice(data);
        Ok(())
    }

    fn create_dir(&self, uri: &Uri) -> Result<(), StorageError> {
        let mut inner = self.inner.write();
        let mut path = uri.path();
        loop {
            inner.dirs.insert(path.to_string());
            match path.rfind('/') {
                Some(pos) if pos > 0 => path = &path[..pos],
                _ => break,
            }
        }
        Ok(())
    }

    fn touch(&self, uri: &Uri) -> Result<(), StorageError> {
        let mut inner = self.inner.write();
        inner.files.entry(uri.path().to_string()).or_default();
        Ok(())
    }

    fn is_dir(&self, uri: &Uri) -> Result<bool, StorageError> {
        let inner = self.inner.read();
        Ok(Self::is_dir_locked(&inner, uri.path()))
    }

    fn is_file(&self, uri: &Uri) -> Result<bool, StorageError> {
        Ok(self.inner.read().files.contains_key(uri.path()))
    }

    fn file_size(&self, uri: &Uri) -> Result<u64, StorageError> {
        let inner = self.inner.read();
        inner
            .files
            .get(uri.path())
            .map(|data| data.len() as u64)
            .ok_or_else(|| StorageError::NotFound(uri.clone()))
    }

    fn ls(&self, uri: &Uri) -> Result<Vec<Uri>, StorageError> {
        let inner = self.inner.read();
        let prefix = format!("{}/", uri.path());
        let mut children = BTreeSet::new();
        for path in inner
            .files
            .keys()
            .chain(inner.dirs.iter())
            .filter(|path| path.starts_with(&prefix))
        {
            let rest = &path[prefix.len()..];
            let child = match rest.find('/') {
                Some(pos) => &rest[..pos],
                None => rest,
            };
            if !child.is_empty() {
                children.insert(child.to_string());
            }
        }
        Ok(children.iter().map(|child| uri.join(child)).collect())
    }

    fn remove_file(&self, uri: &Uri) -> Result<(), StorageError> {
        self.inner.write().files.remove(uri.path());
        Ok(())
    }

    fn remove_dir(&self, uri: &Uri) -> Result<(), StorageError> {
        let mut inner = self.inner.write();
        if !Self::is_dir_locked(&inner, uri.path()) {
            return Err(StorageError::NotFound(uri.clone()));
        }
        let prefix = format!("{}/", uri.path());
        inner.files.retain(|path, _| !path.starts_with(&prefix));
        inner
            .dirs
            .retain(|path| path != uri.path() && !path.starts_with(&prefix));
        Ok(())
    }

    fn move_path(&self, from: &Uri, to: &Uri) -> Result<(), StorageError> {
        let mut inner = self.inner.write();
        if let Some(data) = inner.files.remove(from.path()) {
            inner.files.insert(to.path().to_string(), data);
            return Ok(());
        }
        if !Self::is_dir_locked(&inner, from.path()) {
            return Err(StorageError::NotFound(from.clone()));
        }
        let from_prefix = format!("{}/", from.path());
        let rename = |path: &str| format!("{}/{}", to.path(), &path[from_prefix.len()..]);
        inner.files = inner
            .files
            .iter()
            .map(|(path, data)| {
                if path.starts_with(&from_prefix) {
                    (rename(path), data.clone())
                } else {
                    (path.clone(), data.clone())
                }
            })
            .collect();
        inner.dirs = inner
            .dirs
            .iter()
            .map(|path| {
                if path == from.path() {
                    to.path().to_string()
                } else if path.starts_with(&from_prefix) {
                    rename(path)
                } else {
                    path.clone()
                }
            })
            .collect();
        Ok(())
    }

    fn flock_exclusive(&self, uri: &Uri) -> Result<FileLock, StorageError> {
        self.touch(uri)?;
        let path = uri.path().to_string();
        let mut held = self.locks.held.lock();
        while held.contains(&path) {
            self.locks.released.wait(&mut held);
        }
        held.insert(path.clone());
        Ok(FileLock::new(Box::new(MemoryLockGuard {
            table: Arc::clone(&self.locks),
            path,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uri(s: &str) -> Uri {
        Uri::new(s).unwrap()
    }

    #[test]
    fn write_read() {
        let backend = MemoryBackend::new();
        backend.write(&uri("mem://a/f"), b"hello ").unwrap();
        backend.write(&uri("mem://a/f"), b"world").unwrap();
        assert_eq!(&*backend.read_all(&uri("mem://a/f")).unwrap(), b"hello world");
        assert_eq!(&*backend.read(&uri("mem://a/f"), 6, 5).unwrap(), b"world");
        assert_eq!(backend.file_size(&uri("mem://a/f")).unwrap(), 11);
        assert!(backend.read(&uri("mem://a/f"), 8, 10).is_err());
        assert!(matches!(
            backend.read_all(&uri("mem://a/missing")),
            Err(StorageError::NotFound(_))
        ));
    }

    #[test]
    fn dirs_and_ls() {
        let backend = MemoryBackend::new();
        backend.create_dir(&uri("mem://a/b")).unwrap();
        backend.write(&uri("mem://a/f"), b"x").unwrap();
        assert!(backend.is_dir(&uri("mem://a")).unwrap());
        assert!(backend.is_dir(&uri("mem://a/b")).unwrap());
        assert!(backend.is_file(&uri("mem://a/f")).unwrap());
        assert!(!backend.is_dir(&uri("mem://a/f")).unwrap());
        let children = backend.ls(&uri("mem://a")).unwrap();
        assert_eq!(children, vec![uri("mem://a/b"), uri("mem://a/f")]);
    }

    #[test]
    fn remove_and_move() {
        let backend = MemoryBackend::new();
        backend.create_dir(&uri("mem://a/b")).unwrap();
        backend.write(&uri("mem://a/b/f"), b"x").unwrap();
        backend.move_path(&uri("mem://a/b"), &uri("mem://a/c")).unwrap();
        assert!(backend.is_file(&uri("mem://a/c/f")).unwrap());
        assert!(!backend.is_dir(&uri("mem://a/b")).unwrap());
        backend.remove_dir(&uri("mem://a")).unwrap();
        assert!(!backend.is_file(&uri("mem://a/c/f")).unwrap());
        assert!(matches!(
            backend.remove_dir(&uri("mem://a")),
            Err(StorageError::NotFound(_))
        ));
    }

    #[test]
    fn flock_blocks_until_release() {
        let backend = Arc::new(MemoryBackend::new());
        let lock = backend.flock_exclusive(&uri("mem://a/__lock.tdb")).unwrap();
        let contender = {
            let backend = Arc::clone(&backend);
            std::thread::spawn(move || {
                let lock = backend.flock_exclusive(&uri("mem://a/__lock.tdb")).unwrap();
                drop(lock);
            })
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!contender.is_finished());
        drop(lock);
        contender.join().unwrap();
    }
}
