//! A local filesystem backend for the [`tilevault`](https://docs.rs/tilevault/latest/tilevault/index.html) crate.
//!
//! [`FilesystemBackend`] serves `file` URIs (and plain paths) directly from
//! the local filesystem. Exclusive locks use the platform's advisory file
//! locking (`flock(2)` on Unix), so the consolidator retirement window is
//! honoured across processes.
//!
//! ## Licence
//! `tilevault_filesystem` is licensed under either of
//! - the Apache License, Version 2.0 or <http://www.apache.org/licenses/LICENSE-2.0> or
//! - the MIT license or <http://opensource.org/licenses/MIT>, at your option.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use tilevault_storage::{Bytes, FileLock, LockGuard, StorageError, Uri, VfsBackend};

/// A local filesystem backend.
#[derive(Debug, Default)]
pub struct FilesystemBackend {
    // Per-path guards so concurrent tile reads do not interleave with an
    // in-progress append to the same file.
    files: Mutex<HashMap<PathBuf, Arc<RwLock<()>>>>,
}

struct FsLockGuard {
    _file: File,
}

impl LockGuard for FsLockGuard {}

impl FilesystemBackend {
    /// Create a new filesystem backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn fspath(uri: &Uri) -> PathBuf {
        PathBuf::from(uri.path())
    }

    fn file_mutex(&self, path: &Path) -> Arc<RwLock<()>> {
        let mut files = self.files.lock();
        let file = files
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(RwLock::default()))
            .clone();
        drop(files);
        file
    }

    fn map_not_found(err: std::io::Error, uri: &Uri) -> StorageError {
        if err.kind() == std::io::ErrorKind::NotFound {
            StorageError::NotFound(uri.clone())
        } else {
            StorageError::IOError(err)
        }
    }

    #[cfg(unix)]
    fn flock_blocking(file: &File) -> std::io::Result<()> {
        use std::os::unix::io::AsRawFd;
        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if result != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn flock_blocking(_file: &File) -> std::io::Result<()> {
        // No advisory locking on this platform; in-process exclusion still
        // holds through the storage manager's coordinator.
        Ok(())
    }
}

impl VfsBackend for FilesystemBackend {
    fn read(&self, uri: &Uri, offset: u64, nbytes: u64) -> Result<Bytes, StorageError> {
        let path = Self::fspath(uri);
        let mutex = self.file_mutex(&path);
        let _lock = mutex.read();

        let mut file = File::open(&path).map_err(|err| Self::map_not_found(err, uri))?;
        file.seek(SeekFrom::Start(offset))?;
        let nbytes = usize::try_from(nbytes).map_err(|e| StorageError::Other(e.to_string()))?;
        let mut buffer = vec![0; nbytes];
        file.read_exact(&mut buffer)?;
        Ok(Bytes::from(buffer))
    }

    fn read_all(&self, uri: &Uri) -> Result<Bytes, StorageError> {
        let path = Self::fspath(uri);
        let mutex = self.file_mutex(&path);
        let _lock = mutex.read();

        let mut file = File::open(&path).map_err(|err| Self::map_not_found(err, uri))?;
        let mut buffer = Vec::new();
        file.read_to_end(&mut buffer)?;
        Ok(Bytes::from(buffer))
    }

    fn write(&self, uri: &Uri, data: &[u8]) -> Result<(), StorageError> {
        let path = Self::fspath(uri);
        let mutex = self.file_mutex(&path);
        let _lock = mutex.write();

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut file = OpenOptions::new().append(true).create(true).open(&path)?;
        file.write_all(data)?;
        Ok(())
    }

    fn create_dir(&self, uri: &Uri) -> Result<(), StorageError> {
        std::fs::create_dir_all(Self::fspath(uri))?;
        Ok(())
    }

    fn touch(&self, uri: &Uri) -> Result<(), StorageError> {
        let path = Self::fspath(uri);
        let mutex = self.file_mutex(&path);
        let _lock = mutex.write();
        OpenOptions::new().append(true).create(true).open(&path)?;
        Ok(())
    }

    fn is_dir(&self, uri: &Uri) -> Result<bool, StorageError> {
        Ok(Self::fspath(uri).is_dir())
    }

    fn is_file(&self, uri: &Uri) -> Result<bool, StorageError> {
        Ok(Self::fspath(uri).is_file())
    }

    fn file_size(&self, uri: &Uri) -> Result<u64, StorageError> {
        let metadata = std::fs::metadata(Self::fspath(uri))
            .map_err(|err| Self::map_not_found(err, uri))?;
        Ok(metadata.len())
    }

    fn ls(&self, uri: &Uri) -> Result<Vec<Uri>, StorageError> {
        let dir = std::fs::read_dir(Self::fspath(uri))
            .map_err(|err| Self::map_not_found(err, uri))?;
        let mut names = Vec::new();
        for entry in dir {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort_unstable();
        Ok(names.iter().map(|name| uri.join(name)).collect())
    }

    fn remove_file(&self, uri: &Uri) -> Result<(), StorageError> {
        let path = Self::fspath(uri);
        let mutex = self.file_mutex(&path);
        let _lock = mutex.write();
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn remove_dir(&self, uri: &Uri) -> Result<(), StorageError> {
        // Lock all operations while a subtree disappears.
        let _files = self.files.lock();
        std::fs::remove_dir_all(Self::fspath(uri)).map_err(|err| Self::map_not_found(err, uri))
    }

    fn move_path(&self, from: &Uri, to: &Uri) -> Result<(), StorageError> {
        let _files = self.files.lock();
        let from_path = Self::fspath(from);
        let to_path = Self::fspath(to);
        if to_path.is_dir() {
            std::fs::remove_dir_all(&to_path)?;
        } else if to_path.is_file() {
            std::fs::remove_file(&to_path)?;
        }
        std::fs::rename(&from_path, &to_path).map_err(|err| Self::map_not_found(err, from))
    }

    fn flock_exclusive(&self, uri: &Uri) -> Result<FileLock, StorageError> {
        let path = Self::fspath(uri);
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        Self::flock_blocking(&file)?;
        Ok(FileLock::new(Box::new(FsLockGuard { _file: file })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uri(path: &Path) -> Uri {
        Uri::new(path.to_str().unwrap()).unwrap()
    }

    #[test]
    fn write_read_ls() {
        let dir = tempfile::TempDir::new().unwrap();
        let backend = FilesystemBackend::new();
        let root = uri(dir.path());

        let file = root.join("sub").join("data.tdb");
        backend.write(&file, b"0123").unwrap();
        backend.write(&file, b"4567").unwrap();
        assert_eq!(&*backend.read_all(&file).unwrap(), b"01234567");
        assert_eq!(&*backend.read(&file, 2, 3).unwrap(), b"234");
        assert_eq!(backend.file_size(&file).unwrap(), 8);
        assert!(backend.read(&file, 6, 4).is_err());

        backend.create_dir(&root.join("empty")).unwrap();
        backend.touch(&root.join("marker")).unwrap();
        let children = backend.ls(&root).unwrap();
        assert_eq!(
            children,
            vec![root.join("empty"), root.join("marker"), root.join("sub")]
        );
        assert!(backend.is_dir(&root.join("sub")).unwrap());
        assert!(backend.is_file(&file).unwrap());
    }

    #[test]
    fn remove_and_move() {
        let dir = tempfile::TempDir::new().unwrap();
        let backend = FilesystemBackend::new();
        let root = uri(dir.path());

        backend.write(&root.join("a").join("f"), b"x").unwrap();
        backend.move_path(&root.join("a"), &root.join("b")).unwrap();
        assert!(backend.is_file(&root.join("b").join("f")).unwrap());
        assert!(!backend.is_dir(&root.join("a")).unwrap());

        // Overwriting move.
        backend.write(&root.join("c").join("g"), b"y").unwrap();
        backend.move_path(&root.join("c"), &root.join("b")).unwrap();
        assert!(backend.is_file(&root.join("b").join("g")).unwrap());
        assert!(!backend.is_file(&root.join("b").join("f")).unwrap());

        backend.remove_file(&root.join("b").join("g")).unwrap();
        backend.remove_file(&root.join("b").join("g")).unwrap();
        backend.remove_dir(&root.join("b")).unwrap();
        assert!(matches!(
            backend.remove_dir(&root.join("b")),
            Err(StorageError::NotFound(_))
        ));
    }

    #[test]
    fn flock_excludes_within_process() {
        let dir = tempfile::TempDir::new().unwrap();
        let backend = Arc::new(FilesystemBackend::new());
        let lock_uri = uri(dir.path()).join("__lock.tdb");

        let lock = backend.flock_exclusive(&lock_uri).unwrap();
        let contender = {
            let backend = Arc::clone(&backend);
            let lock_uri = lock_uri.clone();
            std::thread::spawn(move || {
                let lock = backend.flock_exclusive(&lock_uri).unwrap();
                drop(lock);
            })
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!contender.is_finished());
        drop(lock);
        contender.join().unwrap();
    }
}
