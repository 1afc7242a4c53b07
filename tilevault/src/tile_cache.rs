use lru::LruCache;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::storage::{Bytes, Uri};

/// The cache key of a tile: the attribute file URI and the tile's byte
/// offset within it. The pair is unique across the engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TileKey {
    uri: Uri,
    offset: u64,
}

impl TileKey {
    /// Create a new key.
    #[must_use]
    pub fn new(uri: Uri, offset: u64) -> Self {
        Self { uri, offset }
    }
}

#[derive(Debug)]
struct TileCacheInner {
    lru: LruCache<TileKey, Bytes>,
    resident: u64,
}

/// A bounded LRU cache of tile buffers shared by all queries.
///
/// A single lock guards the cache; operations are tiny relative to the I/O
/// they front. Hits are observational only and never affect correctness.
#[derive(Debug)]
pub struct TileCache {
    capacity: u64,
    inner: Mutex<TileCacheInner>,
}

impl TileCache {
    /// Create a cache holding at most `capacity` resident bytes.
    #[must_use]
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            inner: Mutex::new(TileCacheInner {
                lru: LruCache::unbounded(),
                resident: 0,
            }),
        }
    }

    /// Look up a tile, marking it most recently used on a hit.
    ///
    /// # Errors
    /// Returns [`Error::InvalidArgument`] if the entry exists but its size
    /// differs from `nbytes`; a cached tile is always read whole.
    pub fn read(&self, key: &TileKey, nbytes: u64) -> Result<Option<Bytes>> {
        let mut inner = self.inner.lock();
        let Some(bytes) = inner.lru.get(key) else {
            return Ok(None);
        };
        if bytes.len() as u64 != nbytes {
            return Err(Error::InvalidArgument(format!(
                "cached tile has {} bytes, requested {nbytes}",
                bytes.len()
            )));
        }
        Ok(Some(bytes.clone()))
    }

    /// Insert a tile, evicting least-recently-used entries until it fits.
    ///
    /// A buffer larger than the whole cache is not inserted; that is not an
    /// error.
    pub fn insert(&self, key: TileKey, bytes: Bytes) {
        let incoming = bytes.len() as u64;
        if incoming > self.capacity {
            return;
        }
        let mut inner = self.inner.lock();
        if let Some(previous) = inner.lru.pop(&key) {
            inner.resident -= previous.len() as u64;
        }
        while inner.resident + incoming > self.capacity {
            let Some((_, evicted)) = inner.lru.pop_lru() else {
                break;
            };
            inner.resident -= evicted.len() as u64;
        }
        inner.resident += incoming;
        inner.lru.put(key, bytes);
    }

    /// The configured capacity in bytes.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// The current resident bytes.
    #[must_use]
    pub fn resident_bytes(&self) -> u64 {
        self.inner.lock().resident
    }
}
