use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::query::{reader, writer, Query, QueryStatus, QueryType};
use crate::storage::Vfs;
use crate::tile_cache::TileCache;

/// The shared execution state of all queries: the filesystem, the tile
/// cache, the intra-query thread pools, the in-progress counter, and the
/// cancellation flag.
pub(crate) struct QueryContext {
    pub(crate) vfs: Vfs,
    pub(crate) tile_cache: TileCache,
    pub(crate) reader_pool: rayon::ThreadPool,
    pub(crate) writer_pool: rayon::ThreadPool,
    in_progress: Mutex<u64>,
    drained: Condvar,
    cancellation: Mutex<bool>,
}

impl std::fmt::Debug for QueryContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryContext")
            .field("in_progress", &*self.in_progress.lock())
            .finish_non_exhaustive()
    }
}

fn build_pool(name: &'static str, threads: usize) -> Result<rayon::ThreadPool> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads.max(1))
        .thread_name(move |i| format!("tilevault-{name}-{i}"))
        .build()
        .map_err(|e| Error::InvalidArgument(e.to_string()))
}

impl QueryContext {
    pub(crate) fn new(config: &Config, vfs: Vfs) -> Result<Self> {
        Ok(Self {
            vfs,
            tile_cache: TileCache::new(config.tile_cache_size),
            reader_pool: build_pool("reader", config.num_reader_threads)?,
            writer_pool: build_pool("writer", config.num_writer_threads)?,
            in_progress: Mutex::new(0),
            drained: Condvar::new(),
            cancellation: Mutex::new(false),
        })
    }

    /// Register a query as in progress. The returned guard decrements the
    /// counter on every exit path, including unwinding.
    pub(crate) fn start_query(self: &Arc<Self>) -> QueryInProgress {
        *self.in_progress.lock() += 1;
        QueryInProgress {
            ctx: Arc::clone(self),
        }
    }

    pub(crate) fn queries_in_progress(&self) -> u64 {
        *self.in_progress.lock()
    }

    /// Block until no query is in progress.
    pub(crate) fn wait_for_zero_in_progress(&self) {
        let mut in_progress = self.in_progress.lock();
        while *in_progress > 0 {
            self.drained.wait(&mut in_progress);
        }
    }

    pub(crate) fn set_cancellation(&self, value: bool) {
        *self.cancellation.lock() = value;
    }

    pub(crate) fn cancellation_in_progress(&self) -> bool {
        *self.cancellation.lock()
    }

    /// The cooperative cancellation checkpoint, called between tile reads,
    /// tile productions, and fragment merges. Never mid-I/O.
    pub(crate) fn check_cancelled(&self) -> Result<()> {
        if self.cancellation_in_progress() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Execute `query` inline, setting its status from the outcome.
    pub(crate) fn execute(&self, query: &mut Query) -> Result<()> {
        query.set_status(QueryStatus::InProgress);
        let result = match query.query_type() {
            QueryType::Read => reader::read(self, query),
            QueryType::Write => writer::write(self, query),
        };
        query.set_status(match &result {
            Ok(()) => QueryStatus::Completed,
            Err(Error::Cancelled) => QueryStatus::Cancelled,
            Err(_) => QueryStatus::Failed,
        });
        result
    }
}

/// Scope guard pairing the increment and decrement of the in-progress
/// counter around an executing query.
pub(crate) struct QueryInProgress {
    ctx: Arc<QueryContext>,
}

impl Drop for QueryInProgress {
    fn drop(&mut self) {
        let mut in_progress = self.ctx.in_progress.lock();
        *in_progress -= 1;
        if *in_progress == 0 {
            self.ctx.drained.notify_all();
        }
    }
}
