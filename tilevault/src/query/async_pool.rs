use std::collections::VecDeque;
use std::sync::mpsc;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};
use crate::query::context::QueryContext;
use crate::query::{Query, QueryStatus};

struct Task {
    query: Query,
    tx: mpsc::Sender<Result<Query>>,
}

struct PoolState {
    queue: VecDeque<Task>,
    shutdown: bool,
}

struct PoolShared {
    ctx: Arc<QueryContext>,
    state: Mutex<PoolState>,
    available: Condvar,
}

/// The result handle of an asynchronously submitted query.
pub struct AsyncQueryHandle {
    rx: mpsc::Receiver<Result<Query>>,
}

impl AsyncQueryHandle {
    /// Block until the query finishes and return it.
    ///
    /// # Errors
    /// Returns [`Error::Cancelled`] if the query was cancelled before or
    /// during execution, or the execution error.
    pub fn wait(self) -> Result<Query> {
        self.rx.recv().map_err(|_| {
            Error::InvalidState("the async pool shut down before the query completed".into())
        })?
    }
}

/// A fixed-size worker pool consuming a FIFO of pending queries.
///
/// Workers re-check the cancellation flag before dispatching a query:
/// everything still queued when [`AsyncPool::drain_pending`] runs, and
/// everything popped while cancellation is in progress, is marked
/// cancelled without executing. The in-progress counter is touched only
/// around actual execution.
pub(crate) struct AsyncPool {
    shared: Arc<PoolShared>,
    workers: Vec<std::thread::JoinHandle<()>>,
}

impl AsyncPool {
    pub(crate) fn new(num_threads: usize, ctx: Arc<QueryContext>) -> Result<Self> {
        let shared = Arc::new(PoolShared {
            ctx,
            state: Mutex::new(PoolState {
                queue: VecDeque::new(),
                shutdown: false,
            }),
            available: Condvar::new(),
        });
        let mut workers = Vec::with_capacity(num_threads.max(1));
        for i in 0..num_threads.max(1) {
            let shared = Arc::clone(&shared);
            let worker = std::thread::Builder::new()
                .name(format!("tilevault-async-{i}"))
                .spawn(move || worker(&shared))
                .map_err(crate::storage::StorageError::IOError)?;
            workers.push(worker);
        }
        Ok(Self { shared, workers })
    }

    /// Enqueue a query. The queue is unbounded; admission never blocks.
    pub(crate) fn submit(&self, query: Query) -> AsyncQueryHandle {
        let (tx, rx) = mpsc::channel();
        let mut state = self.shared.state.lock();
        state.queue.push_back(Task { query, tx });
        drop(state);
        self.shared.available.notify_one();
        AsyncQueryHandle { rx }
    }

    /// Drop every not-yet-started query, marking each cancelled.
    pub(crate) fn drain_pending(&self) {
        let drained: Vec<Task> = {
            let mut state = self.shared.state.lock();
            state.queue.drain(..).collect()
        };
        for mut task in drained {
            task.query.set_status(QueryStatus::Cancelled);
            let _ = task.tx.send(Err(Error::Cancelled));
        }
    }
}

impl Drop for AsyncPool {
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.available.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker(shared: &PoolShared) {
    loop {
        let task = {
            let mut state = shared.state.lock();
            loop {
                if state.shutdown {
                    return;
                }
                if let Some(task) = state.queue.pop_front() {
                    break task;
                }
                shared.available.wait(&mut state);
            }
        };

        // Cancellation checkpoint before dispatch: a query popped during
        // cancel-all is marked cancelled without ever starting.
        if shared.ctx.cancellation_in_progress() {
            let mut query = task.query;
            query.set_status(QueryStatus::Cancelled);
            let _ = task.tx.send(Err(Error::Cancelled));
            continue;
        }

        let in_progress = shared.ctx.start_query();
        let mut query = task.query;
        let result = shared.ctx.execute(&mut query);
        drop(in_progress);
        let _ = task.tx.send(result.map(|()| query));
    }
}
