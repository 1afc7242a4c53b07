use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use crate::array_schema::ArraySchema;
use crate::config::{Config, ConsolidationConfig};
use crate::constants::{
    ARRAY_SCHEMA_FILENAME, GROUP_FILENAME, KV_SCHEMA_FILENAME, LOCK_FILENAME,
};
use crate::encryption::{EncryptionKey, KeyValidation};
use crate::error::{Error, Result};
use crate::fragment::{now_ms, sorted_fragment_uris, FragmentInfo, FragmentMetadata};
use crate::object::{ObjectType, WalkOrder};
use crate::open_array::OpenArray;
use crate::query::{
    union_bbox, ArraySnapshot, AsyncPool, AsyncQueryHandle, Query, QueryContext, QueryType,
};
use crate::rest::{RestClient, REST_URI_SCHEME};
use crate::storage::{Bytes, StorageError, Uri, Vfs};
use crate::tile_cache::TileKey;

#[derive(Default)]
struct XlockState {
    /// URIs currently under an exclusive consolidator lock.
    locked: HashSet<String>,
    /// The on-disk advisory lock handles, keyed by array URI.
    filelocks: HashMap<String, crate::storage::FileLock>,
}

/// The concurrent lifecycle controller for open arrays, fragment metadata
/// loading, query admission, and consolidator coordination.
///
/// Lock order, never acquired in reverse: exclusive-lock state → reads
/// registry → writes registry → open-array metadata map → tile cache.
pub struct StorageManager {
    config: Config,
    ctx: Arc<QueryContext>,
    async_pool: AsyncPool,
    open_arrays_for_reads: Mutex<HashMap<String, Arc<OpenArray>>>,
    open_arrays_for_writes: Mutex<HashMap<String, Arc<OpenArray>>>,
    xlock_state: Mutex<XlockState>,
    /// Signalled when an array closes for reads and when an exclusive lock
    /// is released.
    xlock_changed: Condvar,
    rest_client: Mutex<Option<Arc<dyn RestClient>>>,
    /// Serializes object creation so concurrent creates at one URI cannot
    /// interleave.
    object_create: Mutex<()>,
}

impl std::fmt::Debug for StorageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl StorageManager {
    /// Create a storage manager with the default backends (`mem` plus, with
    /// the `filesystem` feature, `file`).
    ///
    /// # Errors
    /// Returns [`Error::InvalidArgument`] if a thread pool cannot be built.
    pub fn new(config: Config) -> Result<Self> {
        #[allow(unused_mut)]
        let mut vfs = Vfs::new();
        #[cfg(feature = "filesystem")]
        vfs.register(
            "file",
            Arc::new(tilevault_filesystem::FilesystemBackend::new()),
        );
        Self::with_vfs(config, vfs)
    }

    /// Create a storage manager over a caller-assembled [`Vfs`].
    ///
    /// # Errors
    /// Returns [`Error::InvalidArgument`] if a thread pool cannot be built.
    pub fn with_vfs(config: Config, vfs: Vfs) -> Result<Self> {
        let ctx = Arc::new(QueryContext::new(&config, vfs)?);
        let async_pool = AsyncPool::new(config.num_async_threads, Arc::clone(&ctx))?;
        Ok(Self {
            config,
            ctx,
            async_pool,
            open_arrays_for_reads: Mutex::new(HashMap::new()),
            open_arrays_for_writes: Mutex::new(HashMap::new()),
            xlock_state: Mutex::new(XlockState::default()),
            xlock_changed: Condvar::new(),
            rest_client: Mutex::new(None),
            object_create: Mutex::new(()),
        })
    }

    /// The configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The virtual filesystem.
    #[must_use]
    pub fn vfs(&self) -> &Vfs {
        &self.ctx.vfs
    }

    /// Install the REST client used for arrays with the
    /// [`REST_URI_SCHEME`] scheme. Routing additionally requires
    /// `rest.server_address` to be configured.
    pub fn set_rest_client(&self, client: Arc<dyn RestClient>) {
        *self.rest_client.lock() = Some(client);
    }

    /// The REST client for `uri`, if it must be routed remotely.
    ///
    /// # Errors
    /// Returns [`Error::Unsupported`] for a remote URI without a configured
    /// and installed client.
    fn rest_for(&self, uri: &Uri) -> Result<Option<Arc<dyn RestClient>>> {
        if uri.scheme() != REST_URI_SCHEME {
            return Ok(None);
        }
        if self.config.rest.server_address.is_none() {
            return Err(Error::Unsupported(format!(
                "array {uri} requires rest.server_address to be configured"
            )));
        }
        self.rest_client
            .lock()
            .clone()
            .map(Some)
            .ok_or_else(|| Error::Unsupported(format!("array {uri} requires a REST client")))
    }

    /* ---------------- array lifecycle ---------------- */

    /// Create an array at `uri`, storing its schema and the validation
    /// record of `key`.
    ///
    /// # Errors
    /// Returns [`Error::AlreadyExists`] if `uri` already holds an object
    /// and [`Error::InvalidArgument`] for an invalid schema.
    pub fn array_create(
        &self,
        uri: &Uri,
        schema: &ArraySchema,
        key: &EncryptionKey,
    ) -> Result<()> {
        schema.check()?;
        let _guard = self.object_create.lock();
        if self.ctx.vfs.is_dir(uri)? {
            return Err(Error::AlreadyExists(uri.clone()));
        }
        let mut schema = schema.clone();
        schema.set_key_validation(KeyValidation::create(key));
        self.ctx.vfs.create_dir(uri)?;
        self.ctx
            .vfs
            .write(&uri.join(ARRAY_SCHEMA_FILENAME), &schema.to_json_vec()?)?;
        info!(array = %uri, "created array");
        Ok(())
    }

    /// Load the schema of the array at `uri`, verifying `key` against the
    /// stored validation record.
    ///
    /// # Errors
    /// Returns [`Error::NotFound`] if `uri` is not an array,
    /// [`Error::Unauthorized`] on key mismatch, and
    /// [`Error::UnsupportedVersion`] for schemas written by a newer engine.
    pub fn load_array_schema(&self, uri: &Uri, key: &EncryptionKey) -> Result<ArraySchema> {
        self.load_schema_impl(uri, key).map(|arc| (*arc).clone())
    }

    fn load_schema_impl(&self, uri: &Uri, key: &EncryptionKey) -> Result<Arc<ArraySchema>> {
        if let Some(client) = self.rest_for(uri)? {
            return Ok(Arc::new(client.get_array_schema(uri)?));
        }
        let bytes = self
            .ctx
            .vfs
            .read_all(&uri.join(ARRAY_SCHEMA_FILENAME))
            .map_err(|err| match err {
                StorageError::NotFound(_) => Error::NotFound(format!("{uri} is not an array")),
                other => Error::Storage(other),
            })?;
        let schema = ArraySchema::from_json_slice(&bytes)?;
        check_key(&schema, key)?;
        Ok(Arc::new(schema))
    }

    /// Open an array for reads at `timestamp` (milliseconds since the Unix
    /// epoch): fragments created at or before it are visible.
    ///
    /// Blocks while a consolidator holds the exclusive lock on `uri`.
    ///
    /// # Errors
    /// Returns [`Error::Unauthorized`] on key mismatch and propagates
    /// schema and fragment metadata loading failures; a failed open leaves
    /// the registry unchanged.
    pub fn array_open_for_reads(
        &self,
        uri: &Uri,
        timestamp: u64,
        key: &EncryptionKey,
    ) -> Result<ArraySnapshot> {
        self.wait_for_xlock(uri);
        let open_array = self.open_without_fragments(uri, QueryType::Read, key)?;
        if uri.scheme() == REST_URI_SCHEME {
            // Remote arrays keep their fragments server-side.
            return Ok(ArraySnapshot::new(
                uri.clone(),
                QueryType::Read,
                timestamp,
                Arc::clone(open_array.schema()),
                Vec::new(),
            ));
        }
        let fragments = sorted_fragment_uris(&self.ctx.vfs, uri, timestamp)
            .and_then(|uris| self.load_fragments(&open_array, &uris));
        match fragments {
            Ok(fragments) => {
                debug!(array = %uri, timestamp, fragments = fragments.len(), "opened for reads");
                Ok(ArraySnapshot::new(
                    uri.clone(),
                    QueryType::Read,
                    timestamp,
                    Arc::clone(open_array.schema()),
                    fragments,
                ))
            }
            Err(err) => {
                // Roll back this open's reference so the failed open leaves
                // no trace.
                let _ = self.array_close_for_reads(uri);
                Err(err)
            }
        }
    }

    /// Open an array for reads over an explicit fragment list, skipping the
    /// fragment index. The caller accepts responsibility for the
    /// consistency of the list; it is used verbatim and in order.
    ///
    /// # Errors
    /// As [`StorageManager::array_open_for_reads`], plus
    /// [`Error::UnsupportedVersion`] for a listed fragment with an unknown
    /// format version.
    pub fn array_open_for_reads_with_fragments(
        &self,
        uri: &Uri,
        fragment_uris: &[Uri],
        key: &EncryptionKey,
    ) -> Result<ArraySnapshot> {
        self.wait_for_xlock(uri);
        let open_array = self.open_without_fragments(uri, QueryType::Read, key)?;
        let fragments = fragment_uris
            .iter()
            .map(|fragment_uri| self.load_one_fragment(&open_array, fragment_uri))
            .collect::<Result<Vec<_>>>();
        match fragments {
            Ok(fragments) => Ok(ArraySnapshot::new(
                uri.clone(),
                QueryType::Read,
                now_ms(),
                Arc::clone(open_array.schema()),
                fragments,
            )),
            Err(err) => {
                let _ = self.array_close_for_reads(uri);
                Err(err)
            }
        }
    }

    /// Open an array for writes. Writers do not read fragments, so no
    /// fragment metadata is loaded and the exclusive-lock coordinator is
    /// not consulted.
    ///
    /// # Errors
    /// Returns [`Error::Unauthorized`] on key mismatch.
    pub fn array_open_for_writes(&self, uri: &Uri, key: &EncryptionKey) -> Result<ArraySnapshot> {
        let open_array = self.open_without_fragments_in(
            &self.open_arrays_for_writes,
            uri,
            QueryType::Write,
            key,
        )?;
        debug!(array = %uri, "opened for writes");
        Ok(ArraySnapshot::new(
            uri.clone(),
            QueryType::Write,
            now_ms(),
            Arc::clone(open_array.schema()),
            Vec::new(),
        ))
    }

    /// Re-snapshot an array already open for reads at a new timestamp,
    /// loading any fragment metadata not yet in memory. The reference
    /// count is unchanged.
    ///
    /// # Errors
    /// Returns [`Error::InvalidState`] if the array is not open for reads.
    pub fn array_reopen(
        &self,
        uri: &Uri,
        timestamp: u64,
        key: &EncryptionKey,
    ) -> Result<ArraySnapshot> {
        let open_array = self
            .open_arrays_for_reads
            .lock()
            .get(uri.as_str())
            .cloned()
            .ok_or_else(|| {
                Error::InvalidState(format!("array {uri} is not open for reads"))
            })?;
        check_key(open_array.schema(), key)?;
        let uris = sorted_fragment_uris(&self.ctx.vfs, uri, timestamp)?;
        let fragments = self.load_fragments(&open_array, &uris)?;
        debug!(array = %uri, timestamp, fragments = fragments.len(), "reopened");
        Ok(ArraySnapshot::new(
            uri.clone(),
            QueryType::Read,
            timestamp,
            Arc::clone(open_array.schema()),
            fragments,
        ))
    }

    /// Close one read handle; the last close destroys the open-array entry
    /// and every loaded fragment metadata record.
    ///
    /// # Errors
    /// Returns [`Error::InvalidState`] if the array is not open for reads.
    pub fn array_close_for_reads(&self, uri: &Uri) -> Result<()> {
        {
            let mut table = self.open_arrays_for_reads.lock();
            let open_array = table.get(uri.as_str()).ok_or_else(|| {
                Error::InvalidState(format!("array {uri} is not open for reads"))
            })?;
            if open_array.cnt_decr() == 0 {
                table.remove(uri.as_str());
            }
        }
        // Wake a consolidator waiting for readers to drain. Notifying under
        // the coordinator mutex pairs with the waiter's check-then-wait.
        let _state = self.xlock_state.lock();
        self.xlock_changed.notify_all();
        debug!(array = %uri, "closed for reads");
        Ok(())
    }

    /// Close one write handle.
    ///
    /// # Errors
    /// Returns [`Error::InvalidState`] if the array is not open for writes.
    pub fn array_close_for_writes(&self, uri: &Uri) -> Result<()> {
        let mut table = self.open_arrays_for_writes.lock();
        let open_array = table.get(uri.as_str()).ok_or_else(|| {
            Error::InvalidState(format!("array {uri} is not open for writes"))
        })?;
        if open_array.cnt_decr() == 0 {
            table.remove(uri.as_str());
        }
        drop(table);
        debug!(array = %uri, "closed for writes");
        Ok(())
    }

    fn open_without_fragments(
        &self,
        uri: &Uri,
        query_type: QueryType,
        key: &EncryptionKey,
    ) -> Result<Arc<OpenArray>> {
        self.open_without_fragments_in(&self.open_arrays_for_reads, uri, query_type, key)
    }

    /// Get or create the open-array entry for `uri` in `table` and take one
    /// reference on it. The registry mutates only on success.
    fn open_without_fragments_in(
        &self,
        table: &Mutex<HashMap<String, Arc<OpenArray>>>,
        uri: &Uri,
        query_type: QueryType,
        key: &EncryptionKey,
    ) -> Result<Arc<OpenArray>> {
        let mut table = table.lock();
        let open_array = match table.get(uri.as_str()) {
            Some(open_array) => {
                debug_assert_eq!(open_array.uri(), uri);
                debug_assert_eq!(open_array.query_type(), query_type);
                check_key(open_array.schema(), key)?;
                Arc::clone(open_array)
            }
            None => {
                let schema = self.load_schema_impl(uri, key)?;
                let open_array = Arc::new(OpenArray::new(uri.clone(), query_type, schema));
                table.insert(uri.as_str().to_string(), Arc::clone(&open_array));
                open_array
            }
        };
        open_array.cnt_incr();
        Ok(open_array)
    }

    fn load_fragments(
        &self,
        open_array: &OpenArray,
        uris: &[(Uri, crate::fragment::FragmentName)],
    ) -> Result<Vec<Arc<FragmentMetadata>>> {
        uris.iter()
            .map(|(uri, _)| self.load_one_fragment(open_array, uri))
            .collect()
    }

    fn load_one_fragment(
        &self,
        open_array: &OpenArray,
        uri: &Uri,
    ) -> Result<Arc<FragmentMetadata>> {
        if let Some(metadata) = open_array.fragment_metadata(uri) {
            return Ok(metadata);
        }
        let metadata = FragmentMetadata::load(&self.ctx.vfs, uri)?;
        Ok(open_array.insert_fragment_metadata(metadata))
    }

    /* ---------------- exclusive-lock coordinator ---------------- */

    /// Block while `uri` is exclusively locked in this process.
    fn wait_for_xlock(&self, uri: &Uri) {
        let mut state = self.xlock_state.lock();
        while state.locked.contains(uri.as_str()) {
            self.xlock_changed.wait(&mut state);
        }
    }

    /// Exclusively lock `uri` against read opens: acquire the on-disk
    /// advisory lock (cross-process), mark the URI locked so new read
    /// opens block, then wait for current readers to drain.
    ///
    /// # Errors
    /// Returns [`Error::Conflict`] if readers do not drain within
    /// `sm.xlock_timeout_ms`; the lock is released before returning.
    pub(crate) fn array_xlock(&self, uri: &Uri) -> Result<()> {
        // The cross-process lock is taken before touching in-process state
        // so a wait on another process cannot stall unrelated opens.
        let filelock = self.ctx.vfs.flock_exclusive(&uri.join(LOCK_FILENAME))?;

        let mut state = self.xlock_state.lock();
        if !state.locked.insert(uri.as_str().to_string()) {
            return Err(Error::InvalidState(format!(
                "array {uri} is already exclusively locked"
            )));
        }
        state.filelocks.insert(uri.as_str().to_string(), filelock);
        debug!(array = %uri, "exclusive lock acquired, draining readers");

        let deadline = Instant::now() + Duration::from_millis(self.config.xlock_timeout_ms);
        loop {
            let drained = !self
                .open_arrays_for_reads
                .lock()
                .contains_key(uri.as_str());
            if drained {
                return Ok(());
            }
            let timeout = deadline.saturating_duration_since(Instant::now());
            if timeout.is_zero()
                || self
                    .xlock_changed
                    .wait_for(&mut state, timeout)
                    .timed_out()
            {
                if !self
                    .open_arrays_for_reads
                    .lock()
                    .contains_key(uri.as_str())
                {
                    return Ok(());
                }
                state.locked.remove(uri.as_str());
                let filelock = state.filelocks.remove(uri.as_str());
                self.xlock_changed.notify_all();
                drop(state);
                if let Some(filelock) = filelock {
                    self.ctx.vfs.funlock(filelock);
                }
                return Err(Error::Conflict(format!(
                    "readers of {uri} did not drain within {} ms",
                    self.config.xlock_timeout_ms
                )));
            }
        }
    }

    /// Release the exclusive lock on `uri` and wake blocked opens.
    ///
    /// # Errors
    /// Returns [`Error::InvalidState`] if `uri` is not locked.
    pub(crate) fn array_xunlock(&self, uri: &Uri) -> Result<()> {
        let filelock = {
            let mut state = self.xlock_state.lock();
            if !state.locked.remove(uri.as_str()) {
                return Err(Error::InvalidState(format!(
                    "array {uri} is not exclusively locked"
                )));
            }
            let filelock = state.filelocks.remove(uri.as_str());
            // Notify under the coordinator mutex so a blocked open cannot
            // miss the wakeup between its check and its wait.
            self.xlock_changed.notify_all();
            filelock
        };
        if let Some(filelock) = filelock {
            self.ctx.vfs.funlock(filelock);
        }
        debug!(array = %uri, "exclusive lock released");
        Ok(())
    }

    /* ---------------- query admission ---------------- */

    /// Execute a query synchronously.
    ///
    /// # Errors
    /// Propagates execution failures; [`Error::Cancelled`] if the query
    /// observed a cancellation checkpoint.
    pub fn query_submit(&self, query: &mut Query) -> Result<()> {
        if let Some(client) = self.rest_for(query.snapshot().uri())? {
            let uri = query.snapshot().uri().clone();
            let result = client.submit_query(&uri, query);
            query.set_status(match &result {
                Ok(()) => crate::query::QueryStatus::Completed,
                Err(Error::Cancelled) => crate::query::QueryStatus::Cancelled,
                Err(_) => crate::query::QueryStatus::Failed,
            });
            return result;
        }
        let in_progress = self.ctx.start_query();
        let result = self.ctx.execute(query);
        drop(in_progress);
        result
    }

    /// Enqueue a query on the async pool and return its result handle.
    pub fn query_submit_async(&self, query: Query) -> AsyncQueryHandle {
        self.async_pool.submit(query)
    }

    /// Cancel all in-flight and pending queries and block until the
    /// in-progress counter reaches zero.
    ///
    /// Pending async queries are dropped without executing; running queries
    /// observe the flag at their next checkpoint and finish with
    /// [`Error::Cancelled`].
    pub fn cancel_all_tasks(&self) -> Result<()> {
        info!("cancelling all tasks");
        self.ctx.set_cancellation(true);
        self.async_pool.drain_pending();
        self.ctx.wait_for_zero_in_progress();
        self.ctx.set_cancellation(false);
        Ok(())
    }

    /// Whether a cancel-all is currently in progress.
    #[must_use]
    pub fn cancellation_in_progress(&self) -> bool {
        self.ctx.cancellation_in_progress()
    }

    /// The number of queries currently executing.
    #[must_use]
    pub fn queries_in_progress(&self) -> u64 {
        self.ctx.queries_in_progress()
    }

    /* ---------------- consolidation ---------------- */

    /// Merge fragments of the array at `uri` per the consolidation policy
    /// and retire the inputs.
    ///
    /// # Errors
    /// Propagates open, query, and retirement failures.
    pub fn array_consolidate(
        &self,
        uri: &Uri,
        key: &EncryptionKey,
        config: Option<&ConsolidationConfig>,
    ) -> Result<()> {
        let config = config.unwrap_or(&self.config.consolidation);
        crate::consolidator::consolidate(self, uri, key, config)
    }

    /* ---------------- array information ---------------- */

    /// The union of the non-empty domains of the snapshot's fragments, or
    /// `None` if the array is empty.
    ///
    /// # Errors
    /// Propagates REST failures for remote arrays.
    pub fn array_non_empty_domain(
        &self,
        snapshot: &ArraySnapshot,
    ) -> Result<Option<Vec<[i64; 2]>>> {
        if let Some(client) = self.rest_for(snapshot.uri())? {
            return client.get_non_empty_domain(snapshot.uri());
        }
        Ok(snapshot
            .fragments()
            .iter()
            .map(|fragment| fragment.non_empty_domain().to_vec())
            .reduce(|a, b| union_bbox(&a, &b)))
    }

    /// An upper bound on the bytes a read over `subarray` can produce, per
    /// attribute.
    ///
    /// # Errors
    /// Returns [`Error::InvalidArgument`] if the subarray is outside the
    /// domain.
    pub fn array_max_buffer_sizes(
        &self,
        snapshot: &ArraySnapshot,
        subarray: &[[i64; 2]],
    ) -> Result<BTreeMap<String, u64>> {
        let schema = snapshot.schema();
        schema.check_subarray(subarray)?;
        let cells = crate::query::cell_num(subarray);
        Ok(schema
            .attributes()
            .iter()
            .map(|attribute| (attribute.name().to_string(), cells * attribute.cell_size()))
            .collect())
    }

    /// The fragments of the array at `uri` visible at `timestamp`, in
    /// application order.
    ///
    /// # Errors
    /// Returns [`Error::NotFound`] if `uri` is not an array.
    pub fn fragment_info(&self, uri: &Uri, timestamp: u64) -> Result<Vec<FragmentInfo>> {
        if self.object_type(uri)? != Some(ObjectType::Array) {
            return Err(Error::NotFound(format!("{uri} is not an array")));
        }
        Ok(sorted_fragment_uris(&self.ctx.vfs, uri, timestamp)?
            .into_iter()
            .map(|(uri, name)| FragmentInfo {
                uri,
                timestamp_ms: name.timestamp_ms(),
                version: name.version(),
            })
            .collect())
    }

    /* ---------------- object management ---------------- */

    /// The kind of engine object at `uri`, or `None` for foreign paths.
    ///
    /// # Errors
    /// Propagates filesystem failures.
    pub fn object_type(&self, uri: &Uri) -> Result<Option<ObjectType>> {
        let vfs = &self.ctx.vfs;
        if !vfs.is_dir(uri)? {
            return Ok(None);
        }
        if vfs.is_file(&uri.join(ARRAY_SCHEMA_FILENAME))? {
            Ok(Some(ObjectType::Array))
        } else if vfs.is_file(&uri.join(KV_SCHEMA_FILENAME))? {
            Ok(Some(ObjectType::KeyValue))
        } else if vfs.is_file(&uri.join(GROUP_FILENAME))? {
            Ok(Some(ObjectType::Group))
        } else {
            Ok(None)
        }
    }

    /// Create a group at `uri`.
    ///
    /// # Errors
    /// Returns [`Error::AlreadyExists`] if `uri` already holds an object.
    pub fn group_create(&self, uri: &Uri) -> Result<()> {
        let _guard = self.object_create.lock();
        if self.object_type(uri)?.is_some() {
            return Err(Error::AlreadyExists(uri.clone()));
        }
        self.ctx.vfs.create_dir(uri)?;
        self.ctx.vfs.touch(&uri.join(GROUP_FILENAME))?;
        info!(group = %uri, "created group");
        Ok(())
    }

    /// Remove the object at `uri` (array, group, or key-value store).
    ///
    /// # Errors
    /// Returns [`Error::NotFound`] if `uri` is not an engine object.
    pub fn object_remove(&self, uri: &Uri) -> Result<()> {
        if self.object_type(uri)?.is_none() {
            return Err(Error::NotFound(format!("{uri} is not a tilevault object")));
        }
        self.ctx.vfs.remove_dir(uri)?;
        Ok(())
    }

    /// Move the object at `from` to `to`, overwriting `to` if it exists.
    ///
    /// # Errors
    /// Returns [`Error::NotFound`] if `from` is not an engine object.
    pub fn object_move(&self, from: &Uri, to: &Uri) -> Result<()> {
        if self.object_type(from)?.is_none() {
            return Err(Error::NotFound(format!("{from} is not a tilevault object")));
        }
        self.ctx.vfs.move_path(from, to)?;
        Ok(())
    }

    fn object_children(&self, uri: &Uri) -> Result<Vec<(Uri, ObjectType)>> {
        let mut children = Vec::new();
        for child in self.ctx.vfs.ls(uri)? {
            if let Some(object_type) = self.object_type(&child)? {
                children.push((child, object_type));
            }
        }
        Ok(children)
    }

    /// Iterate over the engine objects beneath `path`.
    ///
    /// # Errors
    /// Propagates filesystem failures while listing `path` itself.
    pub fn object_iter(
        &self,
        path: &Uri,
        order: WalkOrder,
        recursive: bool,
    ) -> Result<ObjectIter<'_>> {
        let mut stack: Vec<ObjectIterEntry> = self
            .object_children(path)?
            .into_iter()
            .map(|(uri, object_type)| ObjectIterEntry {
                uri,
                object_type,
                expanded: false,
            })
            .collect();
        stack.reverse();
        Ok(ObjectIter {
            sm: self,
            order,
            recursive,
            stack,
        })
    }

    /* ---------------- raw URI and cache access ---------------- */

    /// Read `nbytes` at `offset` from the file at `uri`.
    pub fn read(&self, uri: &Uri, offset: u64, nbytes: u64) -> Result<Bytes> {
        Ok(self.ctx.vfs.read(uri, offset, nbytes)?)
    }

    /// Append `data` to the file at `uri`.
    pub fn write(&self, uri: &Uri, data: &[u8]) -> Result<()> {
        Ok(self.ctx.vfs.write(uri, data)?)
    }

    /// Create a directory at `uri`.
    pub fn create_dir(&self, uri: &Uri) -> Result<()> {
        Ok(self.ctx.vfs.create_dir(uri)?)
    }

    /// Create an empty file at `uri`.
    pub fn touch(&self, uri: &Uri) -> Result<()> {
        Ok(self.ctx.vfs.touch(uri)?)
    }

    /// Read a tile from the cache. Exposed for testing; queries read
    /// through the cache internally.
    ///
    /// # Errors
    /// Returns [`Error::InvalidArgument`] on a size mismatch with the
    /// cached entry.
    pub fn read_from_cache(
        &self,
        uri: &Uri,
        offset: u64,
        nbytes: u64,
    ) -> Result<Option<Bytes>> {
        self.ctx
            .tile_cache
            .read(&TileKey::new(uri.clone(), offset), nbytes)
    }

    /// Insert a tile into the cache. Exposed for testing.
    pub fn write_to_cache(&self, uri: &Uri, offset: u64, bytes: Bytes) {
        self.ctx.tile_cache.insert(TileKey::new(uri.clone(), offset), bytes);
    }

    /// The resident bytes of the tile cache.
    #[must_use]
    pub fn tile_cache_resident_bytes(&self) -> u64 {
        self.ctx.tile_cache.resident_bytes()
    }

    #[cfg(test)]
    pub(crate) fn open_for_reads_count(&self, uri: &Uri) -> Option<u64> {
        self.open_arrays_for_reads
            .lock()
            .get(uri.as_str())
            .map(|open_array| open_array.cnt())
    }
}

fn check_key(schema: &ArraySchema, key: &EncryptionKey) -> Result<()> {
    match schema.key_validation() {
        Some(validation) => validation.check(key),
        None => {
            if *key == EncryptionKey::none() {
                Ok(())
            } else {
                Err(Error::Unauthorized)
            }
        }
    }
}

struct ObjectIterEntry {
    uri: Uri,
    object_type: ObjectType,
    expanded: bool,
}

/// An iterator over the engine objects beneath a path, in pre- or
/// post-order, optionally recursive.
pub struct ObjectIter<'a> {
    sm: &'a StorageManager,
    order: WalkOrder,
    recursive: bool,
    stack: Vec<ObjectIterEntry>,
}

impl Iterator for ObjectIter<'_> {
    type Item = Result<(Uri, ObjectType)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = self.stack.pop()?;
            let expand = self.recursive && !entry.expanded;
            let children = if expand {
                match self.sm.object_children(&entry.uri) {
                    Ok(children) => children,
                    Err(err) => return Some(Err(err)),
                }
            } else {
                Vec::new()
            };
            match self.order {
                WalkOrder::Preorder => {
                    self.stack.extend(children.into_iter().rev().map(
                        |(uri, object_type)| ObjectIterEntry {
                            uri,
                            object_type,
                            expanded: false,
                        },
                    ));
                    return Some(Ok((entry.uri, entry.object_type)));
                }
                WalkOrder::Postorder => {
                    if !expand || children.is_empty() {
                        return Some(Ok((entry.uri, entry.object_type)));
                    }
                    self.stack.push(ObjectIterEntry {
                        expanded: true,
                        ..entry
                    });
                    self.stack.extend(children.into_iter().rev().map(
                        |(uri, object_type)| ObjectIterEntry {
                            uri,
                            object_type,
                            expanded: false,
                        },
                    ));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array_schema::{ArraySchema, ArrayType, Attribute, Dimension};
    use crate::datatype::Datatype;

    fn sm() -> StorageManager {
        StorageManager::with_vfs(Config::default(), Vfs::new()).unwrap()
    }

    fn create_array(sm: &StorageManager, uri: &Uri) {
        let schema = ArraySchema::new(
            ArrayType::Dense,
            vec![Dimension::new("d", Datatype::Int64, [1, 4], 2)],
            vec![Attribute::new("a", Datatype::Int32)],
        );
        sm.array_create(uri, &schema, &EncryptionKey::none()).unwrap();
    }

    #[test]
    fn open_close_round_trip() {
        let sm = sm();
        let uri = Uri::new("mem://arrays/a").unwrap();
        create_array(&sm, &uri);
        let key = EncryptionKey::none();

        assert_eq!(sm.open_for_reads_count(&uri), None);
        for expected in 1..=3 {
            sm.array_open_for_reads(&uri, u64::MAX, &key).unwrap();
            assert_eq!(sm.open_for_reads_count(&uri), Some(expected));
        }
        for expected in (0..3).rev() {
            sm.array_close_for_reads(&uri).unwrap();
            assert_eq!(
                sm.open_for_reads_count(&uri),
                (expected > 0).then_some(expected)
            );
        }
        // A close without a matching open is an error.
        assert!(matches!(
            sm.array_close_for_reads(&uri),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn reads_and_writes_are_separate_registries() {
        let sm = sm();
        let uri = Uri::new("mem://arrays/a").unwrap();
        create_array(&sm, &uri);
        let key = EncryptionKey::none();

        sm.array_open_for_reads(&uri, u64::MAX, &key).unwrap();
        sm.array_open_for_writes(&uri, &key).unwrap();
        sm.array_close_for_writes(&uri).unwrap();
        // The read handle is unaffected by the write close.
        assert_eq!(sm.open_for_reads_count(&uri), Some(1));
        sm.array_close_for_reads(&uri).unwrap();
        assert!(matches!(
            sm.array_close_for_writes(&uri),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn reopen_requires_an_open_array() {
        let sm = sm();
        let uri = Uri::new("mem://arrays/a").unwrap();
        create_array(&sm, &uri);
        assert!(matches!(
            sm.array_reopen(&uri, u64::MAX, &EncryptionKey::none()),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn failed_open_leaves_no_entry() {
        let sm = sm();
        let uri = Uri::new("mem://arrays/missing").unwrap();
        assert!(matches!(
            sm.array_open_for_reads(&uri, u64::MAX, &EncryptionKey::none()),
            Err(Error::NotFound(_))
        ));
        assert_eq!(sm.open_for_reads_count(&uri), None);
    }

    #[test]
    fn xlock_waits_for_readers_and_blocks_opens() {
        let sm = Arc::new(sm());
        let uri = Uri::new("mem://arrays/a").unwrap();
        create_array(&sm, &uri);
        let key = EncryptionKey::none();

        sm.array_open_for_reads(&uri, u64::MAX, &key).unwrap();
        let locker = {
            let sm = Arc::clone(&sm);
            let uri = uri.clone();
            std::thread::spawn(move || sm.array_xlock(&uri))
        };
        std::thread::sleep(Duration::from_millis(50));
        assert!(!locker.is_finished());

        sm.array_close_for_reads(&uri).unwrap();
        locker.join().unwrap().unwrap();

        // Opens now block until the lock is released.
        let opener = {
            let sm = Arc::clone(&sm);
            let uri = uri.clone();
            std::thread::spawn(move || {
                sm.array_open_for_reads(&uri, u64::MAX, &EncryptionKey::none())
            })
        };
        std::thread::sleep(Duration::from_millis(50));
        assert!(!opener.is_finished());
        sm.array_xunlock(&uri).unwrap();
        opener.join().unwrap().unwrap();
        sm.array_close_for_reads(&uri).unwrap();
    }

    #[test]
    fn xlock_times_out_with_conflict() {
        let mut config = Config::default();
        config.xlock_timeout_ms = 50;
        let sm = StorageManager::with_vfs(config, Vfs::new()).unwrap();
        let uri = Uri::new("mem://arrays/a").unwrap();
        create_array(&sm, &uri);

        sm.array_open_for_reads(&uri, u64::MAX, &EncryptionKey::none())
            .unwrap();
        assert!(matches!(sm.array_xlock(&uri), Err(Error::Conflict(_))));
        // The failed lock released everything; a later lock succeeds.
        sm.array_close_for_reads(&uri).unwrap();
        sm.array_xlock(&uri).unwrap();
        sm.array_xunlock(&uri).unwrap();
    }

    #[test]
    fn object_lifecycle_and_iteration() {
        let sm = sm();
        let root = Uri::new("mem://objects").unwrap();
        let group = root.join("g");
        sm.group_create(&group).unwrap();
        create_array(&sm, &group.join("a1"));
        let nested = group.join("sub");
        sm.group_create(&nested).unwrap();
        create_array(&sm, &nested.join("a2"));

        assert_eq!(sm.object_type(&group).unwrap(), Some(ObjectType::Group));
        assert_eq!(
            sm.object_type(&group.join("a1")).unwrap(),
            Some(ObjectType::Array)
        );
        assert!(matches!(
            sm.group_create(&group),
            Err(Error::AlreadyExists(_))
        ));

        let preorder: Vec<(Uri, ObjectType)> = sm
            .object_iter(&root, WalkOrder::Preorder, true)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(
            preorder,
            vec![
                (group.clone(), ObjectType::Group),
                (group.join("a1"), ObjectType::Array),
                (nested.clone(), ObjectType::Group),
                (nested.join("a2"), ObjectType::Array),
            ]
        );

        let postorder: Vec<(Uri, ObjectType)> = sm
            .object_iter(&root, WalkOrder::Postorder, true)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(
            postorder,
            vec![
                (group.join("a1"), ObjectType::Array),
                (nested.join("a2"), ObjectType::Array),
                (nested.clone(), ObjectType::Group),
                (group.clone(), ObjectType::Group),
            ]
        );

        // Non-recursive iteration yields only direct children.
        let direct: Vec<(Uri, ObjectType)> = sm
            .object_iter(&group, WalkOrder::Preorder, false)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(direct.len(), 2);

        let moved = root.join("g2");
        sm.object_move(&group, &moved).unwrap();
        assert_eq!(sm.object_type(&moved).unwrap(), Some(ObjectType::Group));
        sm.object_remove(&moved).unwrap();
        assert!(matches!(
            sm.object_remove(&moved),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn cache_endpoints() {
        let sm = sm();
        let uri = Uri::new("mem://files/a.tdb").unwrap();
        sm.write_to_cache(&uri, 0, Bytes::from_static(b"tile"));
        assert_eq!(
            sm.read_from_cache(&uri, 0, 4).unwrap(),
            Some(Bytes::from_static(b"tile"))
        );
        assert_eq!(sm.read_from_cache(&uri, 4, 4).unwrap(), None);
        assert!(sm.tile_cache_resident_bytes() <= sm.config().tile_cache_size);
    }
}
