//! Queries over an open-array snapshot.

mod async_pool;
mod context;
mod dense;
mod reader;
mod writer;

pub use async_pool::AsyncQueryHandle;
pub(crate) use async_pool::AsyncPool;
pub(crate) use context::QueryContext;
pub(crate) use dense::{cell_num, union_bbox};

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::array_schema::{ArraySchema, Layout};
use crate::error::{Error, Result};
use crate::fragment::FragmentMetadata;
use crate::storage::Uri;

/// The mode of an open array or query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryType {
    /// Read cells from fragments visible at the open timestamp.
    Read,
    /// Produce a new fragment.
    Write,
}

/// The lifecycle status of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    /// Not yet submitted.
    Uninitialized,
    /// Currently executing.
    InProgress,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Observed cancellation at a checkpoint, or was dropped from the
    /// async queue before dispatch.
    Cancelled,
}

/// A consistent view of an array produced by an open: the schema plus the
/// fragment metadata visible at the open timestamp, in application order.
#[derive(Debug, Clone)]
pub struct ArraySnapshot {
    uri: Uri,
    query_type: QueryType,
    timestamp_ms: u64,
    schema: Arc<ArraySchema>,
    fragments: Vec<Arc<FragmentMetadata>>,
}

impl ArraySnapshot {
    pub(crate) fn new(
        uri: Uri,
        query_type: QueryType,
        timestamp_ms: u64,
        schema: Arc<ArraySchema>,
        fragments: Vec<Arc<FragmentMetadata>>,
    ) -> Self {
        Self {
            uri,
            query_type,
            timestamp_ms,
            schema,
            fragments,
        }
    }

    /// The array URI.
    #[must_use]
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// The mode the array was opened in.
    #[must_use]
    pub fn query_type(&self) -> QueryType {
        self.query_type
    }

    /// The timestamp the snapshot was taken at.
    #[must_use]
    pub fn timestamp_ms(&self) -> u64 {
        self.timestamp_ms
    }

    /// The array schema.
    #[must_use]
    pub fn schema(&self) -> &Arc<ArraySchema> {
        &self.schema
    }

    /// The visible fragments, ascending by timestamp (uuid tiebreak).
    #[must_use]
    pub fn fragments(&self) -> &[Arc<FragmentMetadata>] {
        &self.fragments
    }

    /// A snapshot restricted to a subset of the fragments, in the given
    /// order. The caller accepts responsibility for consistency.
    #[must_use]
    pub fn with_fragments(&self, fragments: Vec<Arc<FragmentMetadata>>) -> Self {
        Self {
            fragments,
            ..self.clone()
        }
    }
}

/// A per-attribute query buffer.
#[derive(Debug)]
pub(crate) struct QueryBuffer {
    pub(crate) data: Vec<u8>,
    /// Bytes of `data` holding valid cells (set by a completed read).
    pub(crate) size: u64,
}

/// A read or write query over an [`ArraySnapshot`].
///
/// Results are accumulated into the buffers supplied with
/// [`Query::set_buffer`]. Execution happens through
/// [`StorageManager::query_submit`](crate::StorageManager::query_submit) or
/// [`StorageManager::query_submit_async`](crate::StorageManager::query_submit_async).
#[derive(Debug)]
pub struct Query {
    snapshot: ArraySnapshot,
    layout: Layout,
    subarray: Option<Vec<[i64; 2]>>,
    buffers: BTreeMap<String, QueryBuffer>,
    status: QueryStatus,
    fragment_uri: Option<Uri>,
    fragment_timestamp: Option<u64>,
}

impl Query {
    /// Create a query over `snapshot`. The subarray defaults to the full
    /// domain and the layout to row-major.
    #[must_use]
    pub fn new(snapshot: ArraySnapshot) -> Self {
        Self {
            snapshot,
            layout: Layout::RowMajor,
            subarray: None,
            buffers: BTreeMap::new(),
            status: QueryStatus::Uninitialized,
            fragment_uri: None,
            fragment_timestamp: None,
        }
    }

    /// The mode of the query.
    #[must_use]
    pub fn query_type(&self) -> QueryType {
        self.snapshot.query_type()
    }

    /// The status of the query.
    #[must_use]
    pub fn status(&self) -> QueryStatus {
        self.status
    }

    /// The snapshot the query runs over.
    #[must_use]
    pub fn snapshot(&self) -> &ArraySnapshot {
        &self.snapshot
    }

    /// Restrict the query to `subarray` (inclusive per-dimension ranges).
    ///
    /// # Errors
    /// Returns [`Error::InvalidArgument`] if the subarray is outside the
    /// domain.
    pub fn set_subarray(&mut self, subarray: &[[i64; 2]]) -> Result<()> {
        self.snapshot.schema().check_subarray(subarray)?;
        self.subarray = Some(subarray.to_vec());
        Ok(())
    }

    /// Set the result layout.
    ///
    /// # Errors
    /// Returns [`Error::Unsupported`] for layouts other than row-major.
    pub fn set_layout(&mut self, layout: Layout) -> Result<()> {
        if layout != Layout::RowMajor {
            return Err(Error::Unsupported(
                "only row-major query layout is supported".into(),
            ));
        }
        self.layout = layout;
        Ok(())
    }

    /// Supply the buffer for attribute `name`.
    ///
    /// For writes the buffer holds the cells of the subarray in row-major
    /// order; for reads it receives them.
    ///
    /// # Errors
    /// Returns [`Error::InvalidArgument`] if the schema has no such
    /// attribute.
    pub fn set_buffer(&mut self, name: &str, data: Vec<u8>) -> Result<()> {
        if self.snapshot.schema().attribute(name).is_none() {
            return Err(Error::InvalidArgument(format!(
                "array has no attribute {name:?}"
            )));
        }
        let size = data.len() as u64;
        self.buffers.insert(name.to_string(), QueryBuffer { data, size });
        Ok(())
    }

    /// The buffer of attribute `name` and the number of valid bytes in it.
    #[must_use]
    pub fn buffer(&self, name: &str) -> Option<(&[u8], u64)> {
        self.buffers
            .get(name)
            .map(|buffer| (buffer.data.as_slice(), buffer.size))
    }

    /// Remove and return the buffer of attribute `name` and the number of
    /// valid bytes in it.
    #[must_use]
    pub fn take_buffer(&mut self, name: &str) -> Option<(Vec<u8>, u64)> {
        self.buffers
            .remove(name)
            .map(|buffer| (buffer.data, buffer.size))
    }

    /// The URI of the fragment a completed write query produced.
    #[must_use]
    pub fn fragment_uri(&self) -> Option<&Uri> {
        self.fragment_uri.as_ref()
    }

    /// The subarray, defaulted to the full domain.
    #[must_use]
    pub fn subarray(&self) -> Vec<[i64; 2]> {
        self.subarray
            .clone()
            .unwrap_or_else(|| self.snapshot.schema().domain())
    }

    pub(crate) fn set_status(&mut self, status: QueryStatus) {
        self.status = status;
    }

    pub(crate) fn set_fragment_uri(&mut self, uri: Uri) {
        self.fragment_uri = Some(uri);
    }

    /// Pin the timestamp of the produced fragment instead of using the
    /// submission time. Used by the consolidator so the merged fragment
    /// keeps its inputs' position in the fragment order.
    pub(crate) fn set_fragment_timestamp(&mut self, timestamp_ms: u64) {
        self.fragment_timestamp = Some(timestamp_ms);
    }

    pub(crate) fn fragment_timestamp(&self) -> Option<u64> {
        self.fragment_timestamp
    }

    pub(crate) fn buffers(&self) -> &BTreeMap<String, QueryBuffer> {
        &self.buffers
    }

    pub(crate) fn buffers_mut(&mut self) -> &mut BTreeMap<String, QueryBuffer> {
        &mut self.buffers
    }
}
