use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::array_schema::ArraySchema;
use crate::fragment::FragmentMetadata;
use crate::query::QueryType;
use crate::storage::Uri;

/// The shared state of one array open in one mode.
///
/// The first opener creates the entry, every opener increments the
/// reference count, and the last closer destroys it together with all
/// loaded fragment metadata. The metadata map accumulates as opens at new
/// timestamps request fragments; individual records are immutable once
/// inserted and are handed out as shared handles.
#[derive(Debug)]
pub(crate) struct OpenArray {
    uri: Uri,
    query_type: QueryType,
    schema: Arc<ArraySchema>,
    cnt: Mutex<u64>,
    fragment_metadata: Mutex<HashMap<Uri, Arc<FragmentMetadata>>>,
}

impl OpenArray {
    pub(crate) fn new(uri: Uri, query_type: QueryType, schema: Arc<ArraySchema>) -> Self {
        Self {
            uri,
            query_type,
            schema,
            cnt: Mutex::new(0),
            fragment_metadata: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn uri(&self) -> &Uri {
        &self.uri
    }

    pub(crate) fn query_type(&self) -> QueryType {
        self.query_type
    }

    pub(crate) fn schema(&self) -> &Arc<ArraySchema> {
        &self.schema
    }

    pub(crate) fn cnt_incr(&self) {
        *self.cnt.lock() += 1;
    }

    /// Decrement the reference count, returning the new value.
    pub(crate) fn cnt_decr(&self) -> u64 {
        let mut cnt = self.cnt.lock();
        debug_assert!(*cnt > 0);
        *cnt = cnt.saturating_sub(1);
        *cnt
    }

    #[cfg(test)]
    pub(crate) fn cnt(&self) -> u64 {
        *self.cnt.lock()
    }

    /// The metadata for `uri`, if already loaded.
    pub(crate) fn fragment_metadata(&self, uri: &Uri) -> Option<Arc<FragmentMetadata>> {
        self.fragment_metadata.lock().get(uri).cloned()
    }

    /// Insert freshly loaded metadata, returning the shared handle. If
    /// another open raced and inserted first, the existing record wins.
    pub(crate) fn insert_fragment_metadata(
        &self,
        metadata: FragmentMetadata,
    ) -> Arc<FragmentMetadata> {
        let mut map = self.fragment_metadata.lock();
        Arc::clone(
            map.entry(metadata.uri().clone())
                .or_insert_with(|| Arc::new(metadata)),
        )
    }
}
