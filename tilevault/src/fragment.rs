use std::collections::BTreeMap;

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::constants::{FORMAT_VERSION, FRAGMENT_METADATA_FILENAME};
use crate::error::{Error, Result};
use crate::storage::{Uri, Vfs};

/// Milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

/// The parsed name of a fragment directory: `__<uuid>_<timestamp>_<version>`.
///
/// Fragments order by ascending creation timestamp, ties broken by
/// lexicographic uuid; this is the order readers apply fragments.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct FragmentName {
    timestamp_ms: u64,
    uuid: String,
    version: u32,
}

impl FragmentName {
    /// Generate a fresh name at timestamp `timestamp_ms`.
    #[must_use]
    pub fn generate(timestamp_ms: u64) -> Self {
        Self {
            timestamp_ms,
            uuid: uuid::Uuid::new_v4().simple().to_string(),
            version: FORMAT_VERSION,
        }
    }

    /// Parse a fragment directory name. Returns `None` for names that are
    /// not fragments (the schema file, the lock file, foreign entries).
    #[must_use]
    pub fn parse(dirname: &str) -> Option<Self> {
        let rest = dirname.strip_prefix("__")?;
        let mut parts = rest.split('_');
        let uuid = parts.next()?;
        let timestamp_ms = parts.next()?.parse().ok()?;
        let version = parts.next()?.parse().ok()?;
        if parts.next().is_some() || uuid.is_empty() {
            return None;
        }
        Some(Self {
            timestamp_ms,
            uuid: uuid.to_string(),
            version,
        })
    }

    /// The directory name.
    #[must_use]
    pub fn dirname(&self) -> String {
        format!("__{}_{}_{}", self.uuid, self.timestamp_ms, self.version)
    }

    /// The creation timestamp in milliseconds since the Unix epoch.
    #[must_use]
    pub fn timestamp_ms(&self) -> u64 {
        self.timestamp_ms
    }

    /// The format version encoded in the name.
    #[must_use]
    pub fn version(&self) -> u32 {
        self.version
    }
}

/// Summary information about one fragment of an array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentInfo {
    /// The fragment directory URI.
    pub uri: Uri,
    /// The creation timestamp in milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    /// The format version of the fragment.
    pub version: u32,
}

/// The per-tile byte index of one attribute within a fragment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeTileIndex {
    /// Byte offset of each tile in the attribute file, in tile order.
    pub offsets: Vec<u64>,
    /// Byte size of each tile, parallel to `offsets`.
    pub sizes: Vec<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct FragmentMetadataDoc {
    version: u32,
    dense: bool,
    /// The written, tile-aligned region.
    region: Vec<[i64; 2]>,
    non_empty_domain: Vec<[i64; 2]>,
    cell_num: u64,
    fragment_size: u64,
    attributes: BTreeMap<String, AttributeTileIndex>,
}

/// The in-memory index of one fragment, shared by all readers of it.
///
/// Loaded lazily when a reader at a new timestamp first needs the fragment;
/// immutable once loaded.
#[derive(Debug)]
pub struct FragmentMetadata {
    uri: Uri,
    name: FragmentName,
    dense: bool,
    region: Vec<[i64; 2]>,
    non_empty_domain: Vec<[i64; 2]>,
    cell_num: u64,
    fragment_size: u64,
    attributes: BTreeMap<String, AttributeTileIndex>,
}

impl FragmentMetadata {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        uri: Uri,
        name: FragmentName,
        dense: bool,
        region: Vec<[i64; 2]>,
        non_empty_domain: Vec<[i64; 2]>,
        cell_num: u64,
        fragment_size: u64,
        attributes: BTreeMap<String, AttributeTileIndex>,
    ) -> Self {
        Self {
            uri,
            name,
            dense,
            region,
            non_empty_domain,
            cell_num,
            fragment_size,
            attributes,
        }
    }

    /// Load the metadata document of the fragment at `uri`.
    ///
    /// # Errors
    /// Returns [`Error::UnsupportedVersion`] for fragments written by a
    /// newer engine, [`Error::NotFound`] if the finalization marker is
    /// missing, and [`Error::InvalidArgument`] for malformed documents.
    pub fn load(vfs: &Vfs, uri: &Uri) -> Result<Self> {
        let name = FragmentName::parse(uri.last_path_part())
            .ok_or_else(|| Error::NotFound(format!("{uri} is not a fragment directory")))?;
        if name.version > FORMAT_VERSION {
            return Err(Error::UnsupportedVersion(name.version));
        }
        let marker = uri.join(FRAGMENT_METADATA_FILENAME);
        let bytes = vfs.read_all(&marker).map_err(|err| match err {
            crate::storage::StorageError::NotFound(_) => {
                Error::NotFound(format!("fragment {uri} has no finalization marker"))
            }
            other => Error::Storage(other),
        })?;
        let doc: FragmentMetadataDoc = serde_json::from_slice(&bytes)
            .map_err(|e| Error::InvalidArgument(format!("malformed fragment metadata: {e}")))?;
        if doc.version > FORMAT_VERSION {
            return Err(Error::UnsupportedVersion(doc.version));
        }
        Ok(Self {
            uri: uri.clone(),
            name,
            dense: doc.dense,
            region: doc.region,
            non_empty_domain: doc.non_empty_domain,
            cell_num: doc.cell_num,
            fragment_size: doc.fragment_size,
            attributes: doc.attributes,
        })
    }

    /// Write the metadata document. This is the finalization marker: the
    /// fragment becomes visible to the index once this write completes.
    pub(crate) fn store(&self, vfs: &Vfs) -> Result<()> {
        let doc = FragmentMetadataDoc {
            version: self.name.version,
            dense: self.dense,
            region: self.region.clone(),
            non_empty_domain: self.non_empty_domain.clone(),
            cell_num: self.cell_num,
            fragment_size: self.fragment_size,
            attributes: self.attributes.clone(),
        };
        let bytes =
            serde_json::to_vec_pretty(&doc).map_err(|e| Error::InvalidArgument(e.to_string()))?;
        vfs.write(&self.uri.join(FRAGMENT_METADATA_FILENAME), &bytes)?;
        Ok(())
    }

    /// The fragment directory URI.
    #[must_use]
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// The parsed fragment name.
    #[must_use]
    pub fn name(&self) -> &FragmentName {
        &self.name
    }

    /// Whether the fragment holds dense tiles.
    #[must_use]
    pub fn dense(&self) -> bool {
        self.dense
    }

    /// The written, tile-aligned region.
    #[must_use]
    pub fn region(&self) -> &[[i64; 2]] {
        &self.region
    }

    /// The per-dimension min/max of written cells.
    #[must_use]
    pub fn non_empty_domain(&self) -> &[[i64; 2]] {
        &self.non_empty_domain
    }

    /// The number of cells in the fragment.
    #[must_use]
    pub fn cell_num(&self) -> u64 {
        self.cell_num
    }

    /// The total bytes of attribute data in the fragment.
    #[must_use]
    pub fn fragment_size(&self) -> u64 {
        self.fragment_size
    }

    /// The tile index of attribute `name`.
    #[must_use]
    pub fn attribute_tiles(&self, name: &str) -> Option<&AttributeTileIndex> {
        self.attributes.get(name)
    }
}

/// List the fragments of `array_uri` visible at `timestamp`, sorted by
/// ascending timestamp with lexicographic uuid tiebreak.
///
/// Entries without a finalization marker or with a format version this
/// engine does not understand are skipped.
pub(crate) fn sorted_fragment_uris(
    vfs: &Vfs,
    array_uri: &Uri,
    timestamp: u64,
) -> Result<Vec<(Uri, FragmentName)>> {
    let mut fragments = Vec::new();
    for child in vfs.ls(array_uri)? {
        let Some(name) = FragmentName::parse(child.last_path_part()) else {
            continue;
        };
        if name.version > FORMAT_VERSION || name.timestamp_ms > timestamp {
            continue;
        }
        if !vfs.is_file(&child.join(FRAGMENT_METADATA_FILENAME))? {
            continue;
        }
        fragments.push((child, name));
    }
    Ok(fragments
        .into_iter()
        .sorted_by(|(_, a), (_, b)| a.cmp(b))
        .collect())
}
