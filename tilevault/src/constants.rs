//! Reserved file names and format versions of the on-disk layout.

/// The array schema file name.
pub const ARRAY_SCHEMA_FILENAME: &str = "__array_schema.tdb";

/// The key-value schema file name.
pub const KV_SCHEMA_FILENAME: &str = "__kv_schema.tdb";

/// The fragment metadata file name. Its presence finalizes a fragment;
/// fragment directories without it are invisible to queries.
pub const FRAGMENT_METADATA_FILENAME: &str = "__fragment_metadata.tdb";

/// The group marker file name.
pub const GROUP_FILENAME: &str = "__group.tdb";

/// The consolidation file lock name, created inside the array directory.
pub const LOCK_FILENAME: &str = "__lock.tdb";

/// Prefix of all reserved names inside an array directory.
pub const SPECIAL_NAME_PREFIX: &str = "__";

/// Suffix of attribute data files inside a fragment directory.
pub const FILE_SUFFIX: &str = ".tdb";

/// The current on-disk format version, written into schema and fragment
/// metadata documents and encoded in fragment directory names.
pub const FORMAT_VERSION: u32 = 2;
