//! `tilevault` is a storage engine for tiled multidimensional arrays.
//!
//! Users declare typed N-dimensional arrays partitioned into tiles and read
//! or write them through queries whose results land in caller-supplied
//! buffers. An array persists on a pluggable virtual filesystem as a
//! directory tree of immutable, timestamped *fragment* subdirectories, each
//! holding the tiles produced by one write. The [`StorageManager`] is the
//! concurrent lifecycle controller over that tree:
//!
//! - readers open the same array at different timestamps and each gets a
//!   consistent [`ArraySnapshot`](query::ArraySnapshot) of the fragments
//!   visible at that moment;
//! - writers produce new fragments concurrently with readers;
//! - the consolidator merges many fragments into one and retires the
//!   inputs behind an exclusive lock that never races a reader mid-scan;
//! - a bounded [`TileCache`](tile_cache::TileCache) is shared across all
//!   queries;
//! - asynchronous queries run on a worker pool with cooperative,
//!   tile-boundary cancellation.
//!
//! ## Example
//! ```rust
//! use tilevault::array_schema::{ArraySchema, ArrayType, Attribute, Dimension};
//! use tilevault::datatype::Datatype;
//! use tilevault::encryption::EncryptionKey;
//! use tilevault::query::Query;
//! use tilevault::storage::Uri;
//! use tilevault::{Config, StorageManager};
//!
//! let sm = StorageManager::new(Config::default())?;
//! let uri = Uri::new("mem://arrays/example")?;
//! let key = EncryptionKey::none();
//!
//! // A dense 4x4 array of int32 cells in 2x2 tiles.
//! let schema = ArraySchema::new(
//!     ArrayType::Dense,
//!     vec![
//!         Dimension::new("rows", Datatype::Int64, [1, 4], 2),
//!         Dimension::new("cols", Datatype::Int64, [1, 4], 2),
//!     ],
//!     vec![Attribute::new("a", Datatype::Int32)],
//! );
//! sm.array_create(&uri, &schema, &key)?;
//!
//! // Write the full domain.
//! let cells: Vec<u8> = (0..16i32).flat_map(|v| v.to_le_bytes()).collect();
//! let snapshot = sm.array_open_for_writes(&uri, &key)?;
//! let mut write = Query::new(snapshot);
//! write.set_buffer("a", cells)?;
//! sm.query_submit(&mut write)?;
//! sm.array_close_for_writes(&uri)?;
//!
//! // Read it back.
//! let snapshot = sm.array_open_for_reads(&uri, u64::MAX, &key)?;
//! let mut read = Query::new(snapshot);
//! read.set_buffer("a", vec![0; 64])?;
//! sm.query_submit(&mut read)?;
//! let (data, size) = read.buffer("a").unwrap();
//! assert_eq!(size, 64);
//! assert_eq!(&data[..4], &0i32.to_le_bytes());
//! sm.array_close_for_reads(&uri)?;
//! # Ok::<(), tilevault::Error>(())
//! ```
//!
//! ## Crate Features
//! - `filesystem` (default): register the `tilevault_filesystem` backend
//!   for `file` URIs, re-exported as [`filesystem`].
//!
//! ## Licence
//! `tilevault` is licensed under either of
//! - the Apache License, Version 2.0 or <http://www.apache.org/licenses/LICENSE-2.0> or
//! - the MIT license or <http://opensource.org/licenses/MIT>, at your option.

pub mod array_schema;
pub mod config;
pub mod constants;
pub mod datatype;
pub mod encryption;
pub mod fragment;
pub mod object;
pub mod query;
pub mod rest;
pub mod tile_cache;

mod consolidator;
mod error;
mod open_array;
mod storage_manager;

pub use tilevault_storage as storage;

#[cfg(feature = "filesystem")]
pub use tilevault_filesystem as filesystem;

pub use config::Config;
pub use error::{Error, Result};
pub use storage_manager::{ObjectIter, StorageManager};
