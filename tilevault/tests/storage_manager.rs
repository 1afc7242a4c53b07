#![allow(missing_docs)]

use std::sync::Arc;
use std::time::Duration;

use tilevault::array_schema::{ArraySchema, ArrayType, Attribute, Dimension};
use tilevault::datatype::Datatype;
use tilevault::encryption::{EncryptionKey, EncryptionType};
use tilevault::query::{Query, QueryStatus};
use tilevault::storage::Uri;
use tilevault::{Config, Error, StorageManager};

fn dense_4x4() -> ArraySchema {
    ArraySchema::new(
        ArrayType::Dense,
        vec![
            Dimension::new("rows", Datatype::Int64, [1, 4], 2),
            Dimension::new("cols", Datatype::Int64, [1, 4], 2),
        ],
        vec![Attribute::new("a", Datatype::Int32)],
    )
}

fn values_to_bytes(values: &[i32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn bytes_to_values(bytes: &[u8]) -> Vec<i32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Write `values` over `subarray` and wait a tick so the next fragment
/// gets a strictly later timestamp.
fn write_region(
    sm: &StorageManager,
    uri: &Uri,
    key: &EncryptionKey,
    subarray: &[[i64; 2]],
    values: &[i32],
) {
    let snapshot = sm.array_open_for_writes(uri, key).unwrap();
    let mut query = Query::new(snapshot);
    query.set_subarray(subarray).unwrap();
    query.set_buffer("a", values_to_bytes(values)).unwrap();
    sm.query_submit(&mut query).unwrap();
    assert_eq!(query.status(), QueryStatus::Completed);
    sm.array_close_for_writes(uri).unwrap();
    std::thread::sleep(Duration::from_millis(5));
}

fn read_full_at(sm: &StorageManager, uri: &Uri, key: &EncryptionKey, timestamp: u64) -> Vec<i32> {
    let snapshot = sm.array_open_for_reads(uri, timestamp, key).unwrap();
    let values = read_snapshot(sm, &snapshot);
    sm.array_close_for_reads(uri).unwrap();
    values
}

fn read_snapshot(sm: &StorageManager, snapshot: &tilevault::query::ArraySnapshot) -> Vec<i32> {
    let mut query = Query::new(snapshot.clone());
    query.set_buffer("a", vec![0; 64]).unwrap();
    sm.query_submit(&mut query).unwrap();
    assert_eq!(query.status(), QueryStatus::Completed);
    let (data, size) = query.buffer("a").unwrap();
    bytes_to_values(&data[..size as usize])
}

#[test]
fn create_write_read_round_trip() {
    let sm = StorageManager::new(Config::default()).unwrap();
    let uri = Uri::new("mem://arrays/round_trip").unwrap();
    let key = EncryptionKey::none();
    sm.array_create(&uri, &dense_4x4(), &key).unwrap();

    // Cell (i, j) holds i*10 + j, written in row-major order.
    let values: Vec<i32> = (1..=4).flat_map(|i| (1..=4).map(move |j| i * 10 + j)).collect();
    write_region(&sm, &uri, &key, &[[1, 4], [1, 4]], &values);

    assert_eq!(read_full_at(&sm, &uri, &key, u64::MAX), values);
    assert_eq!(values[0], 11);
    assert_eq!(values[15], 44);

    // Creating over an existing object fails.
    assert!(matches!(
        sm.array_create(&uri, &dense_4x4(), &key),
        Err(Error::AlreadyExists(_))
    ));
}

#[cfg(feature = "filesystem")]
#[test]
fn round_trip_on_the_local_filesystem() {
    let dir = tempfile::TempDir::new().unwrap();
    let sm = StorageManager::new(Config::default()).unwrap();
    let uri = Uri::new(dir.path().join("array").to_str().unwrap()).unwrap();
    let key = EncryptionKey::none();
    sm.array_create(&uri, &dense_4x4(), &key).unwrap();

    let values: Vec<i32> = (0..16).collect();
    write_region(&sm, &uri, &key, &[[1, 4], [1, 4]], &values);
    assert_eq!(read_full_at(&sm, &uri, &key, u64::MAX), values);

    // The array is a real directory carrying one fragment.
    let info = sm.fragment_info(&uri, u64::MAX).unwrap();
    assert_eq!(info.len(), 1);
    assert!(info[0].uri.as_str().contains("__"));
}

#[test]
fn reader_snapshots_are_stable_until_reopen() {
    let sm = StorageManager::new(Config::default()).unwrap();
    let uri = Uri::new("mem://arrays/snapshot").unwrap();
    let key = EncryptionKey::none();
    sm.array_create(&uri, &dense_4x4(), &key).unwrap();

    let old: Vec<i32> = (0..16).collect();
    write_region(&sm, &uri, &key, &[[1, 4], [1, 4]], &old);
    let t0 = sm.fragment_info(&uri, u64::MAX).unwrap()[0].timestamp_ms;

    let snapshot_t0 = sm.array_open_for_reads(&uri, t0, &key).unwrap();
    assert_eq!(snapshot_t0.fragments().len(), 1);

    // A writer commits a second fragment after the reader opened.
    let new: Vec<i32> = (100..116).collect();
    write_region(&sm, &uri, &key, &[[1, 4], [1, 4]], &new);
    let info = sm.fragment_info(&uri, u64::MAX).unwrap();
    assert_eq!(info.len(), 2);
    let t1 = info[1].timestamp_ms;
    assert!(t1 > t0);

    // Re-reading the t0 snapshot still sees only the original cells.
    assert_eq!(read_snapshot(&sm, &snapshot_t0), old);

    // Reopening at t1 sees both fragments, with the later one winning.
    let snapshot_t1 = sm.array_reopen(&uri, t1, &key).unwrap();
    assert_eq!(snapshot_t1.fragments().len(), 2);
    assert_eq!(read_snapshot(&sm, &snapshot_t1), new);

    // Reopen at the original timestamp returns the original list.
    let again = sm.array_reopen(&uri, t0, &key).unwrap();
    let uris = |snapshot: &tilevault::query::ArraySnapshot| {
        snapshot
            .fragments()
            .iter()
            .map(|f| f.uri().clone())
            .collect::<Vec<_>>()
    };
    assert_eq!(uris(&again), uris(&snapshot_t0));

    sm.array_close_for_reads(&uri).unwrap();
}

#[test]
fn consolidation_waits_for_readers_and_swaps_atomically() {
    let sm = Arc::new(StorageManager::new(Config::default()).unwrap());
    let uri = Uri::new("mem://arrays/consolidate").unwrap();
    let key = EncryptionKey::none();
    sm.array_create(&uri, &dense_4x4(), &key).unwrap();

    // Three fragments: a full base write and two partial overwrites.
    let base: Vec<i32> = (0..16).collect();
    write_region(&sm, &uri, &key, &[[1, 4], [1, 4]], &base);
    let top: Vec<i32> = (100..108).collect();
    write_region(&sm, &uri, &key, &[[1, 2], [1, 4]], &top);
    let corner: Vec<i32> = (200..204).collect();
    write_region(&sm, &uri, &key, &[[3, 4], [3, 4]], &corner);
    assert_eq!(sm.fragment_info(&uri, u64::MAX).unwrap().len(), 3);

    let before = read_full_at(&sm, &uri, &key, u64::MAX);

    // A reader holds the array open; consolidation must block at the
    // retirement lock.
    let reader_snapshot = sm.array_open_for_reads(&uri, u64::MAX, &key).unwrap();
    let consolidator = {
        let sm = Arc::clone(&sm);
        let uri = uri.clone();
        let key = key.clone();
        std::thread::spawn(move || sm.array_consolidate(&uri, &key, None))
    };
    std::thread::sleep(Duration::from_millis(100));
    assert!(!consolidator.is_finished());

    // The blocked consolidator has already produced the merged fragment;
    // the held snapshot still reads the pre-consolidation cells.
    assert_eq!(read_snapshot(&sm, &reader_snapshot), before);

    sm.array_close_for_reads(&uri).unwrap();
    consolidator.join().unwrap().unwrap();

    // A fresh reader sees exactly one fragment with equivalent cells.
    assert_eq!(sm.fragment_info(&uri, u64::MAX).unwrap().len(), 1);
    assert_eq!(read_full_at(&sm, &uri, &key, u64::MAX), before);
}

#[test]
fn cancel_all_tasks_reaches_quiescence() {
    let mut config = Config::default();
    config.num_async_threads = 2;
    let sm = StorageManager::new(config).unwrap();
    let uri = Uri::new("mem://arrays/cancel").unwrap();
    let key = EncryptionKey::none();
    sm.array_create(&uri, &dense_4x4(), &key).unwrap();
    let values: Vec<i32> = (0..16).collect();
    write_region(&sm, &uri, &key, &[[1, 4], [1, 4]], &values);

    let snapshot = sm.array_open_for_reads(&uri, u64::MAX, &key).unwrap();
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let mut query = Query::new(snapshot.clone());
            query.set_buffer("a", vec![0; 64]).unwrap();
            sm.query_submit_async(query)
        })
        .collect();

    sm.cancel_all_tasks().unwrap();
    assert!(!sm.cancellation_in_progress());

    let mut completed = 0;
    let mut cancelled = 0;
    for handle in handles {
        match handle.wait() {
            Ok(query) => {
                assert_eq!(query.status(), QueryStatus::Completed);
                let (data, size) = query.buffer("a").unwrap();
                assert_eq!(bytes_to_values(&data[..size as usize]), values);
                completed += 1;
            }
            Err(Error::Cancelled) => cancelled += 1,
            Err(other) => panic!("unexpected query outcome: {other}"),
        }
    }
    assert_eq!(completed + cancelled, 8);
    assert_eq!(sm.queries_in_progress(), 0);

    // The engine is usable again after the flag clears.
    let mut query = Query::new(snapshot.clone());
    query.set_buffer("a", vec![0; 64]).unwrap();
    sm.query_submit(&mut query).unwrap();
    sm.array_close_for_reads(&uri).unwrap();
}

#[test]
fn encryption_key_is_validated_on_open() {
    let sm = StorageManager::new(Config::default()).unwrap();
    let uri = Uri::new("mem://arrays/encrypted").unwrap();
    let key1 = EncryptionKey::new(EncryptionType::Aes256Gcm, &[1; 32]).unwrap();
    let key2 = EncryptionKey::new(EncryptionType::Aes256Gcm, &[2; 32]).unwrap();
    sm.array_create(&uri, &dense_4x4(), &key1).unwrap();

    assert!(matches!(
        sm.array_open_for_reads(&uri, u64::MAX, &key2),
        Err(Error::Unauthorized)
    ));
    assert!(matches!(
        sm.array_open_for_writes(&uri, &EncryptionKey::none()),
        Err(Error::Unauthorized)
    ));

    let snapshot = sm.array_open_for_reads(&uri, u64::MAX, &key1).unwrap();
    assert_eq!(snapshot.fragments().len(), 0);
    sm.array_close_for_reads(&uri).unwrap();
}

#[test]
fn partial_fragments_are_invisible() {
    let sm = StorageManager::new(Config::default()).unwrap();
    let uri = Uri::new("mem://arrays/partial").unwrap();
    let key = EncryptionKey::none();
    sm.array_create(&uri, &dense_4x4(), &key).unwrap();

    let values: Vec<i32> = (0..16).collect();
    write_region(&sm, &uri, &key, &[[1, 4], [1, 4]], &values);

    // A fragment directory without a finalization marker: data present,
    // metadata never written.
    let partial = uri.join("__deadbeef_9999999999999_2");
    sm.create_dir(&partial).unwrap();
    sm.write(&partial.join("a.tdb"), &[0xff; 64]).unwrap();

    let info = sm.fragment_info(&uri, u64::MAX).unwrap();
    assert_eq!(info.len(), 1);
    assert_eq!(read_full_at(&sm, &uri, &key, u64::MAX), values);
}

#[test]
fn non_empty_domain_and_max_buffer_sizes() {
    let sm = StorageManager::new(Config::default()).unwrap();
    let uri = Uri::new("mem://arrays/domain").unwrap();
    let key = EncryptionKey::none();
    sm.array_create(&uri, &dense_4x4(), &key).unwrap();

    let empty = sm.array_open_for_reads(&uri, u64::MAX, &key).unwrap();
    assert_eq!(sm.array_non_empty_domain(&empty).unwrap(), None);
    sm.array_close_for_reads(&uri).unwrap();

    let top: Vec<i32> = (0..8).collect();
    write_region(&sm, &uri, &key, &[[1, 2], [1, 4]], &top);
    let corner: Vec<i32> = (0..4).collect();
    write_region(&sm, &uri, &key, &[[3, 4], [3, 4]], &corner);

    let snapshot = sm.array_open_for_reads(&uri, u64::MAX, &key).unwrap();
    assert_eq!(
        sm.array_non_empty_domain(&snapshot).unwrap(),
        Some(vec![[1, 4], [1, 4]])
    );
    let sizes = sm.array_max_buffer_sizes(&snapshot, &[[1, 4], [1, 4]]).unwrap();
    assert_eq!(sizes["a"], 64);
    sm.array_close_for_reads(&uri).unwrap();
}

#[test]
fn unaligned_dense_writes_are_rejected() {
    let sm = StorageManager::new(Config::default()).unwrap();
    let uri = Uri::new("mem://arrays/unaligned").unwrap();
    let key = EncryptionKey::none();
    sm.array_create(&uri, &dense_4x4(), &key).unwrap();

    let snapshot = sm.array_open_for_writes(&uri, &key).unwrap();
    let mut query = Query::new(snapshot);
    query.set_subarray(&[[2, 3], [1, 4]]).unwrap();
    query.set_buffer("a", vec![0; 32]).unwrap();
    assert!(matches!(
        sm.query_submit(&mut query),
        Err(Error::InvalidArgument(_))
    ));
    assert_eq!(query.status(), QueryStatus::Failed);
    sm.array_close_for_writes(&uri).unwrap();

    // The failed write left no visible fragment.
    assert_eq!(sm.fragment_info(&uri, u64::MAX).unwrap().len(), 0);
}

#[test]
fn explicit_fragment_lists_are_used_verbatim() {
    let sm = StorageManager::new(Config::default()).unwrap();
    let uri = Uri::new("mem://arrays/explicit").unwrap();
    let key = EncryptionKey::none();
    sm.array_create(&uri, &dense_4x4(), &key).unwrap();

    let old: Vec<i32> = (0..16).collect();
    write_region(&sm, &uri, &key, &[[1, 4], [1, 4]], &old);
    let new: Vec<i32> = (100..116).collect();
    write_region(&sm, &uri, &key, &[[1, 4], [1, 4]], &new);

    // Restricting the open to the first fragment hides the second.
    let first = sm.fragment_info(&uri, u64::MAX).unwrap()[0].uri.clone();
    let snapshot = sm
        .array_open_for_reads_with_fragments(&uri, &[first], &key)
        .unwrap();
    assert_eq!(snapshot.fragments().len(), 1);
    assert_eq!(read_snapshot(&sm, &snapshot), old);
    sm.array_close_for_reads(&uri).unwrap();

    // A listed fragment with an unknown format version is an error, and
    // the failed open leaves no reference behind.
    let future = uri.join("__feedf00d_1_99");
    sm.create_dir(&future).unwrap();
    sm.touch(&future.join("__fragment_metadata.tdb")).unwrap();
    assert!(matches!(
        sm.array_open_for_reads_with_fragments(&uri, &[future], &key),
        Err(Error::UnsupportedVersion(99))
    ));
    assert!(matches!(
        sm.array_close_for_reads(&uri),
        Err(Error::InvalidState(_))
    ));

    // The schema loads independently of any open.
    let schema = sm.load_array_schema(&uri, &key).unwrap();
    assert_eq!(schema.dim_num(), 2);
}

struct MockRestClient {
    schema: ArraySchema,
}

impl tilevault::rest::RestClient for MockRestClient {
    fn get_array_schema(&self, _uri: &Uri) -> tilevault::Result<ArraySchema> {
        Ok(self.schema.clone())
    }

    fn submit_query(&self, _uri: &Uri, query: &mut Query) -> tilevault::Result<()> {
        // Serve a fixed row-major answer, as a remote executor would.
        let values: Vec<i32> = (0..16).collect();
        query.set_buffer("a", values_to_bytes(&values))?;
        Ok(())
    }

    fn finalize_query(&self, _uri: &Uri, _query: &mut Query) -> tilevault::Result<()> {
        Ok(())
    }

    fn get_non_empty_domain(&self, _uri: &Uri) -> tilevault::Result<Option<Vec<[i64; 2]>>> {
        Ok(Some(vec![[1, 4], [1, 4]]))
    }
}

#[test]
fn rest_arrays_route_through_the_client() {
    let mut config = Config::default();
    config
        .set("rest.server_address", "http://localhost:8080")
        .unwrap();
    let sm = StorageManager::new(config).unwrap();
    let uri = Uri::new("tilevault://org/arrays/remote").unwrap();
    let key = EncryptionKey::none();

    // Without a client the routing surfaces as unsupported.
    assert!(matches!(
        sm.array_open_for_reads(&uri, u64::MAX, &key),
        Err(Error::Unsupported(_))
    ));

    sm.set_rest_client(Arc::new(MockRestClient {
        schema: dense_4x4(),
    }));
    let snapshot = sm.array_open_for_reads(&uri, u64::MAX, &key).unwrap();
    assert_eq!(snapshot.schema().dim_num(), 2);
    assert_eq!(
        sm.array_non_empty_domain(&snapshot).unwrap(),
        Some(vec![[1, 4], [1, 4]])
    );

    let mut query = Query::new(snapshot.clone());
    query.set_buffer("a", vec![0; 64]).unwrap();
    sm.query_submit(&mut query).unwrap();
    assert_eq!(query.status(), QueryStatus::Completed);
    let (data, size) = query.buffer("a").unwrap();
    assert_eq!(bytes_to_values(&data[..size as usize]), (0..16).collect::<Vec<i32>>());

    sm.array_close_for_reads(&uri).unwrap();
}
