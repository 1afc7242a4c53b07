//! The consolidator driver: merge a set of fragments into one and retire
//! the inputs without ever exposing a partially-retired state to readers.

use std::sync::Arc;

use tracing::{debug, info};

use crate::config::ConsolidationConfig;
use crate::encryption::EncryptionKey;
use crate::error::{Error, Result};
use crate::fragment::{now_ms, FragmentMetadata};
use crate::query::{union_bbox, Query};
use crate::storage::{StorageError, Uri};
use crate::storage_manager::StorageManager;

/// Run up to `config.steps` consolidation rounds on the array at `uri`.
pub(crate) fn consolidate(
    sm: &StorageManager,
    uri: &Uri,
    key: &EncryptionKey,
    config: &ConsolidationConfig,
) -> Result<()> {
    config.check()?;
    info!(array = %uri, "consolidation started");
    for step in 0..config.steps {
        if !consolidate_step(sm, uri, key, config)? {
            debug!(array = %uri, step, "no more candidate fragment sets");
            break;
        }
    }
    info!(array = %uri, "consolidation finished");
    Ok(())
}

/// One round: select, merge, retire. Returns `false` when no candidate set
/// exists.
fn consolidate_step(
    sm: &StorageManager,
    uri: &Uri,
    key: &EncryptionKey,
    config: &ConsolidationConfig,
) -> Result<bool> {
    let snapshot = sm.array_open_for_reads(uri, now_ms(), key)?;
    let outcome = merge_next(sm, uri, key, config, &snapshot);
    // The consolidator's own read handle must be gone before the exclusive
    // lock waits for readers to drain.
    sm.array_close_for_reads(uri)?;
    let Some(retired) = outcome? else {
        return Ok(false);
    };

    sm.array_xlock(uri)?;
    let removal = retire(sm, &retired);
    let unlock = sm.array_xunlock(uri);
    removal?;
    unlock?;
    info!(array = %uri, retired = retired.len(), "consolidation step committed");
    Ok(true)
}

/// Select the next fragment set, copy its cells into a new finalized
/// fragment, and return the URIs to retire.
fn merge_next(
    sm: &StorageManager,
    uri: &Uri,
    key: &EncryptionKey,
    config: &ConsolidationConfig,
    snapshot: &crate::query::ArraySnapshot,
) -> Result<Option<Vec<Uri>>> {
    let fragments = snapshot.fragments();
    if fragments.len() <= 1 {
        return Ok(None);
    }
    let Some((start, end)) = next_to_consolidate(fragments, config) else {
        return Ok(None);
    };
    let selected = &fragments[start..=end];
    let region = selected
        .iter()
        .map(|fragment| fragment.region().to_vec())
        .reduce(|a, b| union_bbox(&a, &b))
        .ok_or_else(|| Error::InvalidState("empty consolidation selection".into()))?;
    debug!(
        array = %uri,
        fragments = selected.len(),
        ?region,
        "merging fragment set"
    );

    // Read the union region through the selected fragments only.
    let read_snapshot = snapshot.with_fragments(selected.to_vec());
    let sizes = sm.array_max_buffer_sizes(&read_snapshot, &region)?;
    let mut read_query = Query::new(read_snapshot);
    read_query.set_subarray(&region)?;
    for (name, size) in &sizes {
        read_query.set_buffer(name, vec![0; *size as usize])?;
    }
    sm.query_submit(&mut read_query)?;

    // Reproduce the merged cells as one fragment that keeps its inputs'
    // position in the fragment order.
    let write_snapshot = sm.array_open_for_writes(uri, key)?;
    let mut write_query = Query::new(write_snapshot);
    write_query.set_subarray(&region)?;
    write_query.set_fragment_timestamp(selected[end - start].name().timestamp_ms());
    for name in sizes.keys() {
        let (mut data, size) = read_query
            .take_buffer(name)
            .ok_or_else(|| Error::InvalidState(format!("read produced no buffer {name:?}")))?;
        data.truncate(size as usize);
        write_query.set_buffer(name, data)?;
    }
    let written = sm.query_submit(&mut write_query);
    let closed = sm.array_close_for_writes(uri);
    written?;
    closed?;

    Ok(Some(
        selected
            .iter()
            .map(|fragment| fragment.uri().clone())
            .collect(),
    ))
}

/// Remove the retired fragment directories. Runs under the exclusive lock.
fn retire(sm: &StorageManager, retired: &[Uri]) -> Result<()> {
    for fragment_uri in retired {
        sm.vfs().remove_dir(fragment_uri).map_err(|err| match err {
            StorageError::NotFound(_) => Error::Conflict(format!(
                "fragment {fragment_uri} disappeared during retirement"
            )),
            other => Error::Storage(other),
        })?;
    }
    Ok(())
}

/// Pick the longest run of adjacent fragments (earliest on ties) whose
/// pairwise size ratio clears the configured gate, bounded by
/// `step_max_frags` and admitted only from `step_min_frags` up. A run is
/// rejected if its union bounding box overlaps any earlier fragment: the
/// merged fragment writes fill values into uncovered cells, which must not
/// mask older data.
fn next_to_consolidate(
    fragments: &[Arc<FragmentMetadata>],
    config: &ConsolidationConfig,
) -> Option<(usize, usize)> {
    let min = (config.step_min_frags as usize).max(2);
    let max = config.step_max_frags as usize;
    let mut best: Option<(usize, usize)> = None;

    for start in 0..fragments.len() {
        let mut bbox = fragments[start].region().to_vec();
        let mut end = start;
        while end + 1 < fragments.len() && end + 1 - start + 1 <= max {
            if !size_ratio_ok(&fragments[end], &fragments[end + 1], config.step_size_ratio) {
                break;
            }
            let grown = union_bbox(&bbox, fragments[end + 1].region());
            if overlaps_earlier(fragments, start, &grown) {
                break;
            }
            bbox = grown;
            end += 1;
        }
        let len = end - start + 1;
        if len >= min && best.map_or(true, |(s, e)| len > e - s + 1) {
            best = Some((start, end));
        }
    }
    best
}

fn size_ratio_ok(a: &FragmentMetadata, b: &FragmentMetadata, ratio: f32) -> bool {
    if ratio <= 0.0 {
        return true;
    }
    let (small, large) = if a.fragment_size() <= b.fragment_size() {
        (a.fragment_size(), b.fragment_size())
    } else {
        (b.fragment_size(), a.fragment_size())
    };
    if large == 0 {
        return true;
    }
    (small as f64 / large as f64) >= f64::from(ratio)
}

fn overlaps_earlier(fragments: &[Arc<FragmentMetadata>], start: usize, bbox: &[[i64; 2]]) -> bool {
    fragments[..start].iter().any(|fragment| {
        fragment
            .region()
            .iter()
            .zip(bbox)
            .all(|(a, b)| a[0] <= b[1] && b[0] <= a[1])
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::FragmentName;
    use crate::query::cell_num;
    use std::collections::BTreeMap;

    fn fragment(timestamp: u64, region: Vec<[i64; 2]>, size: u64) -> Arc<FragmentMetadata> {
        let name = FragmentName::generate(timestamp);
        let uri = Uri::new(format!("mem://a/{}", name.dirname())).unwrap();
        Arc::new(FragmentMetadata::new(
            uri,
            name,
            true,
            region.clone(),
            region.clone(),
            cell_num(&region),
            size,
            BTreeMap::new(),
        ))
    }

    #[test]
    fn selects_longest_adjacent_run() {
        let config = ConsolidationConfig::default();
        let fragments = vec![
            fragment(1, vec![[1, 4]], 100),
            fragment(2, vec![[1, 4]], 100),
            fragment(3, vec![[1, 4]], 100),
        ];
        assert_eq!(next_to_consolidate(&fragments, &config), Some((0, 2)));
    }

    #[test]
    fn respects_max_and_min() {
        let mut config = ConsolidationConfig::default();
        config.step_max_frags = 2;
        let fragments = vec![
            fragment(1, vec![[1, 4]], 100),
            fragment(2, vec![[1, 4]], 100),
            fragment(3, vec![[1, 4]], 100),
        ];
        assert_eq!(next_to_consolidate(&fragments, &config), Some((0, 1)));

        config.step_max_frags = 8;
        config.step_min_frags = 4;
        assert_eq!(next_to_consolidate(&fragments, &config), None);
    }

    #[test]
    fn size_ratio_gates_runs() {
        let mut config = ConsolidationConfig::default();
        config.step_size_ratio = 0.5;
        let fragments = vec![
            fragment(1, vec![[1, 4]], 100),
            fragment(2, vec![[1, 4]], 90),
            fragment(3, vec![[1, 4]], 10),
        ];
        // The 90:10 pair breaks the run.
        assert_eq!(next_to_consolidate(&fragments, &config), Some((0, 1)));
    }

    #[test]
    fn earlier_overlap_blocks_expansion() {
        // The size ratio rules out any run containing fragment 0, and the
        // only remaining run grows a bounding box overlapping fragment 0.
        let mut config = ConsolidationConfig::default();
        config.step_size_ratio = 0.5;
        let fragments = vec![
            fragment(1, vec![[1, 2]], 10_000),
            fragment(2, vec![[1, 2]], 100),
            fragment(3, vec![[3, 4]], 100),
        ];
        assert_eq!(next_to_consolidate(&fragments, &config), None);

        // With fragment 0 out of the way the same run qualifies.
        let fragments = vec![
            fragment(1, vec![[5, 6]], 10_000),
            fragment(2, vec![[1, 2]], 100),
            fragment(3, vec![[3, 4]], 100),
        ];
        assert_eq!(next_to_consolidate(&fragments, &config), Some((1, 2)));
    }
}
