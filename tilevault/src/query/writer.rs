use std::collections::BTreeMap;

use rayon::prelude::*;

use crate::constants::FILE_SUFFIX;
use crate::error::{Error, Result};
use crate::fragment::{now_ms, AttributeTileIndex, FragmentMetadata, FragmentName};
use crate::query::context::QueryContext;
use crate::query::dense;
use crate::query::Query;
use crate::storage::Uri;

/// Execute a dense write: partition the supplied cells into tiles and
/// produce a new, finalized fragment directory.
pub(crate) fn write(ctx: &QueryContext, query: &mut Query) -> Result<()> {
    let snapshot = query.snapshot().clone();
    let schema = snapshot.schema().clone();
    if !schema.is_dense() {
        return Err(Error::Unsupported(
            "sparse query execution is not available in this engine".into(),
        ));
    }
    let subarray = query.subarray();
    schema.check_subarray(&subarray)?;
    if !schema.is_tile_aligned(&subarray) {
        return Err(Error::InvalidArgument(format!(
            "dense write subarray {subarray:?} is not tile aligned"
        )));
    }

    // A dense write supplies every attribute in full.
    let cells = dense::cell_num(&subarray);
    for attribute in schema.attributes() {
        let expected = cells * attribute.cell_size();
        match query.buffers().get(attribute.name()) {
            None => {
                return Err(Error::InvalidArgument(format!(
                    "dense write is missing a buffer for attribute {:?}",
                    attribute.name()
                )));
            }
            Some(buffer) if buffer.data.len() as u64 != expected => {
                return Err(Error::InvalidArgument(format!(
                    "buffer for attribute {:?} holds {} bytes, {expected} required",
                    attribute.name(),
                    buffer.data.len()
                )));
            }
            Some(_) => {}
        }
    }

    let timestamp = query.fragment_timestamp().unwrap_or_else(now_ms);
    let name = FragmentName::generate(timestamp);
    let fragment_uri = snapshot.uri().join(&name.dirname());
    ctx.vfs.create_dir(&fragment_uri)?;

    match write_fragment(ctx, query, &fragment_uri, name, &subarray) {
        Ok(()) => {
            query.set_fragment_uri(fragment_uri);
            Ok(())
        }
        Err(err) => {
            // The partial directory is invisible without its finalization
            // marker; removing it is best-effort tidiness.
            let _ = ctx.vfs.remove_dir(&fragment_uri);
            Err(err)
        }
    }
}

fn write_fragment(
    ctx: &QueryContext,
    query: &Query,
    fragment_uri: &Uri,
    name: FragmentName,
    subarray: &[[i64; 2]],
) -> Result<()> {
    let schema = query.snapshot().schema().clone();
    let tiles = dense::tiles(subarray, &schema.domain(), &schema.tile_extents());

    let mut attributes = BTreeMap::new();
    let mut fragment_size = 0;
    for attribute in schema.attributes() {
        let cell_size = attribute.cell_size();
        let buffer = &query.buffers()[attribute.name()];

        // Gather tile payloads on the writer pool, then append them in
        // tile order so offsets are deterministic.
        let payloads: Vec<Vec<u8>> = ctx.writer_pool.install(|| {
            tiles
                .par_iter()
                .map(|tile_region| {
                    ctx.check_cancelled()?;
                    let mut payload =
                        vec![0; (dense::cell_num(tile_region) * cell_size) as usize];
                    dense::copy_region(
                        &buffer.data,
                        subarray,
                        &mut payload,
                        tile_region,
                        tile_region,
                        cell_size,
                    );
                    Ok(payload)
                })
                .collect::<Result<_>>()
        })?;

        let file = fragment_uri.join(&format!("{}{FILE_SUFFIX}", attribute.name()));
        let mut offsets = Vec::with_capacity(payloads.len());
        let mut sizes = Vec::with_capacity(payloads.len());
        let mut offset = 0;
        for payload in &payloads {
            ctx.check_cancelled()?;
            ctx.vfs.write(&file, payload)?;
            offsets.push(offset);
            sizes.push(payload.len() as u64);
            offset += payload.len() as u64;
        }
        fragment_size += offset;
        attributes.insert(attribute.name().to_string(), AttributeTileIndex { offsets, sizes });
    }

    // Writing the metadata document finalizes the fragment.
    let metadata = FragmentMetadata::new(
        fragment_uri.clone(),
        name,
        true,
        subarray.to_vec(),
        subarray.to_vec(),
        dense::cell_num(subarray),
        fragment_size,
        attributes,
    );
    metadata.store(&ctx.vfs)
}
