use rayon::prelude::*;

use crate::constants::FILE_SUFFIX;
use crate::error::{Error, Result};
use crate::query::context::QueryContext;
use crate::query::dense;
use crate::query::Query;
use crate::storage::{Bytes, Uri};
use crate::tile_cache::TileKey;

/// One tile of one fragment overlapping the query subarray.
struct TileFetch {
    fragment: usize,
    tile_index: usize,
    tile_region: Vec<[i64; 2]>,
    overlap: Vec<[i64; 2]>,
}

/// Read a tile through the tile cache.
fn read_tile(ctx: &QueryContext, file: &Uri, offset: u64, nbytes: u64) -> Result<Bytes> {
    let key = TileKey::new(file.clone(), offset);
    if let Some(bytes) = ctx.tile_cache.read(&key, nbytes)? {
        return Ok(bytes);
    }
    let bytes = ctx.vfs.read(file, offset, nbytes)?;
    ctx.tile_cache.insert(key, bytes.clone());
    Ok(bytes)
}

/// Execute a dense read: overlay the visible fragments in snapshot order
/// onto a fill-initialized result, one attribute at a time.
pub(crate) fn read(ctx: &QueryContext, query: &mut Query) -> Result<()> {
    let snapshot = query.snapshot().clone();
    let schema = snapshot.schema().clone();
    if !schema.is_dense() {
        return Err(Error::Unsupported(
            "sparse query execution is not available in this engine".into(),
        ));
    }
    let subarray = query.subarray();
    schema.check_subarray(&subarray)?;
    let domain = schema.domain();
    let extents = schema.tile_extents();

    // The fetch plan is shared by all attributes: every tile of every
    // visible fragment that overlaps the subarray, in fragment application
    // order.
    let mut plan = Vec::new();
    for (fragment_index, fragment) in snapshot.fragments().iter().enumerate() {
        if !fragment.dense() {
            return Err(Error::Unsupported(
                "sparse fragments require an external executor".into(),
            ));
        }
        if dense::intersect(fragment.region(), &subarray).is_none() {
            continue;
        }
        for (tile_index, tile_region) in
            dense::tiles(fragment.region(), &domain, &extents).into_iter().enumerate()
        {
            if let Some(overlap) = dense::intersect(&tile_region, &subarray) {
                plan.push(TileFetch {
                    fragment: fragment_index,
                    tile_index,
                    tile_region,
                    overlap,
                });
            }
        }
    }

    let names: Vec<String> = query.buffers().keys().cloned().collect();
    for name in names {
        let attribute = schema
            .attribute(&name)
            .ok_or_else(|| Error::InvalidArgument(format!("array has no attribute {name:?}")))?
            .clone();
        let cell_size = attribute.cell_size();
        let needed = dense::cell_num(&subarray) * cell_size;

        // Fetch every overlapping tile on the reader pool; cancellation is
        // observed at tile boundaries.
        let tiles: Vec<Bytes> = ctx.reader_pool.install(|| {
            plan.par_iter()
                .map(|fetch| {
                    ctx.check_cancelled()?;
                    let fragment = &snapshot.fragments()[fetch.fragment];
                    let index = fragment.attribute_tiles(&name).ok_or_else(|| {
                        Error::InvalidArgument(format!(
                            "fragment {} has no attribute {name:?}",
                            fragment.uri()
                        ))
                    })?;
                    let file = fragment.uri().join(&format!("{name}{FILE_SUFFIX}"));
                    read_tile(ctx, &file, index.offsets[fetch.tile_index], index.sizes[fetch.tile_index])
                })
                .collect::<Result<_>>()
        })?;

        let buffer = query
            .buffers_mut()
            .get_mut(&name)
            .expect("buffer names were collected from the map");
        if (buffer.data.len() as u64) < needed {
            return Err(Error::InvalidArgument(format!(
                "buffer for attribute {name:?} holds {} bytes, {needed} required",
                buffer.data.len()
            )));
        }
        let out = &mut buffer.data[..needed as usize];

        // Cells no fragment covers read back as the empty sentinel.
        let empty = attribute.datatype().empty_value();
        for value in out.chunks_exact_mut(empty.len()) {
            value.copy_from_slice(&empty);
        }

        // Overlay in fragment order; later fragments win.
        for (fetch, bytes) in plan.iter().zip(&tiles) {
            ctx.check_cancelled()?;
            dense::copy_region(
                bytes,
                &fetch.tile_region,
                out,
                &subarray,
                &fetch.overlap,
                cell_size,
            );
        }
        buffer.size = needed;
    }

    Ok(())
}
