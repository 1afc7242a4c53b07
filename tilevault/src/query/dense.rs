//! Geometry over dense, row-major cell regions.
//!
//! A region is an inclusive `[min, max]` range per dimension. Buffers over a
//! region hold its cells in row-major order.

/// The number of cells in a region.
pub(crate) fn cell_num(region: &[[i64; 2]]) -> u64 {
    region
        .iter()
        .map(|range| (range[1] - range[0] + 1) as u64)
        .product()
}

/// The intersection of two regions, if non-empty.
pub(crate) fn intersect(a: &[[i64; 2]], b: &[[i64; 2]]) -> Option<Vec<[i64; 2]>> {
    let mut out = Vec::with_capacity(a.len());
    for (ra, rb) in a.iter().zip(b) {
        let lo = ra[0].max(rb[0]);
        let hi = ra[1].min(rb[1]);
        if lo > hi {
            return None;
        }
        out.push([lo, hi]);
    }
    Some(out)
}

/// The bounding box of two regions.
pub(crate) fn union_bbox(a: &[[i64; 2]], b: &[[i64; 2]]) -> Vec<[i64; 2]> {
    a.iter()
        .zip(b)
        .map(|(ra, rb)| [ra[0].min(rb[0]), ra[1].max(rb[1])])
        .collect()
}

/// The row-major cell offset of `coord` within `region`.
fn row_major_offset(region: &[[i64; 2]], coord: &[i64]) -> u64 {
    region.iter().zip(coord).fold(0, |offset, (range, c)| {
        offset * (range[1] - range[0] + 1) as u64 + (c - range[0]) as u64
    })
}

/// The tile subregions of `region` in row-major tile order.
///
/// `region` must start on tile boundaries of the array grid defined by
/// `domain` and `extents`; edge tiles are clipped to the domain and region.
pub(crate) fn tiles(
    region: &[[i64; 2]],
    domain: &[[i64; 2]],
    extents: &[u64],
) -> Vec<Vec<[i64; 2]>> {
    let dim_num = region.len();
    let tile_ranges: Vec<[i64; 2]> = region
        .iter()
        .zip(domain)
        .zip(extents)
        .map(|((range, dom), extent)| {
            let extent = *extent as i64;
            [(range[0] - dom[0]) / extent, (range[1] - dom[0]) / extent]
        })
        .collect();

    let mut out = Vec::new();
    let mut tile: Vec<i64> = tile_ranges.iter().map(|range| range[0]).collect();
    'next: loop {
        let subregion: Vec<[i64; 2]> = tile
            .iter()
            .zip(domain)
            .zip(extents)
            .zip(region)
            .map(|(((t, dom), extent), range)| {
                let extent = *extent as i64;
                let lo = dom[0] + t * extent;
                let hi = (lo + extent - 1).min(range[1]);
                [lo.max(range[0]), hi]
            })
            .collect();
        out.push(subregion);

        let mut d = dim_num;
        loop {
            if d == 0 {
                break 'next;
            }
            d -= 1;
            tile[d] += 1;
            if tile[d] <= tile_ranges[d][1] {
                continue 'next;
            }
            tile[d] = tile_ranges[d][0];
        }
    }
    out
}

/// Copy the cells of `overlap` from `src` (row-major over `src_region`)
/// into `dst` (row-major over `dst_region`).
///
/// `overlap` must be contained in both regions.
pub(crate) fn copy_region(
    src: &[u8],
    src_region: &[[i64; 2]],
    dst: &mut [u8],
    dst_region: &[[i64; 2]],
    overlap: &[[i64; 2]],
    cell_size: u64,
) {
    let dim_num = overlap.len();
    let cell_size = cell_size as usize;
    let run = (overlap[dim_num - 1][1] - overlap[dim_num - 1][0] + 1) as usize * cell_size;
    let mut coord: Vec<i64> = overlap.iter().map(|range| range[0]).collect();
    loop {
        let src_offset = row_major_offset(src_region, &coord) as usize * cell_size;
        let dst_offset = row_major_offset(dst_region, &coord) as usize * cell_size;
        dst[dst_offset..dst_offset + run].copy_from_slice(&src[src_offset..src_offset + run]);

        let mut d = dim_num - 1;
        loop {
            if d == 0 {
                return;
            }
            d -= 1;
            coord[d] += 1;
            if coord[d] <= overlap[d][1] {
                break;
            }
            coord[d] = overlap[d][0];
        }
    }
}
