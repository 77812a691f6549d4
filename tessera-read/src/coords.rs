//! The coordinate resolver.
//!
//! Extracts in-region coordinates from decoded sparse tiles, orders them by
//! the query layout and deduplicates equal coordinates keeping the newest
//! fragment. Coordinates refer to their tile by arena index; dedup
//! invalidates entries in place so indices stay stable.

use std::cmp::Ordering;

use rayon::prelude::*;
use tessera_core::domain::region_contains_point;
use tessera_core::{CellOrder, CoordType, Domain, Layout, NDRange, COORDS};

use crate::locator::TileSet;
use crate::CellRange;

/// One result coordinate: an arena tile plus a cell position within it.
#[derive(Debug, Clone, Copy)]
pub struct ResultCoord {
    pub tile: usize,
    pub pos: u64,
    /// Start index of this coordinate's tile coordinates in the side
    /// buffer, when one was computed.
    pub tc: usize,
    pub valid: bool,
}

/// Decoded coordinate tuples per arena tile.
#[derive(Debug)]
pub struct CoordData<T> {
    per_tile: Vec<Vec<T>>,
    dim_num: usize,
}

impl<T: CoordType> CoordData<T> {
    /// Pull the decoded coordinate values out of every tile in the arena.
    pub fn from_set(set: &TileSet, dim_num: usize) -> Self {
        let per_tile = set
            .tiles
            .iter()
            .map(|t| {
                t.attr_tiles
                    .get(COORDS)
                    .map(|pair| pair.fixed.typed_vec::<T>())
                    .unwrap_or_default()
            })
            .collect();
        Self { per_tile, dim_num }
    }

    pub fn coords(&self, c: &ResultCoord) -> &[T] {
        let d = self.dim_num;
        &self.per_tile[c.tile][c.pos as usize * d..(c.pos as usize + 1) * d]
    }

    pub fn dim_num(&self) -> usize {
        self.dim_num
    }
}

/// Gather the coordinates of range `r` from its overlapping tiles: every
/// cell of a fully covered tile, the in-region cells otherwise.
pub fn gather_range_coords<T: CoordType>(
    set: &TileSet,
    data: &CoordData<T>,
    range: &NDRange<T>,
    r: usize,
) -> Vec<ResultCoord> {
    let mut out = Vec::new();
    let d = data.dim_num;
    for &(t, full_overlap) in &set.range_tiles[r] {
        let coords = &data.per_tile[t];
        let cell_num = (coords.len() / d) as u64;
        if full_overlap {
            out.extend((0..cell_num).map(|pos| ResultCoord {
                tile: t,
                pos,
                tc: 0,
                valid: true,
            }));
        } else {
            out.extend(
                (0..cell_num)
                    .filter(|&pos| {
                        region_contains_point(range, &coords[pos as usize * d..][..d])
                    })
                    .map(|pos| ResultCoord {
                        tile: t,
                        pos,
                        tc: 0,
                        valid: true,
                    }),
            );
        }
    }
    out
}

/// Precompute each coordinate's tile coordinates into one contiguous
/// buffer, used as the primary key of the global-order comparator. Empty
/// when the domain has no tile extents.
pub fn compute_tile_coords<T: CoordType>(
    domain: &Domain<T>,
    data: &CoordData<T>,
    coords: &mut [ResultCoord],
) -> Vec<u64> {
    if domain.tile_extents().is_none() {
        return Vec::new();
    }
    let d = data.dim_num;
    let mut buffer = Vec::with_capacity(coords.len() * d);
    let mut scratch = Vec::with_capacity(d);
    for c in coords.iter_mut() {
        domain.tile_coords_of(data.coords(c), &mut scratch);
        c.tc = buffer.len();
        buffer.extend_from_slice(&scratch);
    }
    buffer
}

fn cmp_tuples<T: CoordType>(a: &[T], b: &[T], order: CellOrder) -> Ordering {
    let dims = a.len();
    for i in 0..dims {
        let d = match order {
            CellOrder::RowMajor => i,
            CellOrder::ColMajor => dims - 1 - i,
        };
        match a[d].partial_cmp(&b[d]).unwrap_or(Ordering::Equal) {
            Ordering::Equal => {}
            other => return other,
        }
    }
    Ordering::Equal
}

fn cmp_grid(a: &[u64], b: &[u64], order: CellOrder) -> Ordering {
    match order {
        CellOrder::RowMajor => a.cmp(b),
        CellOrder::ColMajor => a.iter().rev().cmp(b.iter().rev()),
    }
}

/// Sort coordinates by the query layout.
///
/// The comparator is total and deterministic: equal coordinate tuples are
/// ordered newest fragment first, then by cell position, so dedup and the
/// downstream merge see a reproducible order.
pub fn sort_coords<T: CoordType>(
    domain: &Domain<T>,
    set: &TileSet,
    data: &CoordData<T>,
    tile_coords: &[u64],
    layout: Layout,
    coords: &mut [ResultCoord],
) {
    let d = data.dim_num;
    let order = layout.effective_order(domain.cell_order());
    coords.par_sort_unstable_by(|a, b| {
        let primary = if layout == Layout::GlobalOrder && !tile_coords.is_empty() {
            cmp_grid(
                &tile_coords[a.tc..a.tc + d],
                &tile_coords[b.tc..b.tc + d],
                domain.tile_order(),
            )
            .then_with(|| cmp_tuples(data.coords(a), data.coords(b), domain.cell_order()))
        } else {
            cmp_tuples(data.coords(a), data.coords(b), order)
        };
        primary
            .then_with(|| {
                // Newest fragment first among equal coordinates.
                set.tiles[b.tile].fragment.cmp(&set.tiles[a.tile].fragment)
            })
            .then_with(|| a.pos.cmp(&b.pos))
    });
}

/// Invalidate duplicate coordinates, keeping the newest fragment's entry.
/// Entries are never removed, so positions handed out earlier stay valid.
pub fn dedup_coords<T: CoordType>(set: &TileSet, data: &CoordData<T>, coords: &mut [ResultCoord]) {
    let Some(mut i) = coords.iter().position(|c| c.valid) else {
        return;
    };
    let mut k = i + 1;
    while k < coords.len() {
        let Some(j) = (k..coords.len()).find(|&j| coords[j].valid) else {
            break;
        };
        if data.coords(&coords[i]) == data.coords(&coords[j]) {
            if set.tiles[coords[i].tile].fragment < set.tiles[coords[j].tile].fragment {
                coords[i].valid = false;
                i = j;
            } else {
                coords[j].valid = false;
            }
        } else {
            i = j;
        }
        k = j + 1;
    }
}

/// Collapse ordered coordinates into maximal per-tile cell ranges.
pub fn compute_cell_ranges(coords: &[ResultCoord], out: &mut Vec<CellRange>) {
    let mut valid = coords.iter().filter(|c| c.valid);
    let Some(first) = valid.next() else {
        return;
    };
    let (mut tile, mut start, mut end) = (first.tile, first.pos, first.pos);
    for c in valid {
        if c.tile == tile && c.pos == end + 1 {
            end = c.pos;
        } else {
            out.push(CellRange::new(Some(tile), start, end));
            tile = c.tile;
            start = c.pos;
            end = c.pos;
        }
    }
    out.push(CellRange::new(Some(tile), start, end));
}
