//! The dense cell-range merger.
//!
//! Walks the dense output tiles of a sub-region in the query layout and
//! produces, per tile, an ordered list of cell runs attributed to the
//! newest fragment covering each cell, with explicit fill runs where no
//! fragment wrote and single-cell splices where a newer sparse fragment
//! overrides a dense one.
//!
//! Runs are contiguous in the tile's physical cell order. When the query
//! traverses cells the same way the array stores them, fragments
//! contribute whole slabs and a heap merge resolves overlaps in
//! O((runs + fragments) log fragments); when the orders differ, every run
//! degenerates to a single cell and coverage is resolved by direct
//! containment instead.

use std::collections::BinaryHeap;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tessera_core::domain::{region_contains_point, region_intersection};
use tessera_core::{
    ArraySchema, CellOrder, DenseCoord, Domain, FragmentMetadata, Layout, NDRange,
};
use tessera_error::{TesseraExpect, TesseraResult};

use crate::locator::TileSet;
use crate::CellRange;

/// A run of cells along the fastest dimension of the traversal, confined
/// to one tile.
#[derive(Debug, Clone)]
pub(crate) struct CellSlab<T> {
    pub tile_coords: Vec<u64>,
    pub start: Vec<T>,
    pub num: u64,
    pub pos_start: u64,
    pub pos_end: u64,
}

/// Iterates the cell slabs of a region in row- or col-major order,
/// breaking at tile boundaries. With `unit_cells`, every slab is a single
/// cell (used when the traversal order differs from the cell order, where
/// longer runs would not be contiguous in tile storage).
pub(crate) struct CellSlabIter<'a, T: DenseCoord> {
    domain: &'a Domain<T>,
    region: NDRange<T>,
    order: CellOrder,
    unit_cells: bool,
    cur: Option<Vec<T>>,
}

impl<'a, T: DenseCoord> CellSlabIter<'a, T> {
    pub fn new(domain: &'a Domain<T>, region: NDRange<T>, order: CellOrder) -> Self {
        let unit_cells = order != domain.cell_order();
        let cur = Some(region.iter().map(|r| r.lo).collect());
        Self {
            domain,
            region,
            order,
            unit_cells,
            cur,
        }
    }

    fn fastest_dim(&self) -> usize {
        match self.order {
            CellOrder::RowMajor => self.region.len() - 1,
            CellOrder::ColMajor => 0,
        }
    }
}

impl<T: DenseCoord> Iterator for CellSlabIter<'_, T> {
    type Item = CellSlab<T>;

    fn next(&mut self) -> Option<Self::Item> {
        let cur = self.cur.take()?;
        let ff = self.fastest_dim();
        let dims = self.domain.dims();
        let extents = self
            .domain
            .tile_extents()
            .tessera_expect("dense domains carry tile extents");

        let idx = cur[ff].index_from(dims[ff].range.lo);
        let left_in_tile = extents[ff].extent_cells() - idx % extents[ff].extent_cells();
        let left_in_region = self.region[ff].hi.index_from(cur[ff]) + 1;
        let num = if self.unit_cells {
            1
        } else {
            left_in_tile.min(left_in_region)
        };

        let mut tile_coords = Vec::new();
        self.domain.tile_coords_of(&cur, &mut tile_coords);
        let pos_start = self.domain.cell_pos_in_tile(&cur);
        let slab = CellSlab {
            tile_coords,
            start: cur.clone(),
            num,
            pos_start,
            pos_end: pos_start + num - 1,
        };

        // Advance past the slab, carrying into slower dimensions at the
        // region edge.
        let mut next = cur;
        if T::offset_by(next[ff], num - 1) == self.region[ff].hi {
            next[ff] = self.region[ff].lo;
            let n = self.region.len();
            let carry: Vec<usize> = match self.order {
                CellOrder::RowMajor => (0..n - 1).rev().collect(),
                CellOrder::ColMajor => (1..n).collect(),
            };
            let mut advanced = false;
            for d in carry {
                if next[d] < self.region[d].hi {
                    next[d] = next[d].successor();
                    advanced = true;
                    break;
                }
                next[d] = self.region[d].lo;
            }
            self.cur = advanced.then_some(next);
        } else {
            next[ff] = T::offset_by(next[ff], num);
            self.cur = Some(next);
        }

        Some(slab)
    }
}

/// Walks a region's slabs in the query layout: plain row/col traversal, or
/// tile-by-tile in tile order for global (and unordered) reads.
pub(crate) enum SlabWalk<'a, T: DenseCoord> {
    Plain(CellSlabIter<'a, T>),
    Global {
        domain: &'a Domain<T>,
        region: NDRange<T>,
        tile_grid: Vec<(u64, u64)>,
        tile_cursor: Option<Vec<u64>>,
        inner: Option<CellSlabIter<'a, T>>,
    },
}

impl<'a, T: DenseCoord> SlabWalk<'a, T> {
    pub fn new(domain: &'a Domain<T>, region: NDRange<T>, layout: Layout) -> Self {
        match layout {
            Layout::RowMajor => Self::Plain(CellSlabIter::new(domain, region, CellOrder::RowMajor)),
            Layout::ColMajor => Self::Plain(CellSlabIter::new(domain, region, CellOrder::ColMajor)),
            Layout::GlobalOrder | Layout::Unordered => {
                let tile_grid = domain.tile_domain(&region);
                let tile_cursor = Some(tile_grid.iter().map(|&(lo, _)| lo).collect());
                Self::Global {
                    domain,
                    region,
                    tile_grid,
                    tile_cursor,
                    inner: None,
                }
            }
        }
    }

    /// The order cells vary in within one slab.
    pub fn slab_order(&self) -> CellOrder {
        match self {
            Self::Plain(iter) => iter.order,
            Self::Global { domain, .. } => domain.cell_order(),
        }
    }
}

impl<T: DenseCoord> Iterator for SlabWalk<'_, T> {
    type Item = CellSlab<T>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Self::Plain(iter) => iter.next(),
            Self::Global {
                domain,
                region,
                tile_grid,
                tile_cursor,
                inner,
            } => loop {
                if let Some(slab) = inner.as_mut().and_then(Iterator::next) {
                    return Some(slab);
                }
                let cursor = tile_cursor.as_mut()?;
                let tile_region = domain.tile_region(cursor);
                let next_inner = region_intersection(&tile_region, region)
                    .map(|r| CellSlabIter::new(domain, r, domain.cell_order()));
                let more = tessera_core::domain::next_grid_coords(
                    cursor,
                    tile_grid,
                    domain.tile_order(),
                );
                if !more {
                    *tile_cursor = None;
                }
                *inner = next_inner;
                if inner.is_none() && tile_cursor.is_none() {
                    return None;
                }
            },
        }
    }
}

/// One merged run: a fragment (or fill) covering contiguous positions of a
/// visited tile.
#[derive(Debug, Clone)]
struct MergeEntry {
    fragment: Option<usize>,
    tile: usize,
    start: u64,
    end: u64,
}

/// Heap entries pop smallest start first; the newer fragment wins a tie so
/// it pre-empts older ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HeapEntry {
    start: u64,
    end: u64,
    fragment: usize,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .start
            .cmp(&self.start)
            .then(self.fragment.cmp(&other.fragment))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Per-fragment slab iterators over one output tile, with their current
/// heads.
struct TileFragState<'a, T: DenseCoord> {
    iters: Vec<Option<CellSlabIter<'a, T>>>,
    heads: Vec<Option<(u64, u64)>>,
}

impl<'a, T: DenseCoord> TileFragState<'a, T> {
    fn new(
        domain: &'a Domain<T>,
        fragments: &[Arc<FragmentMetadata<T>>],
        tile_region: &NDRange<T>,
        query_region: &NDRange<T>,
        order: CellOrder,
    ) -> Self {
        let mut iters = Vec::with_capacity(fragments.len());
        let mut heads = Vec::with_capacity(fragments.len());
        for fragment in fragments {
            let iter = if fragment.is_dense() {
                region_intersection(tile_region, query_region)
                    .and_then(|r| region_intersection(&r, fragment.non_empty_domain()))
                    .map(|r| CellSlabIter::new(domain, r, order))
            } else {
                None
            };
            iters.push(iter);
            heads.push(None);
        }
        let mut state = Self { iters, heads };
        for f in 0..fragments.len() {
            state.advance(f);
        }
        state
    }

    fn advance(&mut self, f: usize) {
        self.heads[f] = self.iters[f]
            .as_mut()
            .and_then(Iterator::next)
            .map(|s| (s.pos_start, s.pos_end));
    }
}

/// Merge fragment runs over `[start, end]` of one tile, newest fragment
/// winning, padding gaps with fill runs.
fn merge_target<T: DenseCoord>(
    state: &mut TileFragState<'_, T>,
    tile: usize,
    mut start: u64,
    end: u64,
    out: &mut Vec<MergeEntry>,
) {
    let mut pq: BinaryHeap<HeapEntry> = state
        .heads
        .iter()
        .enumerate()
        .filter_map(|(f, head)| {
            head.map(|(s, e)| HeapEntry {
                start: s,
                end: e,
                fragment: f,
            })
        })
        .collect();

    while let Some(mut popped) = pq.pop() {
        // Stale range entirely before the target: fetch the next run.
        if popped.end < start {
            state.advance(popped.fragment);
            if let Some((s, e)) = state.heads[popped.fragment] {
                pq.push(HeapEntry {
                    start: s,
                    end: e,
                    fragment: popped.fragment,
                });
            }
            continue;
        }

        // Nothing else can cover the target: pad and stop.
        if popped.start > end {
            out.push(MergeEntry {
                fragment: None,
                tile,
                start,
                end,
            });
            return;
        }

        if popped.start > start {
            let gap_end = end.min(popped.start - 1);
            out.push(MergeEntry {
                fragment: None,
                tile,
                start,
                end: gap_end,
            });
            start = gap_end + 1;
            if start > end {
                return;
            }
        }

        // Drop older runs fully shadowed by the popped one.
        while let Some(&top) = pq.peek() {
            if popped.fragment > top.fragment
                && popped.start <= top.start
                && popped.end >= top.end
            {
                pq.pop();
            } else {
                break;
            }
        }

        // A newer run begins inside the popped one: emit the prefix and
        // re-queue the remainder.
        if let Some(&top) = pq.peek() {
            if top.start <= end && top.start > popped.start && top.start <= popped.end {
                out.push(MergeEntry {
                    fragment: Some(popped.fragment),
                    tile,
                    start,
                    end: top.start - 1,
                });
                start = top.start;
                if start > end {
                    return;
                }
                popped.start = top.start;
                pq.push(popped);
                continue;
            }
        }

        let run_end = end.min(popped.end);
        out.push(MergeEntry {
            fragment: Some(popped.fragment),
            tile,
            start,
            end: run_end,
        });
        start = run_end + 1;
        if run_end == popped.end {
            state.advance(popped.fragment);
            if let Some((s, e)) = state.heads[popped.fragment] {
                pq.push(HeapEntry {
                    start: s,
                    end: e,
                    fragment: popped.fragment,
                });
            }
        }
        if start > end {
            return;
        }
    }

    if start <= end {
        out.push(MergeEntry {
            fragment: None,
            tile,
            start,
            end,
        });
    }
}

/// A sparse coordinate that may override a dense run.
#[derive(Debug, Clone)]
pub(crate) struct SparseOverride {
    pub tile_coords: Vec<u64>,
    pub dense_pos: u64,
    pub fragment: usize,
    pub sparse_tile: usize,
    pub sparse_pos: u64,
}

/// Compute the ordered cell ranges of one dense range, splicing sparse
/// overrides, interning the contributing dense tiles into `set`.
pub(crate) fn compute_dense_ranges<T: DenseCoord>(
    schema: &ArraySchema<T>,
    fragments: &[Arc<FragmentMetadata<T>>],
    region: &NDRange<T>,
    layout: Layout,
    overrides: &[SparseOverride],
    set: &mut TileSet,
    out: &mut Vec<CellRange>,
) -> TesseraResult<()> {
    let domain = schema.domain();
    let unit_mode = matches!(layout, Layout::RowMajor | Layout::ColMajor)
        && layout.effective_order(domain.cell_order()) != domain.cell_order();

    let mut visited: Vec<Vec<u64>> = Vec::new();
    let mut visited_map: FxHashMap<Vec<u64>, usize> = FxHashMap::default();
    let mut frag_states: Vec<Option<TileFragState<'_, T>>> = Vec::new();
    let mut entries: Vec<MergeEntry> = Vec::new();

    let walk = SlabWalk::new(domain, region.clone(), layout);
    let order = walk.slab_order();
    for slab in walk {
        let vidx = match visited_map.get(&slab.tile_coords) {
            Some(&v) => v,
            None => {
                let v = visited.len();
                visited_map.insert(slab.tile_coords.clone(), v);
                visited.push(slab.tile_coords.clone());
                let state = (!unit_mode).then(|| {
                    TileFragState::new(
                        domain,
                        fragments,
                        &domain.tile_region(&slab.tile_coords),
                        region,
                        order,
                    )
                });
                frag_states.push(state);
                v
            }
        };

        if unit_mode {
            let winner = fragments
                .iter()
                .enumerate()
                .rev()
                .find(|(_, f)| {
                    f.is_dense() && region_contains_point(f.non_empty_domain(), &slab.start)
                })
                .map(|(f, _)| f);
            entries.push(MergeEntry {
                fragment: winner,
                tile: vidx,
                start: slab.pos_start,
                end: slab.pos_end,
            });
        } else {
            let state = frag_states[vidx]
                .as_mut()
                .tessera_expect("merge state exists outside unit mode");
            merge_target(state, vidx, slab.pos_start, slab.pos_end, &mut entries);
        }
    }

    convert_entries(&entries, &visited, overrides, fragments, set, out)
}

/// Coalesce merge entries, splice sparse overrides and intern the dense
/// tiles each surviving run reads from.
fn convert_entries<T: DenseCoord>(
    entries: &[MergeEntry],
    visited: &[Vec<u64>],
    overrides: &[SparseOverride],
    fragments: &[Arc<FragmentMetadata<T>>],
    set: &mut TileSet,
    out: &mut Vec<CellRange>,
) -> TesseraResult<()> {
    let mut iter = entries.iter();
    let Some(first) = iter.next() else {
        return Ok(());
    };

    let mut cursor = 0usize;
    let mut arena_of = |set: &mut TileSet, e: &MergeEntry| -> TesseraResult<Option<usize>> {
        e.fragment
            .map(|f| {
                let tile_idx = fragments[f].tile_pos(&visited[e.tile])?;
                Ok(set.intern(f, tile_idx, false))
            })
            .transpose()
    };

    let mut cur_arena = arena_of(set, first)?;
    let mut cur_tile = first.tile;
    let (mut start, mut end) = (first.start, first.end);

    for e in iter {
        let arena = arena_of(set, e)?;
        if arena == cur_arena && e.tile == cur_tile && e.start == end + 1 {
            end = e.end;
            continue;
        }
        splice_and_flush(
            cur_arena,
            &visited[cur_tile],
            start,
            end,
            overrides,
            &mut cursor,
            set,
            out,
        );
        cur_arena = arena;
        cur_tile = e.tile;
        start = e.start;
        end = e.end;
    }
    splice_and_flush(
        cur_arena,
        &visited[cur_tile],
        start,
        end,
        overrides,
        &mut cursor,
        set,
        out,
    );
    Ok(())
}

/// Emit `[start, end]` of a tile, breaking it around any sparse override
/// that lands inside and comes from a newer fragment than the dense run.
#[allow(clippy::too_many_arguments)]
fn splice_and_flush(
    dense_tile: Option<usize>,
    tile_coords: &[u64],
    mut start: u64,
    end: u64,
    overrides: &[SparseOverride],
    cursor: &mut usize,
    set: &TileSet,
    out: &mut Vec<CellRange>,
) {
    while *cursor < overrides.len() {
        let ov = &overrides[*cursor];
        if ov.tile_coords != tile_coords || ov.dense_pos < start || ov.dense_pos > end {
            break;
        }
        if let Some(t) = dense_tile {
            if ov.fragment < set.tiles[t].fragment {
                // An older sparse write is shadowed by the dense run.
                *cursor += 1;
                continue;
            }
        }
        if ov.dense_pos > start {
            out.push(CellRange::new(dense_tile, start, ov.dense_pos - 1));
        }
        out.push(CellRange::new(Some(ov.sparse_tile), ov.sparse_pos, ov.sparse_pos));
        start = ov.dense_pos + 1;
        *cursor += 1;
    }
    if start <= end {
        out.push(CellRange::new(dense_tile, start, end));
    }
}
