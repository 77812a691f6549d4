//! Tile location.
//!
//! Finds the `(fragment, tile)` pairs that may contribute to the current
//! sub-region and interns them in a query-owned arena, so that coordinates
//! and cell ranges can refer to tiles by index instead of by pointer.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use tessera_core::domain::{region_contains, region_intersects};
use tessera_core::{CoordType, FragmentMetadata, Subarray, TilePair};

/// One overlapping tile: its identity within a fragment plus the attribute
/// streams fetched for it so far.
#[derive(Debug)]
pub struct ResultTile {
    pub fragment: usize,
    pub tile_idx: u64,
    pub full_overlap: bool,
    pub attr_tiles: FxHashMap<String, TilePair>,
}

impl ResultTile {
    fn new(fragment: usize, tile_idx: u64, full_overlap: bool) -> Self {
        Self {
            fragment,
            tile_idx,
            full_overlap,
            attr_tiles: FxHashMap::default(),
        }
    }
}

/// The arena of overlapping tiles for one sub-region.
#[derive(Debug, Default)]
pub struct TileSet {
    pub tiles: Vec<ResultTile>,
    map: FxHashMap<(usize, u64), usize>,
    /// Arena indices contributing to each range, in fragment order, with
    /// the tile's overlap kind for that particular range.
    pub range_tiles: Vec<Vec<(usize, bool)>>,
    /// Whether every tile of a range comes from one fragment, which makes
    /// its dedup pass unnecessary.
    pub single_fragment: Vec<bool>,
    first_fragment: Vec<Option<usize>>,
}

impl TileSet {
    pub fn new(range_num: usize) -> Self {
        Self {
            tiles: Vec::new(),
            map: FxHashMap::default(),
            range_tiles: vec![Vec::new(); range_num],
            single_fragment: vec![true; range_num],
            first_fragment: vec![None; range_num],
        }
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    pub fn get(&self, fragment: usize, tile_idx: u64) -> Option<usize> {
        self.map.get(&(fragment, tile_idx)).copied()
    }

    /// Intern a tile contributing to `range`, coalescing duplicates across
    /// ranges. `full_overlap` describes this range's view of the tile.
    pub fn insert(
        &mut self,
        fragment: usize,
        tile_idx: u64,
        full_overlap: bool,
        range: usize,
    ) -> usize {
        let idx = self.intern(fragment, tile_idx, full_overlap);
        self.range_tiles[range].push((idx, full_overlap));
        match self.first_fragment[range] {
            None => self.first_fragment[range] = Some(fragment),
            Some(first) if first != fragment => self.single_fragment[range] = false,
            Some(_) => {}
        }
        idx
    }

    /// Intern a tile without range bookkeeping (dense merger output).
    pub fn intern(&mut self, fragment: usize, tile_idx: u64, full_overlap: bool) -> usize {
        *self.map.entry((fragment, tile_idx)).or_insert_with(|| {
            self.tiles.push(ResultTile::new(fragment, tile_idx, full_overlap));
            self.tiles.len() - 1
        })
    }

    /// Drop one attribute's tiles across the arena to cap memory.
    pub fn clear_attr(&mut self, attr: &str) {
        for tile in &mut self.tiles {
            tile.attr_tiles.remove(attr);
        }
    }
}

/// Locate the sparse-fragment tiles overlapping each range of `subarray`.
///
/// Dense-fragment tiles are not located here; they materialize from the
/// dense merger's output, which walks fragment domains directly.
pub fn locate_sparse_tiles<T: CoordType>(
    subarray: &Subarray<T>,
    fragments: &[Arc<FragmentMetadata<T>>],
) -> TileSet {
    let range_num = subarray.range_num() as usize;
    let mut set = TileSet::new(range_num);
    for r in 0..range_num {
        let range = subarray.range(r as u64);
        for (f, fragment) in fragments.iter().enumerate() {
            if fragment.is_dense() {
                continue;
            }
            for (j, mbr) in fragment.mbrs().iter().enumerate() {
                if region_intersects(mbr, &range) {
                    let full = region_contains(&range, mbr);
                    set.insert(f, j as u64, full, r);
                }
            }
        }
    }
    set
}

#[cfg(test)]
mod tests {
    use tessera_core::domain::{DimRange, Dimension};
    use tessera_core::{CellOrder, Domain, Layout};

    use super::*;

    fn sparse_fragment(uri: &str, mbrs: Vec<Vec<DimRange<i64>>>) -> Arc<FragmentMetadata<i64>> {
        let non_empty = mbrs
            .first()
            .cloned()
            .unwrap_or_else(|| vec![DimRange::new(1, 1)]);
        Arc::new(FragmentMetadata::sparse(uri, 1, non_empty, mbrs))
    }

    #[test]
    fn locates_and_coalesces() {
        let domain = Domain::new(
            vec![Dimension::new("x", 1i64, 100)],
            None,
            CellOrder::RowMajor,
            CellOrder::RowMajor,
        )
        .unwrap();
        let f0 = sparse_fragment("f0", vec![vec![DimRange::new(1, 10)], vec![DimRange::new(50, 60)]]);
        let f1 = sparse_fragment("f1", vec![vec![DimRange::new(5, 7)]]);

        let mut s = Subarray::new(&domain, Layout::Unordered);
        s.add_range(&domain, 0, 1, 8).unwrap();
        s.add_range(&domain, 0, 5, 55).unwrap();

        let set = locate_sparse_tiles(&s, &[f0, f1]);
        // Tile (f0, 0) overlaps both ranges but is interned once.
        assert_eq!(set.len(), 3);
        assert_eq!(set.range_tiles[0], vec![(0, false), (1, true)]);
        // (f1, 0) is also inside [5, 55], so it is full for both ranges.
        assert_eq!(set.range_tiles[1], vec![(0, false), (2, false), (1, true)]);
        assert!(!set.single_fragment[0]);
        assert!(!set.single_fragment[1]);
        // (f0, 1) MBR [50,60] only partially overlaps [5,55].
        assert!(!set.tiles[2].full_overlap);
        // (f1, 0) MBR [5,7] is inside [1,8].
        let f1_tile = set.get(1, 0).unwrap();
        assert!(set.tiles[f1_tile].full_overlap);
    }
}
