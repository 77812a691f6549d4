//! The coordinate space of an array: dimension ranges, tile extents and the
//! arithmetic that maps cells to tiles and positions.

use tessera_error::{tessera_bail, TesseraExpect, TesseraResult};

use crate::coord::{CoordType, DenseCoord};
use crate::layout::{CellOrder, Layout};

/// A closed interval along one dimension.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DimRange<T> {
    pub lo: T,
    pub hi: T,
}

impl<T: CoordType> DimRange<T> {
    pub fn new(lo: T, hi: T) -> Self {
        Self { lo, hi }
    }

    pub fn contains(&self, v: T) -> bool {
        self.lo <= v && v <= self.hi
    }

    pub fn intersects(&self, other: &Self) -> bool {
        self.lo <= other.hi && other.lo <= self.hi
    }

    pub fn contains_range(&self, other: &Self) -> bool {
        self.lo <= other.lo && other.hi <= self.hi
    }

    pub fn intersection(&self, other: &Self) -> Option<Self> {
        let lo = if self.lo < other.lo { other.lo } else { self.lo };
        let hi = if self.hi < other.hi { self.hi } else { other.hi };
        (lo <= hi).then_some(Self { lo, hi })
    }
}

/// A hyper-rectangle: one closed interval per dimension.
pub type NDRange<T> = Vec<DimRange<T>>;

/// Whether `region` contains the cell at `coords`.
pub fn region_contains_point<T: CoordType>(region: &[DimRange<T>], coords: &[T]) -> bool {
    region.iter().zip(coords).all(|(r, &c)| r.contains(c))
}

pub fn region_intersects<T: CoordType>(a: &[DimRange<T>], b: &[DimRange<T>]) -> bool {
    a.iter().zip(b).all(|(x, y)| x.intersects(y))
}

/// Whether `outer` fully contains `inner`.
pub fn region_contains<T: CoordType>(outer: &[DimRange<T>], inner: &[DimRange<T>]) -> bool {
    outer.iter().zip(inner).all(|(o, i)| o.contains_range(i))
}

pub fn region_intersection<T: CoordType>(
    a: &[DimRange<T>],
    b: &[DimRange<T>],
) -> Option<NDRange<T>> {
    a.iter().zip(b).map(|(x, y)| x.intersection(y)).collect()
}

/// A named dimension with its full coordinate range.
#[derive(Debug, Clone)]
pub struct Dimension<T> {
    pub name: String,
    pub range: DimRange<T>,
}

impl<T: CoordType> Dimension<T> {
    pub fn new(name: impl Into<String>, lo: T, hi: T) -> Self {
        Self {
            name: name.into(),
            range: DimRange::new(lo, hi),
        }
    }
}

/// The coordinate space of an array.
#[derive(Debug, Clone)]
pub struct Domain<T: CoordType> {
    dims: Vec<Dimension<T>>,
    tile_extents: Option<Vec<T>>,
    cell_order: CellOrder,
    tile_order: CellOrder,
}

impl<T: CoordType> Domain<T> {
    pub fn new(
        dims: Vec<Dimension<T>>,
        tile_extents: Option<Vec<T>>,
        cell_order: CellOrder,
        tile_order: CellOrder,
    ) -> TesseraResult<Self> {
        if dims.is_empty() {
            tessera_bail!(InvalidRange: "domain must have at least one dimension");
        }
        for d in &dims {
            if !(d.range.lo <= d.range.hi) {
                tessera_bail!(InvalidRange: "dimension '{}' has an empty domain", d.name);
            }
        }
        if let Some(extents) = &tile_extents {
            if extents.len() != dims.len() {
                tessera_bail!(
                    InvalidRange: "expected {} tile extents, got {}",
                    dims.len(),
                    extents.len()
                );
            }
            if extents.iter().any(|e| e.to_f64() <= 0.0) {
                tessera_bail!(InvalidRange: "tile extents must be positive");
            }
        }
        Ok(Self {
            dims,
            tile_extents,
            cell_order,
            tile_order,
        })
    }

    pub fn dim_num(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[Dimension<T>] {
        &self.dims
    }

    pub fn cell_order(&self) -> CellOrder {
        self.cell_order
    }

    pub fn tile_order(&self) -> CellOrder {
        self.tile_order
    }

    pub fn tile_extents(&self) -> Option<&[T]> {
        self.tile_extents.as_deref()
    }

    /// The whole domain as a region.
    pub fn region(&self) -> NDRange<T> {
        self.dims.iter().map(|d| d.range).collect()
    }

    pub fn contains_region(&self, region: &[DimRange<T>]) -> bool {
        region.len() == self.dims.len()
            && self
                .dims
                .iter()
                .zip(region)
                .all(|(d, r)| d.range.contains_range(r))
    }

    /// Tile coordinates of a cell, one index per dimension. Requires tile
    /// extents.
    pub fn tile_coords_of(&self, coords: &[T], out: &mut Vec<u64>) {
        let extents = self.extents();
        out.clear();
        out.extend(
            coords
                .iter()
                .zip(&self.dims)
                .zip(extents)
                .map(|((&c, d), &e)| c.tile_index(d.range.lo, e)),
        );
    }

    /// Split `region` in two for the given traversal, or `None` when every
    /// dimension is down to an unsplittable interval.
    ///
    /// Row-major reads split the slowest dimension first (and col-major the
    /// reverse) so that partitions stay contiguous in the emission order;
    /// global order follows the tile order; unordered reads split the
    /// longest dimension relative to its full domain, ties broken by the
    /// lower index.
    pub fn split_region(
        &self,
        region: &[DimRange<T>],
        layout: Layout,
    ) -> Option<(NDRange<T>, NDRange<T>)> {
        let d = self.split_dim(region, layout)?;
        let mid = T::split_point(region[d].lo, region[d].hi)?;
        let mut left = region.to_vec();
        let mut right = region.to_vec();
        left[d].hi = mid;
        right[d].lo = mid.successor();
        Some((left, right))
    }

    fn split_dim(&self, region: &[DimRange<T>], layout: Layout) -> Option<usize> {
        let splittable = |d: usize| T::split_point(region[d].lo, region[d].hi).is_some();
        let order = match layout {
            Layout::RowMajor => CellOrder::RowMajor,
            Layout::ColMajor => CellOrder::ColMajor,
            Layout::GlobalOrder => self.tile_order,
            Layout::Unordered => {
                return (0..region.len()).filter(|&d| splittable(d)).max_by(|&a, &b| {
                    self.normalized_extent(region, a)
                        .partial_cmp(&self.normalized_extent(region, b))
                        .tessera_expect("finite extents")
                        // Prefer the lower index on ties.
                        .then(b.cmp(&a))
                });
            }
        };
        match order {
            CellOrder::RowMajor => (0..region.len()).find(|&d| splittable(d)),
            CellOrder::ColMajor => (0..region.len()).rev().find(|&d| splittable(d)),
        }
    }

    fn normalized_extent(&self, region: &[DimRange<T>], d: usize) -> f64 {
        let full = T::span_f64(self.dims[d].range.lo, self.dims[d].range.hi);
        if full <= 0.0 {
            return 0.0;
        }
        T::span_f64(region[d].lo, region[d].hi) / full
    }

    fn extents(&self) -> &[T] {
        self.tile_extents
            .as_deref()
            .tessera_expect("domain has tile extents")
    }
}

impl<T: DenseCoord> Domain<T> {
    /// Number of cells a full tile holds.
    pub fn cell_num_per_tile(&self) -> u64 {
        self.extents().iter().map(|e| e.extent_cells()).product()
    }

    pub fn region_cell_num(region: &[DimRange<T>]) -> u64 {
        region
            .iter()
            .map(|r| r.hi.index_from(r.lo) + 1)
            .product()
    }

    /// Per-dimension tile index ranges covered by `region`.
    pub fn tile_domain(&self, region: &[DimRange<T>]) -> Vec<(u64, u64)> {
        let extents = self.extents();
        region
            .iter()
            .zip(&self.dims)
            .zip(extents)
            .map(|((r, d), &e)| (r.lo.tile_index(d.range.lo, e), r.hi.tile_index(d.range.lo, e)))
            .collect()
    }

    pub fn tile_num(&self, region: &[DimRange<T>]) -> u64 {
        self.tile_domain(region)
            .iter()
            .map(|&(lo, hi)| hi - lo + 1)
            .product()
    }

    /// The coordinate rectangle of a tile, clamped to the domain.
    pub fn tile_region(&self, tile_coords: &[u64]) -> NDRange<T> {
        let extents = self.extents();
        tile_coords
            .iter()
            .zip(&self.dims)
            .zip(extents)
            .map(|((&tc, d), &e)| {
                let cells = e.extent_cells();
                let max_index = d.range.hi.index_from(d.range.lo);
                let lo_index = tc * cells;
                let hi_index = (lo_index + cells - 1).min(max_index);
                DimRange::new(
                    T::offset_by(d.range.lo, lo_index),
                    T::offset_by(d.range.lo, hi_index),
                )
            })
            .collect()
    }

    /// Position of a cell within its tile, in cell order over the full tile
    /// rectangle.
    pub fn cell_pos_in_tile(&self, coords: &[T]) -> u64 {
        let extents = self.extents();
        let sizes: Vec<u64> = extents.iter().map(|e| e.extent_cells()).collect();
        let idx: Vec<u64> = coords
            .iter()
            .zip(&self.dims)
            .zip(&sizes)
            .map(|((&c, d), &n)| c.index_from(d.range.lo) % n)
            .collect();
        pos_in_sizes(&idx, &sizes, self.cell_order)
    }
}

/// Position of grid coordinates within a grid, in the given order.
pub fn grid_pos(coords: &[u64], grid: &[(u64, u64)], order: CellOrder) -> u64 {
    let sizes: Vec<u64> = grid.iter().map(|&(lo, hi)| hi - lo + 1).collect();
    let idx: Vec<u64> = coords
        .iter()
        .zip(grid)
        .map(|(&c, &(lo, _))| c - lo)
        .collect();
    pos_in_sizes(&idx, &sizes, order)
}

/// Advance grid coordinates to the next position in the given order;
/// returns `false` once the grid is exhausted.
pub fn next_grid_coords(coords: &mut [u64], grid: &[(u64, u64)], order: CellOrder) -> bool {
    let dims: Vec<usize> = match order {
        // Fastest-varying dimension first.
        CellOrder::RowMajor => (0..coords.len()).rev().collect(),
        CellOrder::ColMajor => (0..coords.len()).collect(),
    };
    for d in dims {
        if coords[d] < grid[d].1 {
            coords[d] += 1;
            return true;
        }
        coords[d] = grid[d].0;
    }
    false
}

fn pos_in_sizes(idx: &[u64], sizes: &[u64], order: CellOrder) -> u64 {
    let mut pos = 0u64;
    let mut stride = 1u64;
    let dims: Vec<usize> = match order {
        CellOrder::RowMajor => (0..idx.len()).rev().collect(),
        CellOrder::ColMajor => (0..idx.len()).collect(),
    };
    for d in dims {
        pos += idx[d] * stride;
        stride *= sizes[d];
    }
    pos
}

#[cfg(test)]
mod tests {
    use super::*;

    fn domain_4x4() -> Domain<i32> {
        Domain::new(
            vec![Dimension::new("rows", 1, 4), Dimension::new("cols", 1, 4)],
            Some(vec![2, 2]),
            CellOrder::RowMajor,
            CellOrder::RowMajor,
        )
        .unwrap()
    }

    #[test]
    fn tile_arithmetic() {
        let dom = domain_4x4();
        assert_eq!(dom.cell_num_per_tile(), 4);
        let mut tc = Vec::new();
        dom.tile_coords_of(&[3, 2], &mut tc);
        assert_eq!(tc, vec![1, 0]);
        assert_eq!(dom.tile_region(&[1, 0]), vec![DimRange::new(3, 4), DimRange::new(1, 2)]);
        // (3,2) is cell (0,1) of its tile in row-major order.
        assert_eq!(dom.cell_pos_in_tile(&[3, 2]), 1);
    }

    #[test]
    fn tile_region_clamps_at_domain_edge() {
        let dom = Domain::new(
            vec![Dimension::<i32>::new("d", 1, 5)],
            Some(vec![2]),
            CellOrder::RowMajor,
            CellOrder::RowMajor,
        )
        .unwrap();
        assert_eq!(dom.tile_region(&[2]), vec![DimRange::new(5, 5)]);
    }

    #[test]
    fn split_row_major_prefers_slow_dim() {
        let dom = domain_4x4();
        let (l, r) = dom
            .split_region(&[DimRange::new(1, 4), DimRange::new(1, 4)], Layout::RowMajor)
            .unwrap();
        assert_eq!(l, vec![DimRange::new(1, 2), DimRange::new(1, 4)]);
        assert_eq!(r, vec![DimRange::new(3, 4), DimRange::new(1, 4)]);
    }

    #[test]
    fn split_col_major_prefers_fast_dim() {
        let dom = domain_4x4();
        let (l, r) = dom
            .split_region(&[DimRange::new(1, 4), DimRange::new(1, 4)], Layout::ColMajor)
            .unwrap();
        assert_eq!(l, vec![DimRange::new(1, 4), DimRange::new(1, 2)]);
        assert_eq!(r, vec![DimRange::new(1, 4), DimRange::new(3, 4)]);
    }

    #[test]
    fn split_unordered_takes_longest_dim() {
        let dom = domain_4x4();
        let (l, r) = dom
            .split_region(&[DimRange::new(2, 2), DimRange::new(1, 4)], Layout::Unordered)
            .unwrap();
        assert_eq!(l, vec![DimRange::new(2, 2), DimRange::new(1, 2)]);
        assert_eq!(r, vec![DimRange::new(2, 2), DimRange::new(3, 4)]);
    }

    #[test]
    fn single_cell_region_is_unsplittable() {
        let dom = domain_4x4();
        assert!(dom
            .split_region(&[DimRange::new(2, 2), DimRange::new(3, 3)], Layout::RowMajor)
            .is_none());
    }

    #[test]
    fn grid_walk_row_major() {
        let grid = [(0u64, 1), (0u64, 1)];
        let mut c = vec![0, 0];
        let mut seen = vec![c.clone()];
        while next_grid_coords(&mut c, &grid, CellOrder::RowMajor) {
            seen.push(c.clone());
        }
        assert_eq!(seen, vec![vec![0, 0], vec![0, 1], vec![1, 0], vec![1, 1]]);
        assert_eq!(grid_pos(&[1, 0], &grid, CellOrder::RowMajor), 2);
        assert_eq!(grid_pos(&[1, 0], &grid, CellOrder::ColMajor), 1);
    }
}
