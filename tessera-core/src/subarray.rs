//! Query regions.
//!
//! A subarray is one or more closed ranges per dimension plus the layout the
//! results should come back in. The Cartesian product of the per-dimension
//! range lists forms the query's ranges.

use tessera_error::{tessera_bail, TesseraResult};

use crate::coord::CoordType;
use crate::domain::{DimRange, Domain, NDRange};
use crate::layout::{CellOrder, Layout};

#[derive(Debug, Clone)]
pub struct Subarray<T: CoordType> {
    layout: Layout,
    dim_ranges: Vec<Vec<DimRange<T>>>,
    explicit: Vec<bool>,
}

impl<T: CoordType> Subarray<T> {
    /// A subarray spanning the whole domain; ranges added later replace the
    /// default on their dimension.
    pub fn new(domain: &Domain<T>, layout: Layout) -> Self {
        Self {
            layout,
            dim_ranges: domain.dims().iter().map(|d| vec![d.range]).collect(),
            explicit: vec![false; domain.dim_num()],
        }
    }

    /// Add `[lo, hi]` on dimension `dim`.
    pub fn add_range(
        &mut self,
        domain: &Domain<T>,
        dim: usize,
        lo: T,
        hi: T,
    ) -> TesseraResult<()> {
        if dim >= self.dim_ranges.len() {
            tessera_bail!(InvalidRange: "dimension index {dim} out of bounds");
        }
        if !(lo <= hi) {
            tessera_bail!(InvalidRange: "range [{lo:?}, {hi:?}] is empty or unordered");
        }
        let range = DimRange::new(lo, hi);
        if !domain.dims()[dim].range.contains_range(&range) {
            tessera_bail!(
                InvalidRange: "range [{lo:?}, {hi:?}] escapes dimension '{}'",
                domain.dims()[dim].name
            );
        }
        if self.explicit[dim] {
            self.dim_ranges[dim].push(range);
        } else {
            self.dim_ranges[dim] = vec![range];
            self.explicit[dim] = true;
        }
        Ok(())
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn set_layout(&mut self, layout: Layout) {
        self.layout = layout;
    }

    pub fn dim_num(&self) -> usize {
        self.dim_ranges.len()
    }

    pub fn dim_ranges(&self) -> &[Vec<DimRange<T>>] {
        &self.dim_ranges
    }

    /// Number of Cartesian ranges.
    pub fn range_num(&self) -> u64 {
        self.dim_ranges.iter().map(|r| r.len() as u64).product()
    }

    /// The `r`-th Cartesian range; dimension 0 varies slowest.
    pub fn range(&self, r: u64) -> NDRange<T> {
        let mut idx = r;
        let mut out = vec![self.dim_ranges[0][0]; self.dim_num()];
        for d in (0..self.dim_num()).rev() {
            let n = self.dim_ranges[d].len() as u64;
            out[d] = self.dim_ranges[d][(idx % n) as usize];
            idx /= n;
        }
        out
    }

    /// Split in two, or `None` when a single unsplittable range remains.
    ///
    /// A multi-range subarray splits its range lists before any range is
    /// split numerically.
    pub fn split(&self, domain: &Domain<T>) -> Option<(Self, Self)> {
        if let Some(d) = self.multi_range_split_dim(domain) {
            let mid = self.dim_ranges[d].len() / 2;
            let mut left = self.clone();
            let mut right = self.clone();
            left.dim_ranges[d] = self.dim_ranges[d][..mid].to_vec();
            right.dim_ranges[d] = self.dim_ranges[d][mid..].to_vec();
            return Some((left, right));
        }
        let region: NDRange<T> = self.range(0);
        let (l, r) = domain.split_region(&region, self.layout)?;
        Some((self.with_single_ranges(l), self.with_single_ranges(r)))
    }

    fn multi_range_split_dim(&self, domain: &Domain<T>) -> Option<usize> {
        let candidates = (0..self.dim_num()).filter(|&d| self.dim_ranges[d].len() > 1);
        match self.layout {
            Layout::RowMajor => candidates.min(),
            Layout::ColMajor => candidates.max(),
            Layout::GlobalOrder => match domain.tile_order() {
                CellOrder::RowMajor => candidates.min(),
                CellOrder::ColMajor => candidates.max(),
            },
            Layout::Unordered => candidates.max_by_key(|&d| self.dim_ranges[d].len()),
        }
    }

    fn with_single_ranges(&self, region: NDRange<T>) -> Self {
        Self {
            layout: self.layout,
            dim_ranges: region.into_iter().map(|r| vec![r]).collect(),
            explicit: self.explicit.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Dimension;

    fn domain() -> Domain<i32> {
        Domain::new(
            vec![Dimension::new("r", 1, 100), Dimension::new("c", 1, 100)],
            Some(vec![10, 10]),
            CellOrder::RowMajor,
            CellOrder::RowMajor,
        )
        .unwrap()
    }

    #[test]
    fn defaults_to_whole_domain() {
        let dom = domain();
        let s = Subarray::new(&dom, Layout::RowMajor);
        assert_eq!(s.range_num(), 1);
        assert_eq!(s.range(0), vec![DimRange::new(1, 100), DimRange::new(1, 100)]);
    }

    #[test]
    fn explicit_range_replaces_default() {
        let dom = domain();
        let mut s = Subarray::new(&dom, Layout::RowMajor);
        s.add_range(&dom, 0, 5, 10).unwrap();
        s.add_range(&dom, 0, 20, 30).unwrap();
        assert_eq!(s.range_num(), 2);
        assert_eq!(s.range(1)[0], DimRange::new(20, 30));
        assert_eq!(s.range(1)[1], DimRange::new(1, 100));
    }

    #[test]
    fn out_of_domain_range_is_rejected() {
        let dom = domain();
        let mut s = Subarray::new(&dom, Layout::RowMajor);
        assert!(s.add_range(&dom, 0, 0, 5).is_err());
        assert!(s.add_range(&dom, 1, 7, 6).is_err());
        assert!(s.add_range(&dom, 2, 1, 1).is_err());
    }

    #[test]
    fn multi_range_splits_list_first() {
        let dom = domain();
        let mut s = Subarray::new(&dom, Layout::RowMajor);
        s.add_range(&dom, 0, 1, 10).unwrap();
        s.add_range(&dom, 0, 41, 50).unwrap();
        let (l, r) = s.split(&dom).unwrap();
        assert_eq!(l.range_num(), 1);
        assert_eq!(r.range_num(), 1);
        assert_eq!(l.range(0)[0], DimRange::new(1, 10));
        assert_eq!(r.range(0)[0], DimRange::new(41, 50));
    }

    #[test]
    fn single_cell_cannot_split() {
        let dom = domain();
        let mut s = Subarray::new(&dom, Layout::RowMajor);
        s.add_range(&dom, 0, 7, 7).unwrap();
        s.add_range(&dom, 1, 9, 9).unwrap();
        assert!(s.split(&dom).is_none());
    }
}
