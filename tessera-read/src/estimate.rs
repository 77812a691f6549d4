//! Result-size estimation.
//!
//! Upper-bound estimates of how many bytes a sub-region will produce per
//! attribute, derived from fragment metadata only: overlapping tile counts
//! and their per-tile sizes. The partitioner splits sub-regions until these
//! estimates fit the caller's budgets; actual overflow is still detected at
//! copy time, so the estimates steer rather than guarantee.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use tessera_core::domain::region_intersection;
use tessera_core::{ArraySchema, CoordType, FragmentMetadata, NDRange, Subarray, COORDS};
use tessera_error::{TesseraExpect, TesseraResult};

/// Estimated output bytes for one attribute.
#[derive(Debug, Clone, Copy, Default)]
pub struct AttrEstimate {
    pub fixed: u64,
    pub var: u64,
}

/// Estimated in-flight tile bytes for a sub-region.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryEstimate {
    pub fixed: u64,
    pub var: u64,
}

/// Estimate result and tile sizes for every attribute in `attrs` over
/// `subarray`.
pub fn est_read_buffer_sizes<T: CoordType>(
    schema: &ArraySchema<T>,
    fragments: &[Arc<FragmentMetadata<T>>],
    subarray: &Subarray<T>,
    attrs: &[String],
    sparse_mode: bool,
) -> TesseraResult<(FxHashMap<String, AttrEstimate>, MemoryEstimate)> {
    let mut est: FxHashMap<String, AttrEstimate> = attrs
        .iter()
        .map(|a| (a.clone(), AttrEstimate::default()))
        .collect();
    let mut memory = MemoryEstimate::default();

    let dense = schema.dense() && !sparse_mode;
    for r in 0..subarray.range_num() {
        let range = subarray.range(r);
        if dense {
            est_dense_range(schema, fragments, &range, attrs, &mut est, &mut memory)?;
        } else {
            est_sparse_range(schema, fragments, &range, attrs, &mut est, &mut memory)?;
        }
    }
    Ok((est, memory))
}

/// A dense read emits every cell of the range, written or not.
fn est_dense_range<T: CoordType>(
    schema: &ArraySchema<T>,
    fragments: &[Arc<FragmentMetadata<T>>],
    range: &NDRange<T>,
    attrs: &[String],
    est: &mut FxHashMap<String, AttrEstimate>,
    memory: &mut MemoryEstimate,
) -> TesseraResult<()> {
    let cells: u64 = range
        .iter()
        .map(|d| T::cells_between(d.lo, d.hi).tessera_expect("dense domains are integral"))
        .product();

    for attr in attrs {
        let e = est.get_mut(attr).tessera_expect("estimate map is seeded");
        e.fixed += cells * schema.cell_size(attr)?;
        if schema.var_size(attr)? {
            e.var += cells * schema.type_of(attr)?.size();
        }
    }

    // Every overlapping fragment tile is decoded whole.
    for f in fragments.iter().filter(|f| f.is_dense()) {
        let Some(overlap) = region_intersection(f.non_empty_domain(), range) else {
            continue;
        };
        let tile_count: u64 = schema
            .domain()
            .tile_extents()
            .map(|extents| {
                overlap
                    .iter()
                    .zip(schema.domain().dims())
                    .zip(extents)
                    .map(|((o, d), &e)| {
                        o.hi.tile_index(d.range.lo, e) - o.lo.tile_index(d.range.lo, e) + 1
                    })
                    .product()
            })
            .unwrap_or(1);
        for attr in attrs.iter().filter(|a| a.as_str() != COORDS) {
            let avg = avg_tile_sizes(f, attr);
            memory.fixed += tile_count * avg.0;
            memory.var += tile_count * avg.1;
        }
    }
    Ok(())
}

fn est_sparse_range<T: CoordType>(
    schema: &ArraySchema<T>,
    fragments: &[Arc<FragmentMetadata<T>>],
    range: &NDRange<T>,
    attrs: &[String],
    est: &mut FxHashMap<String, AttrEstimate>,
    memory: &mut MemoryEstimate,
) -> TesseraResult<()> {
    let coords_size = schema.coords_size();
    for f in fragments.iter().filter(|f| !f.is_dense()) {
        for (j, mbr) in f.mbrs().iter().enumerate() {
            let Some(inter) = region_intersection(mbr, range) else {
                continue;
            };
            let frac: f64 = mbr
                .iter()
                .zip(&inter)
                .map(|(m, i)| {
                    let full = T::span_f64(m.lo, m.hi);
                    if full <= 0.0 {
                        1.0
                    } else {
                        T::span_f64(i.lo, i.hi) / full
                    }
                })
                .product();
            let tile_cells = f
                .tile_size(COORDS, j as u64)
                .map(|s| s / coords_size)
                .unwrap_or(schema.capacity());
            let cells = (frac * tile_cells as f64).ceil() as u64;

            for attr in attrs {
                let e = est.get_mut(attr).tessera_expect("estimate map is seeded");
                e.fixed += cells * schema.cell_size(attr)?;
                if schema.var_size(attr)? {
                    let var_size = f.tile_var_size(attr, j as u64).unwrap_or(0);
                    e.var += (frac * var_size as f64).ceil() as u64;
                }
                memory.fixed += f.tile_size(attr, j as u64).unwrap_or(0);
                memory.var += f.tile_var_size(attr, j as u64).unwrap_or(0);
            }
            memory.fixed += f.tile_size(COORDS, j as u64).unwrap_or(0);
        }
    }
    Ok(())
}

fn avg_tile_sizes<T: CoordType>(f: &FragmentMetadata<T>, attr: &str) -> (u64, u64) {
    let tiles = f.tile_num().max(1);
    let fixed: u64 = (0..f.tile_num())
        .map(|t| f.tile_size(attr, t).unwrap_or(0))
        .sum();
    let var: u64 = (0..f.tile_num())
        .map(|t| f.tile_var_size(attr, t).unwrap_or(0))
        .sum();
    (fixed / tiles, var / tiles)
}

/// Whether an estimate predicts an empty result.
pub fn no_estimated_results(est: &FxHashMap<String, AttrEstimate>) -> bool {
    est.values().all(|e| e.fixed == 0 && e.var == 0)
}
