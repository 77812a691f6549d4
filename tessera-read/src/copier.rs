//! Materializing cell ranges into the caller's buffers.
//!
//! Destination offsets are computed up front so overflow is detected
//! before a single byte is written; the actual copies then run in parallel
//! over disjoint destination slices.

use rayon::prelude::*;
use tessera_core::{
    ArraySchema, Cancellation, CoordType, DenseCoord, Layout, NDRange, COORDS,
};
use tessera_error::{tessera_bail, tessera_err, TesseraResult};

use crate::buffers::QueryBuffers;
use crate::dense::SlabWalk;
use crate::locator::TileSet;
use crate::CellRange;

/// Copy `ranges` of `attr` into the caller's buffers, or flag an overflow
/// without touching them.
pub(crate) fn copy_cells<T: CoordType>(
    schema: &ArraySchema<T>,
    set: &TileSet,
    ranges: &[CellRange],
    attr: &str,
    buffers: &mut QueryBuffers<'_>,
    overflowed: &mut bool,
    cancellation: &Cancellation,
) -> TesseraResult<()> {
    if ranges.is_empty() {
        return Ok(());
    }
    if schema.var_size(attr)? {
        copy_var_cells(schema, set, ranges, attr, buffers, overflowed, cancellation)
    } else {
        copy_fixed_cells(schema, set, ranges, attr, buffers, overflowed, cancellation)
    }
}

fn fill_value_of<'a, T: CoordType>(schema: &'a ArraySchema<T>, attr: &str) -> TesseraResult<&'a [u8]> {
    Ok(match schema.attribute(attr) {
        Some(a) => a.fill_value(),
        None => schema.type_of(attr)?.fill_value(),
    })
}

fn copy_fixed_cells<T: CoordType>(
    schema: &ArraySchema<T>,
    set: &TileSet,
    ranges: &[CellRange],
    attr: &str,
    buffers: &mut QueryBuffers<'_>,
    overflowed: &mut bool,
    cancellation: &Cancellation,
) -> TesseraResult<()> {
    let cell_size = schema.cell_size(attr)?;
    let fill = fill_value_of(schema, attr)?;
    let buf = buffers
        .get_mut(attr)
        .ok_or_else(|| tessera_err!(InvalidAttribute: "no buffer for '{attr}'"))?;

    // Destination offsets up front; bail before writing on overflow.
    let lens: Vec<usize> = ranges
        .iter()
        .map(|cr| (cr.cell_num() * cell_size) as usize)
        .collect();
    let total: usize = lens.iter().sum();
    if total > buf.data.len() {
        *overflowed = true;
        return Ok(());
    }

    let mut chunks = Vec::with_capacity(ranges.len());
    let mut rest: &mut [u8] = &mut buf.data[..total];
    for &len in &lens {
        let (chunk, tail) = rest.split_at_mut(len);
        chunks.push(chunk);
        rest = tail;
    }

    chunks
        .into_par_iter()
        .zip(ranges.par_iter())
        .try_for_each(|(chunk, cr)| -> TesseraResult<()> {
            cancellation.check()?;
            match cr.tile {
                None => {
                    for dst in chunk.chunks_exact_mut(fill.len()) {
                        dst.copy_from_slice(fill);
                    }
                }
                Some(t) => {
                    let tile = &set.tiles[t]
                        .attr_tiles
                        .get(attr)
                        .ok_or_else(|| tessera_err!("tile missing attribute '{attr}'"))?
                        .fixed;
                    let src = tile.data();
                    let lo = (cr.start * cell_size) as usize;
                    let hi = ((cr.end + 1) * cell_size) as usize;
                    if hi > src.len() {
                        tessera_bail!("cell range [{}, {}] escapes its tile", cr.start, cr.end);
                    }
                    chunk.copy_from_slice(&src[lo..hi]);
                }
            }
            Ok(())
        })?;

    buf.size = total as u64;
    Ok(())
}

/// Per-range var destinations: where the payload lands and each cell's
/// payload size.
struct VarDest {
    var_start: u64,
    cell_sizes: Vec<u64>,
}

fn copy_var_cells<T: CoordType>(
    schema: &ArraySchema<T>,
    set: &TileSet,
    ranges: &[CellRange],
    attr: &str,
    buffers: &mut QueryBuffers<'_>,
    overflowed: &mut bool,
    cancellation: &Cancellation,
) -> TesseraResult<()> {
    let offset_size = tessera_core::CELL_VAR_OFFSET_SIZE;
    let fill = fill_value_of(schema, attr)?;
    let buf = buffers
        .get_mut(attr)
        .ok_or_else(|| tessera_err!(InvalidAttribute: "no buffer for '{attr}'"))?;
    let Some(var_buf) = buf.var.as_mut() else {
        tessera_bail!(VarLengthMismatch: "attribute '{attr}' needs a var buffer");
    };

    // First pass: per-cell sizes and totals.
    let mut dests = Vec::with_capacity(ranges.len());
    let mut total_offsets = 0u64;
    let mut total_var = 0u64;
    for cr in ranges {
        let mut cell_sizes = Vec::with_capacity(cr.cell_num() as usize);
        match cr.tile {
            None => cell_sizes.extend(std::iter::repeat_n(fill.len() as u64, cr.cell_num() as usize)),
            Some(t) => {
                let pair = set.tiles[t]
                    .attr_tiles
                    .get(attr)
                    .ok_or_else(|| tessera_err!("tile missing attribute '{attr}'"))?;
                let offsets = pair.fixed.offsets();
                let var_tile_size = pair
                    .var
                    .as_ref()
                    .map(|v| v.size())
                    .ok_or_else(|| tessera_err!("tile missing var stream for '{attr}'"))?;
                for cell in cr.start..=cr.end {
                    let i = cell as usize;
                    // Offsets are tile-relative; the last cell runs to the
                    // end of the var tile.
                    let size = if i + 1 < offsets.len() {
                        offsets[i + 1] - offsets[i]
                    } else {
                        var_tile_size - (offsets[i] - offsets[0])
                    };
                    cell_sizes.push(size);
                }
            }
        }
        let var_bytes: u64 = cell_sizes.iter().sum();
        dests.push(VarDest {
            var_start: total_var,
            cell_sizes,
        });
        total_offsets += cr.cell_num() * offset_size;
        total_var += var_bytes;
    }

    if total_offsets > buf.data.len() as u64 || total_var > var_buf.len() as u64 {
        *overflowed = true;
        return Ok(());
    }

    // Second pass: carve disjoint destination slices and copy in parallel.
    let mut off_chunks = Vec::with_capacity(ranges.len());
    let mut rest: &mut [u8] = &mut buf.data[..total_offsets as usize];
    for cr in ranges {
        let (chunk, tail) = rest.split_at_mut((cr.cell_num() * offset_size) as usize);
        off_chunks.push(chunk);
        rest = tail;
    }
    let mut var_chunks = Vec::with_capacity(ranges.len());
    let mut rest: &mut [u8] = &mut var_buf[..total_var as usize];
    for dest in &dests {
        let bytes: u64 = dest.cell_sizes.iter().sum();
        let (chunk, tail) = rest.split_at_mut(bytes as usize);
        var_chunks.push(chunk);
        rest = tail;
    }

    ranges
        .par_iter()
        .zip(dests.par_iter())
        .zip(off_chunks.into_par_iter().zip(var_chunks))
        .try_for_each(|((cr, dest), (off_chunk, var_chunk))| -> TesseraResult<()> {
            cancellation.check()?;
            let tile_data = match cr.tile {
                None => None,
                Some(t) => {
                    let pair = set.tiles[t]
                        .attr_tiles
                        .get(attr)
                        .ok_or_else(|| tessera_err!("tile missing attribute '{attr}'"))?;
                    let offsets = pair.fixed.offsets();
                    let var = pair
                        .var
                        .as_ref()
                        .map(|v| v.data().clone())
                        .ok_or_else(|| tessera_err!("tile missing var stream for '{attr}'"))?;
                    Some((offsets, var))
                }
            };

            let mut var_off = 0u64;
            for (k, &size) in dest.cell_sizes.iter().enumerate() {
                // Offsets are absolute within this query's var buffer.
                let absolute = dest.var_start + var_off;
                off_chunk[k * offset_size as usize..(k + 1) * offset_size as usize]
                    .copy_from_slice(&absolute.to_le_bytes());
                let dst = &mut var_chunk[var_off as usize..(var_off + size) as usize];
                match &tile_data {
                    None => dst.copy_from_slice(fill),
                    Some((offsets, var)) => {
                        let cell = (cr.start as usize) + k;
                        let src_start = (offsets[cell] - offsets[0]) as usize;
                        dst.copy_from_slice(&var[src_start..src_start + size as usize]);
                    }
                }
                var_off += size;
            }
            Ok(())
        })?;

    buf.size = total_offsets;
    buf.var_size = total_var;
    Ok(())
}

/// Regenerate the coordinates of a dense read analytically, slab by slab,
/// in the emission order.
pub(crate) fn fill_coords<T: DenseCoord>(
    schema: &ArraySchema<T>,
    regions: &[NDRange<T>],
    layout: Layout,
    buffers: &mut QueryBuffers<'_>,
    overflowed: &mut bool,
) -> TesseraResult<()> {
    let Some(buf) = buffers.get_mut(COORDS) else {
        return Ok(());
    };
    let domain = schema.domain();
    let dim_num = domain.dim_num();
    let coords_size = schema.coords_size() as usize;

    let mut offset = 0usize;
    let mut scratch: Vec<u8> = Vec::new();
    for region in regions {
        let walk = SlabWalk::new(domain, region.clone(), layout);
        let order = walk.slab_order();
        for slab in walk {
            let bytes = slab.num as usize * coords_size;
            if offset + bytes > buf.data.len() {
                *overflowed = true;
                return Ok(());
            }
            scratch.clear();
            for i in 0..slab.num {
                match order {
                    tessera_core::CellOrder::RowMajor => {
                        for &c in &slab.start[..dim_num - 1] {
                            c.put_le(&mut scratch);
                        }
                        T::offset_by(slab.start[dim_num - 1], i).put_le(&mut scratch);
                    }
                    tessera_core::CellOrder::ColMajor => {
                        T::offset_by(slab.start[0], i).put_le(&mut scratch);
                        for &c in &slab.start[1..] {
                            c.put_le(&mut scratch);
                        }
                    }
                }
            }
            buf.data[offset..offset + bytes].copy_from_slice(&scratch);
            offset += bytes;
        }
    }
    buf.size = offset as u64;
    Ok(())
}
