//! Byte-range coalescing.

use std::ops::Range;

use bytes::Bytes;

/// How eagerly nearby tile reads against one file collapse into a single
/// IO.
#[derive(Debug, Clone, Copy)]
pub struct CoalescePolicy {
    /// Gap bytes tolerated between two reads; anything closer is cheaper
    /// to read through than to issue separately.
    pub max_gap: u64,
    /// Upper bound on one coalesced read, so merging cannot produce a
    /// request that monopolizes an IO worker.
    pub max_merged: u64,
}

impl Default for CoalescePolicy {
    fn default() -> Self {
        Self {
            max_gap: 4096,
            max_merged: 4 * 1024 * 1024,
        }
    }
}

/// Collapse tile byte regions into fewer, larger reads under `policy`.
///
/// Regions are the extents of distinct tiles and never overlap. A single
/// region larger than `max_merged` is kept whole; the cap only stops
/// further growth.
pub fn coalesce_regions(mut regions: Vec<Range<u64>>, policy: CoalescePolicy) -> Vec<Range<u64>> {
    regions.sort_unstable_by_key(|r| r.start);
    let mut merged: Vec<Range<u64>> = Vec::with_capacity(regions.len());
    for region in regions {
        match merged.last_mut() {
            Some(last)
                if region.start <= last.end.saturating_add(policy.max_gap)
                    && region.end.max(last.end) - last.start <= policy.max_merged =>
            {
                last.end = last.end.max(region.end);
            }
            _ => merged.push(region),
        }
    }
    merged
}

/// Carve the bytes of each requested region back out of the coalesced
/// reads.
///
/// `merged` and `read` are parallel, as produced by [`coalesce_regions`];
/// every region lies inside exactly one coalesced read.
pub(crate) fn slice_regions(
    merged: &[Range<u64>],
    read: &[Bytes],
    regions: &[Range<u64>],
) -> Vec<Bytes> {
    regions
        .iter()
        .map(|region| {
            let idx = merged.partition_point(|m| m.start <= region.start) - 1;
            let bytes = &read[idx];
            let start = (region.start - merged[idx].start) as usize;
            let end = (region.end - merged[idx].start) as usize;
            bytes.slice(start..end.min(bytes.len()))
        })
        .collect()
}
