//! Test support: authors fragment byte streams the way the write path
//! would, registers them with an in-memory VFS and hands back the
//! matching metadata.

#![allow(dead_code)]

use std::sync::Arc;

use bytes::Bytes;
use tessera_core::{
    ArraySchema, AttrFileMeta, CoordType, DenseCoord, Domain, FragmentMetadata, NDRange,
    StreamMeta, Subarray, CELL_VAR_OFFSET_SIZE, COORDS,
};
use tessera_core::{CellOrder, DimRange};
use tessera_io::{IoDispatcher, Vfs};
use tessera_read::{QueryBuffers, Reader, Storage};

pub fn storage() -> Arc<Storage> {
    Arc::new(Storage::new(Vfs::new(Arc::new(IoDispatcher::new(2)))))
}

/// One attribute's streams while a fragment is being authored.
#[derive(Default)]
struct StreamsUnderWrite {
    fixed_file: Vec<u8>,
    fixed_meta: StreamMeta,
    var_file: Vec<u8>,
    var_meta: StreamMeta,
    var_sized: bool,
}

struct FragmentWriter<'a, T: CoordType> {
    schema: &'a ArraySchema<T>,
    uri: String,
    streams: Vec<(String, StreamsUnderWrite)>,
}

impl<'a, T: CoordType> FragmentWriter<'a, T> {
    fn new(schema: &'a ArraySchema<T>, uri: &str, attrs: &[String]) -> Self {
        let streams = attrs
            .iter()
            .map(|a| {
                (
                    a.clone(),
                    StreamsUnderWrite {
                        var_sized: schema.var_size(a).unwrap(),
                        ..Default::default()
                    },
                )
            })
            .collect();
        Self {
            schema,
            uri: uri.to_owned(),
            streams,
        }
    }

    /// Append one encoded tile per attribute from the raw cell bytes.
    fn push_tile(&mut self, tiles: Vec<(String, Vec<u8>, Option<Vec<u8>>)>) {
        for (attr, fixed, var) in tiles {
            let entry = &mut self
                .streams
                .iter_mut()
                .find(|(a, _)| *a == attr)
                .expect("attr registered")
                .1;
            let fixed_pipe = if entry.var_sized {
                self.schema.offsets_filters()
            } else {
                self.schema.filters_for(&attr)
            };
            let logical = fixed.len() as u64;
            let encoded = fixed_pipe.run_forward(Bytes::from(fixed)).unwrap();
            entry.fixed_meta.push_tile(
                entry.fixed_file.len() as u64,
                encoded.len() as u64,
                logical,
            );
            entry.fixed_file.extend_from_slice(&encoded);

            if let Some(var) = var {
                let logical = var.len() as u64;
                let encoded = self
                    .schema
                    .filters_for(&attr)
                    .run_forward(Bytes::from(var))
                    .unwrap();
                entry.var_meta.push_tile(
                    entry.var_file.len() as u64,
                    encoded.len() as u64,
                    logical,
                );
                entry.var_file.extend_from_slice(&encoded);
            }
        }
    }

    fn finish(self, vfs: &Vfs, meta: &mut FragmentMetadata<T>) {
        for (attr, entry) in self.streams {
            let mut file_meta = AttrFileMeta {
                fixed: entry.fixed_meta,
                var: None,
            };
            vfs.register(
                meta.attr_uri(&attr),
                Arc::new(Bytes::from(entry.fixed_file)),
            );
            if entry.var_sized {
                vfs.register(
                    meta.attr_var_uri(&attr),
                    Arc::new(Bytes::from(entry.var_file)),
                );
                file_meta.var = Some(entry.var_meta);
            }
            meta.set_attr_meta(attr, file_meta);
        }
    }
}

/// The coordinates of cell `pos` of tile `tile_coords`, or `None` when the
/// position pads past the domain edge.
fn cell_coords_at<T: DenseCoord>(
    domain: &Domain<T>,
    tile_coords: &[u64],
    pos: u64,
) -> Option<Vec<T>> {
    let dims = domain.dim_num();
    let extents: Vec<u64> = domain
        .tile_extents()
        .unwrap()
        .iter()
        .map(|e| e.extent_cells())
        .collect();
    let order: Vec<usize> = match domain.cell_order() {
        CellOrder::RowMajor => (0..dims).collect(),
        CellOrder::ColMajor => (0..dims).rev().collect(),
    };
    let mut idx = vec![0u64; dims];
    let mut rem = pos;
    for (k, &d) in order.iter().enumerate() {
        let stride: u64 = order[k + 1..].iter().map(|&f| extents[f]).product();
        idx[d] = rem / stride;
        rem %= stride;
    }
    let mut out = Vec::with_capacity(dims);
    for d in 0..dims {
        let lo = domain.dims()[d].range.lo;
        let global = tile_coords[d] * extents[d] + idx[d];
        if global > domain.dims()[d].range.hi.index_from(lo) {
            return None;
        }
        out.push(T::offset_by(lo, global));
    }
    Some(out)
}

/// Author a dense fragment covering `non_empty`, with cell values supplied
/// by `value(attr, coords)`. Cells padding the edge tiles are zeroed.
pub fn build_dense_fragment<T: DenseCoord>(
    schema: &ArraySchema<T>,
    vfs: &Vfs,
    uri: &str,
    non_empty: NDRange<T>,
    attrs: &[String],
    mut value: impl FnMut(&str, &[T]) -> Vec<u8>,
) -> Arc<FragmentMetadata<T>> {
    let domain = schema.domain();
    let mut meta = FragmentMetadata::dense(uri, 1, non_empty.clone(), domain).unwrap();
    let mut writer = FragmentWriter::new(schema, uri, attrs);

    let grid = domain.tile_domain(&non_empty);
    let mut tc: Vec<u64> = grid.iter().map(|&(lo, _)| lo).collect();
    let cells = domain.cell_num_per_tile();
    loop {
        let mut tiles = Vec::new();
        for attr in attrs {
            let cell_size = schema.cell_size(attr).unwrap() as usize;
            let var_sized = schema.var_size(attr).unwrap();
            let mut fixed = Vec::with_capacity(cells as usize * cell_size);
            let mut var: Vec<u8> = Vec::new();
            for pos in 0..cells {
                let written = cell_coords_at(domain, &tc, pos)
                    .filter(|c| tessera_core::domain::region_contains_point(&non_empty, c));
                if var_sized {
                    let payload = written.map(|c| value(attr, &c)).unwrap_or_default();
                    fixed.extend_from_slice(&(var.len() as u64).to_le_bytes());
                    var.extend_from_slice(&payload);
                } else {
                    match written {
                        Some(c) => {
                            let v = value(attr, &c);
                            assert_eq!(v.len(), cell_size);
                            fixed.extend_from_slice(&v);
                        }
                        None => fixed.extend_from_slice(&vec![0u8; cell_size]),
                    }
                }
            }
            tiles.push((attr.clone(), fixed, var_sized.then_some(var)));
        }
        writer.push_tile(tiles);
        if !tessera_core::domain::next_grid_coords(&mut tc, &grid, domain.tile_order()) {
            break;
        }
    }
    writer.finish(vfs, &mut meta);
    Arc::new(meta)
}

/// One sparse cell under write: coordinates plus per-attribute values.
pub struct SparseCell<T> {
    pub coords: Vec<T>,
    pub values: Vec<(String, Vec<u8>)>,
}

impl<T> SparseCell<T> {
    pub fn new(coords: Vec<T>, values: Vec<(&str, Vec<u8>)>) -> Self {
        Self {
            coords,
            values: values.into_iter().map(|(a, v)| (a.to_owned(), v)).collect(),
        }
    }
}

/// Author a sparse fragment from cells given in storage order, chunked
/// into tiles of at most `capacity` cells with their MBRs.
pub fn build_sparse_fragment<T: CoordType>(
    schema: &ArraySchema<T>,
    vfs: &Vfs,
    uri: &str,
    cells: Vec<SparseCell<T>>,
) -> Arc<FragmentMetadata<T>> {
    assert!(!cells.is_empty());
    let dims = schema.dim_num();
    let capacity = schema.capacity() as usize;
    let attrs: Vec<String> = cells[0].values.iter().map(|(a, _)| a.clone()).collect();

    let non_empty: NDRange<T> = (0..dims)
        .map(|d| {
            let mut lo = cells[0].coords[d];
            let mut hi = lo;
            for c in &cells {
                if c.coords[d] < lo {
                    lo = c.coords[d];
                }
                if c.coords[d] > hi {
                    hi = c.coords[d];
                }
            }
            DimRange::new(lo, hi)
        })
        .collect();

    let mut mbrs = Vec::new();
    let mut all_attrs = vec![COORDS.to_owned()];
    all_attrs.extend(attrs.iter().cloned());
    let mut writer = FragmentWriter::new(schema, uri, &all_attrs);

    for chunk in cells.chunks(capacity) {
        let mbr: NDRange<T> = (0..dims)
            .map(|d| {
                let mut lo = chunk[0].coords[d];
                let mut hi = lo;
                for c in chunk {
                    if c.coords[d] < lo {
                        lo = c.coords[d];
                    }
                    if c.coords[d] > hi {
                        hi = c.coords[d];
                    }
                }
                DimRange::new(lo, hi)
            })
            .collect();
        mbrs.push(mbr);

        let mut tiles = Vec::new();
        let mut coords_bytes = Vec::new();
        for c in chunk {
            for &v in &c.coords {
                v.put_le(&mut coords_bytes);
            }
        }
        tiles.push((COORDS.to_owned(), coords_bytes, None));

        for attr in &attrs {
            let var_sized = schema.var_size(attr).unwrap();
            let mut fixed = Vec::new();
            let mut var = Vec::new();
            for c in chunk {
                let v = &c
                    .values
                    .iter()
                    .find(|(a, _)| a == attr)
                    .expect("every cell carries every attribute")
                    .1;
                if var_sized {
                    fixed.extend_from_slice(&(var.len() as u64).to_le_bytes());
                    var.extend_from_slice(v);
                } else {
                    fixed.extend_from_slice(v);
                }
            }
            tiles.push((attr.clone(), fixed, var_sized.then_some(var)));
        }
        writer.push_tile(tiles);
    }

    let mut meta = FragmentMetadata::sparse(uri, 1, non_empty, mbrs);
    writer.finish(vfs, &mut meta);
    Arc::new(meta)
}

/// A ready-to-read query over the given fragments.
pub fn reader<T: CoordType>(
    schema: &Arc<ArraySchema<T>>,
    storage: &Arc<Storage>,
    fragments: Vec<Arc<FragmentMetadata<T>>>,
    subarray: Subarray<T>,
) -> Reader<T> {
    let mut r = Reader::new();
    r.set_array_schema(schema.clone());
    r.set_storage(storage.clone());
    r.set_fragment_metadata(fragments);
    r.set_subarray(subarray);
    r
}

pub fn le_i32s(bytes: &[u8]) -> Vec<i32> {
    bytes
        .chunks_exact(4)
        .map(|c| i32::from_le_bytes(c.try_into().unwrap()))
        .collect()
}

pub fn le_i64s(bytes: &[u8]) -> Vec<i64> {
    bytes
        .chunks_exact(8)
        .map(|c| i64::from_le_bytes(c.try_into().unwrap()))
        .collect()
}

pub fn le_u64s(bytes: &[u8]) -> Vec<u64> {
    bytes
        .chunks_exact(8)
        .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
        .collect()
}

pub fn le_f64s(bytes: &[u8]) -> Vec<f64> {
    bytes
        .chunks_exact(8)
        .map(|c| f64::from_le_bytes(c.try_into().unwrap()))
        .collect()
}

/// Drain a query to completion, concatenating the fixed-stream bytes of
/// `attr` across `read` calls. Panics if the query cannot progress.
pub fn drain<T: tessera_read::CoordRead>(
    reader: &mut Reader<T>,
    attr: &str,
    buf_len: usize,
) -> Vec<u8> {
    let mut out = Vec::new();
    let mut guard = 0;
    loop {
        let mut data = vec![0u8; buf_len];
        let mut bufs = QueryBuffers::new();
        bufs.set_fixed(attr, &mut data);
        reader.read(&mut bufs).unwrap();
        let (size, _) = bufs.sizes(attr).unwrap();
        out.extend_from_slice(&data[..size as usize]);
        if !reader.incomplete() {
            return out;
        }
        if size == 0 {
            guard += 1;
            assert!(guard < 4, "query stopped making progress");
        } else {
            guard = 0;
        }
    }
}

/// Bytes of one little-endian `i32`.
pub fn i32v(v: i32) -> Vec<u8> {
    v.to_le_bytes().to_vec()
}

pub fn i64v(v: i64) -> Vec<u8> {
    v.to_le_bytes().to_vec()
}

pub fn f64v(v: f64) -> Vec<u8> {
    v.to_le_bytes().to_vec()
}

pub const VAR_OFFSET: u64 = CELL_VAR_OFFSET_SIZE;
