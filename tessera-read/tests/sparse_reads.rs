//! Sparse read-path scenarios: dedup across fragments, var-sized
//! attributes, traversal orders, capacity chunking, filters and real
//! domains.

mod common;

use std::sync::Arc;

use common::*;
use tessera_core::{
    ArraySchema, Attribute, ByteShuffle, CellOrder, Datatype, Dimension, Domain, FilterPipeline,
    Layout, Lz4, Subarray, COORDS,
};
use tessera_read::QueryBuffers;

fn schema_1d(capacity: u64) -> Arc<ArraySchema<i64>> {
    let domain = Domain::new(
        vec![Dimension::new("x", 1i64, 100)],
        None,
        CellOrder::RowMajor,
        CellOrder::RowMajor,
    )
    .unwrap();
    Arc::new(
        ArraySchema::build(
            false,
            domain,
            vec![Attribute::new("a", Datatype::Int32)],
            capacity,
        )
        .unwrap(),
    )
}

#[test]
fn dedup_keeps_newest_fragment() {
    let schema = schema_1d(10);
    let storage = storage();
    let f0 = build_sparse_fragment(&schema, &storage.vfs, "mem://f0", vec![
        SparseCell::new(vec![1], vec![("a", i32v(1))]),
        SparseCell::new(vec![5], vec![("a", i32v(2))]),
        SparseCell::new(vec![10], vec![("a", i32v(3))]),
    ]);
    let f1 = build_sparse_fragment(&schema, &storage.vfs, "mem://f1", vec![
        SparseCell::new(vec![5], vec![("a", i32v(4))]),
        SparseCell::new(vec![7], vec![("a", i32v(5))]),
    ]);

    let mut sub = Subarray::new(schema.domain(), Layout::GlobalOrder);
    sub.add_range(schema.domain(), 0, 1, 10).unwrap();

    let mut reader = reader(&schema, &storage, vec![f0, f1], sub);
    reader.set_buffer("a", 64).unwrap();
    reader.set_buffer(COORDS, 64).unwrap();
    reader.init().unwrap();

    let mut data = vec![0u8; 64];
    let mut coords = vec![0u8; 64];
    let mut bufs = QueryBuffers::new();
    bufs.set_fixed("a", &mut data);
    bufs.set_fixed(COORDS, &mut coords);
    reader.read(&mut bufs).unwrap();

    let (a_size, _) = bufs.sizes("a").unwrap();
    let (c_size, _) = bufs.sizes(COORDS).unwrap();
    assert_eq!(le_i64s(&coords[..c_size as usize]), vec![1, 5, 7, 10]);
    assert_eq!(le_i32s(&data[..a_size as usize]), vec![1, 4, 5, 3]);
    assert!(!reader.incomplete() || {
        // A follow-up call must report completion without new bytes.
        let mut data = vec![0u8; 64];
        let mut coords = vec![0u8; 64];
        let mut bufs = QueryBuffers::new();
        bufs.set_fixed("a", &mut data);
        bufs.set_fixed(COORDS, &mut coords);
        reader.read(&mut bufs).unwrap();
        bufs.no_results() && !reader.incomplete()
    });
}

#[test]
fn var_sized_attribute_offsets_and_values() {
    let domain = Domain::new(
        vec![Dimension::new("x", 1i64, 100)],
        None,
        CellOrder::RowMajor,
        CellOrder::RowMajor,
    )
    .unwrap();
    let schema = Arc::new(
        ArraySchema::build(
            false,
            domain,
            vec![Attribute::var("name", Datatype::Char)],
            10,
        )
        .unwrap(),
    );
    let storage = storage();
    let fragment = build_sparse_fragment(&schema, &storage.vfs, "mem://f0", vec![
        SparseCell::new(vec![1], vec![("name", b"ab".to_vec())]),
        SparseCell::new(vec![2], vec![("name", b"hello".to_vec())]),
        SparseCell::new(vec![3], vec![("name", Vec::new())]),
    ]);

    let mut sub = Subarray::new(schema.domain(), Layout::GlobalOrder);
    sub.add_range(schema.domain(), 0, 1, 3).unwrap();

    let mut reader = reader(&schema, &storage, vec![fragment], sub);
    reader.set_buffer_var("name", 24, 7).unwrap();
    reader.init().unwrap();

    let mut offsets = vec![0u8; 24];
    let mut values = vec![0u8; 7];
    let mut bufs = QueryBuffers::new();
    bufs.set_var("name", &mut offsets, &mut values);
    reader.read(&mut bufs).unwrap();

    let (off_size, var_size) = bufs.sizes("name").unwrap();
    assert_eq!(off_size, 24);
    assert_eq!(var_size, 7);
    assert_eq!(le_u64s(&offsets), vec![0, 2, 7]);
    assert_eq!(&values, b"abhello");
}

#[test]
fn capacity_chunks_into_tiles_with_mbrs() {
    let schema = schema_1d(2);
    let storage = storage();
    let fragment = build_sparse_fragment(&schema, &storage.vfs, "mem://f0", vec![
        SparseCell::new(vec![1], vec![("a", i32v(10))]),
        SparseCell::new(vec![2], vec![("a", i32v(20))]),
        SparseCell::new(vec![3], vec![("a", i32v(30))]),
        SparseCell::new(vec![4], vec![("a", i32v(40))]),
        SparseCell::new(vec![5], vec![("a", i32v(50))]),
    ]);
    assert_eq!(fragment.tile_num(), 3);

    let mut sub = Subarray::new(schema.domain(), Layout::GlobalOrder);
    sub.add_range(schema.domain(), 0, 2, 4).unwrap();

    let mut reader = reader(&schema, &storage, vec![fragment], sub);
    reader.set_buffer("a", 64).unwrap();
    reader.init().unwrap();

    let mut data = vec![0u8; 64];
    let mut bufs = QueryBuffers::new();
    bufs.set_fixed("a", &mut data);
    reader.read(&mut bufs).unwrap();

    let (size, _) = bufs.sizes("a").unwrap();
    assert_eq!(le_i32s(&data[..size as usize]), vec![20, 30, 40]);
}

#[test]
fn two_dimensional_row_major_across_fragments() {
    let domain = Domain::new(
        vec![Dimension::new("r", 1i32, 8), Dimension::new("c", 1i32, 8)],
        Some(vec![4, 4]),
        CellOrder::RowMajor,
        CellOrder::RowMajor,
    )
    .unwrap();
    let schema = Arc::new(
        ArraySchema::build(
            false,
            domain,
            vec![Attribute::new("a", Datatype::Int32)],
            4,
        )
        .unwrap(),
    );
    let storage = storage();
    let f0 = build_sparse_fragment(&schema, &storage.vfs, "mem://f0", vec![
        SparseCell::new(vec![1, 2], vec![("a", i32v(1))]),
        SparseCell::new(vec![2, 1], vec![("a", i32v(2))]),
        SparseCell::new(vec![5, 5], vec![("a", i32v(3))]),
    ]);
    let f1 = build_sparse_fragment(&schema, &storage.vfs, "mem://f1", vec![
        SparseCell::new(vec![1, 8], vec![("a", i32v(4))]),
        SparseCell::new(vec![2, 1], vec![("a", i32v(5))]),
    ]);

    let sub = Subarray::new(schema.domain(), Layout::RowMajor);
    let mut reader = reader(&schema, &storage, vec![f0, f1], sub);
    reader.set_buffer("a", 256).unwrap();
    reader.set_buffer(COORDS, 256).unwrap();
    reader.init().unwrap();

    let mut data = vec![0u8; 256];
    let mut coords = vec![0u8; 256];
    let mut bufs = QueryBuffers::new();
    bufs.set_fixed("a", &mut data);
    bufs.set_fixed(COORDS, &mut coords);
    reader.read(&mut bufs).unwrap();

    let (a_size, _) = bufs.sizes("a").unwrap();
    let (c_size, _) = bufs.sizes(COORDS).unwrap();
    assert_eq!(
        le_i32s(&coords[..c_size as usize]),
        vec![1, 2, 1, 8, 2, 1, 5, 5]
    );
    // (2, 1) resolves to the newer fragment's value.
    assert_eq!(le_i32s(&data[..a_size as usize]), vec![1, 4, 5, 3]);
}

#[test]
fn multi_range_subarray_emits_in_range_order() {
    let domain = Domain::new(
        vec![Dimension::new("r", 1i32, 8), Dimension::new("c", 1i32, 8)],
        Some(vec![4, 4]),
        CellOrder::RowMajor,
        CellOrder::RowMajor,
    )
    .unwrap();
    let schema = Arc::new(
        ArraySchema::build(
            false,
            domain,
            vec![Attribute::new("a", Datatype::Int32)],
            8,
        )
        .unwrap(),
    );
    let storage = storage();
    let fragment = build_sparse_fragment(&schema, &storage.vfs, "mem://f0", vec![
        SparseCell::new(vec![1, 1], vec![("a", i32v(11))]),
        SparseCell::new(vec![2, 2], vec![("a", i32v(22))]),
        SparseCell::new(vec![6, 1], vec![("a", i32v(61))]),
        SparseCell::new(vec![6, 3], vec![("a", i32v(63))]),
    ]);

    let mut sub = Subarray::new(schema.domain(), Layout::RowMajor);
    sub.add_range(schema.domain(), 0, 1, 2).unwrap();
    sub.add_range(schema.domain(), 0, 6, 6).unwrap();

    let mut reader = reader(&schema, &storage, vec![fragment], sub);
    reader.set_buffer("a", 256).unwrap();
    reader.init().unwrap();

    let mut data = vec![0u8; 256];
    let mut bufs = QueryBuffers::new();
    bufs.set_fixed("a", &mut data);
    reader.read(&mut bufs).unwrap();

    let (size, _) = bufs.sizes("a").unwrap();
    assert_eq!(le_i32s(&data[..size as usize]), vec![11, 22, 61, 63]);
}

#[test]
fn sparse_mode_skips_fill() {
    let domain = Domain::new(
        vec![Dimension::new("r", 1i32, 4), Dimension::new("c", 1i32, 4)],
        Some(vec![2, 2]),
        CellOrder::RowMajor,
        CellOrder::RowMajor,
    )
    .unwrap();
    let schema = Arc::new(
        ArraySchema::build(
            true,
            domain,
            vec![Attribute::new("a", Datatype::Int32)],
            4,
        )
        .unwrap(),
    );
    let storage = storage();
    let fragment = build_sparse_fragment(&schema, &storage.vfs, "mem://f0", vec![
        SparseCell::new(vec![1, 1], vec![("a", i32v(5))]),
        SparseCell::new(vec![3, 2], vec![("a", i32v(6))]),
    ]);

    let sub = Subarray::new(schema.domain(), Layout::RowMajor);
    let mut reader = reader(&schema, &storage, vec![fragment], sub);
    reader.set_sparse_mode(true).unwrap();
    reader.set_buffer("a", 64).unwrap();
    reader.init().unwrap();

    let mut data = vec![0u8; 64];
    let mut bufs = QueryBuffers::new();
    bufs.set_fixed("a", &mut data);
    reader.read(&mut bufs).unwrap();

    let (size, _) = bufs.sizes("a").unwrap();
    assert_eq!(le_i32s(&data[..size as usize]), vec![5, 6]);
}

#[test]
fn real_valued_domain_reads_sparsely() {
    let domain = Domain::new(
        vec![Dimension::new("x", 0.0f64, 100.0)],
        None,
        CellOrder::RowMajor,
        CellOrder::RowMajor,
    )
    .unwrap();
    let schema = Arc::new(
        ArraySchema::build(
            false,
            domain,
            vec![Attribute::new("a", Datatype::Float64)],
            10,
        )
        .unwrap(),
    );
    let storage = storage();
    let fragment = build_sparse_fragment(&schema, &storage.vfs, "mem://f0", vec![
        SparseCell::new(vec![1.5], vec![("a", f64v(0.25))]),
        SparseCell::new(vec![2.5], vec![("a", f64v(0.5))]),
        SparseCell::new(vec![7.25], vec![("a", f64v(0.75))]),
    ]);

    let mut sub = Subarray::new(schema.domain(), Layout::GlobalOrder);
    sub.add_range(schema.domain(), 0, 1.0, 3.0).unwrap();

    let mut reader = reader(&schema, &storage, vec![fragment], sub);
    reader.set_buffer("a", 64).unwrap();
    reader.set_buffer(COORDS, 64).unwrap();
    reader.init().unwrap();

    let mut data = vec![0u8; 64];
    let mut coords = vec![0u8; 64];
    let mut bufs = QueryBuffers::new();
    bufs.set_fixed("a", &mut data);
    bufs.set_fixed(COORDS, &mut coords);
    reader.read(&mut bufs).unwrap();

    let (a_size, _) = bufs.sizes("a").unwrap();
    let (c_size, _) = bufs.sizes(COORDS).unwrap();
    assert_eq!(le_f64s(&coords[..c_size as usize]), vec![1.5, 2.5]);
    assert_eq!(le_f64s(&data[..a_size as usize]), vec![0.25, 0.5]);
}

#[test]
fn filtered_tiles_decode_through_the_pipeline() {
    let domain = Domain::new(
        vec![Dimension::new("x", 1i64, 1000)],
        None,
        CellOrder::RowMajor,
        CellOrder::RowMajor,
    )
    .unwrap();
    let attr = Attribute::new("a", Datatype::Int32)
        .with_filters(FilterPipeline::new().add(ByteShuffle::new(4)).add(Lz4));
    let schema = Arc::new(
        ArraySchema::build(false, domain, vec![attr], 100)
            .unwrap()
            .with_coords_filters(FilterPipeline::new().add(Lz4)),
    );
    let storage = storage();
    let cells: Vec<SparseCell<i64>> = (1..=100)
        .map(|x| SparseCell::new(vec![x], vec![("a", i32v((x * 3) as i32))]))
        .collect();
    let fragment = build_sparse_fragment(&schema, &storage.vfs, "mem://f0", cells);

    let mut sub = Subarray::new(schema.domain(), Layout::GlobalOrder);
    sub.add_range(schema.domain(), 0, 10, 12).unwrap();

    let mut reader = reader(&schema, &storage, vec![fragment], sub);
    reader.set_buffer("a", 1024).unwrap();
    reader.init().unwrap();

    let mut data = vec![0u8; 1024];
    let mut bufs = QueryBuffers::new();
    bufs.set_fixed("a", &mut data);
    reader.read(&mut bufs).unwrap();

    let (size, _) = bufs.sizes("a").unwrap();
    assert_eq!(le_i32s(&data[..size as usize]), vec![30, 33, 36]);
}
