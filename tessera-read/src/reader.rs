//! Reader orchestration.
//!
//! The [`Reader`] drives the whole read path: it seeds the partitioner
//! with the caller's buffer budgets, then loops sub-regions through the
//! dense or sparse pipeline. A sub-region that overflows the buffers is
//! split and retried without advancing; a sub-region with no results is
//! skipped; a single cell that still overflows is surfaced to the caller,
//! who must grow their buffers. [`Reader::incomplete`] stays true until
//! the partitioner is exhausted without overflow.

use std::sync::Arc;

use log::{debug, trace};
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use tessera_core::{
    ArraySchema, Cancellation, CoordType, Config, DenseCoord, EncryptionKey, FragmentMetadata,
    Layout, MemoryBudget, Subarray, COORDS,
};
use tessera_error::{tessera_bail, tessera_err, TesseraExpect, TesseraResult};

use crate::buffers::QueryBuffers;
use crate::coords::{
    compute_cell_ranges, compute_tile_coords, dedup_coords, gather_range_coords, sort_coords,
    CoordData, ResultCoord,
};
use crate::copier::{copy_cells, fill_coords};
use crate::dense::{compute_dense_ranges, SparseOverride};
use crate::fetcher::{dense_fetch_attrs, fetch_and_decode, FetchContext};
use crate::locator::locate_sparse_tiles;
use crate::partitioner::SubarrayPartitioner;
use crate::{CellRange, Storage};

/// Declared output capacity of one attribute, fed to the partitioner as
/// its result budget.
#[derive(Debug, Clone, Copy)]
struct DeclaredBuffer {
    fixed: u64,
    var: Option<u64>,
}

#[derive(Debug)]
struct ReadState<T: CoordType> {
    partitioner: SubarrayPartitioner<T>,
    overflowed: bool,
}

/// A read query over an array with `T`-typed dimensions.
#[derive(Debug)]
pub struct Reader<T: CoordType> {
    schema: Option<Arc<ArraySchema<T>>>,
    fragments: Vec<Arc<FragmentMetadata<T>>>,
    storage: Option<Arc<Storage>>,
    config: Config,
    layout: Layout,
    sparse_mode: bool,
    subarray: Option<Subarray<T>>,
    encryption: EncryptionKey,
    cancellation: Cancellation,
    attrs: Vec<String>,
    declared: FxHashMap<String, DeclaredBuffer>,
    state: Option<ReadState<T>>,
}

impl<T: CoordType> Default for Reader<T> {
    fn default() -> Self {
        Self {
            schema: None,
            fragments: Vec::new(),
            storage: None,
            config: Config::default(),
            layout: Layout::RowMajor,
            sparse_mode: false,
            subarray: None,
            encryption: EncryptionKey::default(),
            cancellation: Cancellation::new(),
            attrs: Vec::new(),
            declared: FxHashMap::default(),
            state: None,
        }
    }
}

impl<T: CoordType> Reader<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_array_schema(&mut self, schema: Arc<ArraySchema<T>>) {
        self.schema = Some(schema);
    }

    pub fn set_storage(&mut self, storage: Arc<Storage>) {
        self.storage = Some(storage);
    }

    /// Fragments in commit order: a later index overwrites earlier ones at
    /// shared coordinates.
    pub fn set_fragment_metadata(&mut self, fragments: Vec<Arc<FragmentMetadata<T>>>) {
        self.fragments = fragments;
    }

    pub fn set_config(&mut self, config: Config) {
        self.config = config;
    }

    pub fn set_layout(&mut self, layout: Layout) {
        self.layout = layout;
    }

    pub fn set_encryption_key(&mut self, key: EncryptionKey) {
        self.encryption = key;
    }

    /// A clone of the query's cancellation token.
    pub fn cancellation(&self) -> Cancellation {
        self.cancellation.clone()
    }

    /// Read a dense array's sparse fragments as if the array were sparse.
    /// Only valid for dense arrays whose open snapshot holds sparse
    /// fragments exclusively.
    pub fn set_sparse_mode(&mut self, sparse_mode: bool) -> TesseraResult<()> {
        let schema = self.schema_ref()?;
        if !schema.dense() {
            tessera_bail!(InvalidAttribute: "sparse mode only applies to dense arrays");
        }
        if self.fragments.iter().any(|f| f.is_dense()) {
            tessera_bail!(
                InvalidAttribute: "sparse mode needs an array opened with only sparse fragments"
            );
        }
        self.sparse_mode = sparse_mode;
        Ok(())
    }

    /// The query region; the reader adopts its layout.
    pub fn set_subarray(&mut self, subarray: Subarray<T>) {
        self.layout = subarray.layout();
        self.subarray = Some(subarray);
    }

    /// Declare a fixed-size output buffer of `capacity` bytes for `attr`.
    pub fn set_buffer(&mut self, attr: &str, capacity: u64) -> TesseraResult<()> {
        let schema = self.schema_ref()?;
        if schema.var_size(attr)? {
            tessera_bail!(VarLengthMismatch: "attribute '{attr}' is var-sized");
        }
        self.declare(attr, DeclaredBuffer {
            fixed: capacity,
            var: None,
        })
    }

    /// Declare offset and value buffers for a var-sized `attr`.
    pub fn set_buffer_var(
        &mut self,
        attr: &str,
        offsets_capacity: u64,
        var_capacity: u64,
    ) -> TesseraResult<()> {
        let schema = self.schema_ref()?;
        if !schema.var_size(attr)? {
            tessera_bail!(VarLengthMismatch: "attribute '{attr}' is fixed-size");
        }
        self.declare(attr, DeclaredBuffer {
            fixed: offsets_capacity,
            var: Some(var_capacity),
        })
    }

    fn declare(&mut self, attr: &str, buffer: DeclaredBuffer) -> TesseraResult<()> {
        let exists = self.declared.contains_key(attr);
        if self.state.is_some() && !exists {
            tessera_bail!(
                InvalidAttribute: "cannot declare a buffer for new attribute '{attr}' after init"
            );
        }
        if !exists {
            self.attrs.push(attr.to_owned());
        }
        self.declared.insert(attr.to_owned(), buffer);
        if let Some(state) = self.state.as_mut() {
            match buffer.var {
                None => state.partitioner.set_result_budget(attr, buffer.fixed)?,
                Some(v) => state
                    .partitioner
                    .set_result_budget_var(attr, buffer.fixed, v)?,
            }
        }
        Ok(())
    }

    /// Validate the configuration and seed the partitioner. Required
    /// before the first `read`.
    pub fn init(&mut self) -> TesseraResult<()> {
        if self.storage.is_none() {
            tessera_bail!(NotInitialized: "storage not set");
        }
        let schema = self.schema_ref()?.clone();
        if self.attrs.is_empty() {
            tessera_bail!(NotInitialized: "no buffers declared");
        }
        let memory_budget = MemoryBudget::from_config(&self.config)?;

        // 1-D arrays have a single meaningful traversal.
        if schema.dim_num() == 1 {
            self.layout = Layout::GlobalOrder;
        }

        let mut subarray = self
            .subarray
            .clone()
            .unwrap_or_else(|| Subarray::new(schema.domain(), self.layout));
        subarray.set_layout(self.layout);
        self.subarray = Some(subarray.clone());

        let mut partitioner = SubarrayPartitioner::new(
            schema,
            self.fragments.clone(),
            subarray,
            self.sparse_mode,
        );
        for (attr, buffer) in &self.declared {
            match buffer.var {
                None => partitioner.set_result_budget(attr, buffer.fixed)?,
                Some(v) => partitioner.set_result_budget_var(attr, buffer.fixed, v)?,
            }
        }
        partitioner.set_memory_budget(memory_budget.fixed, memory_budget.var);

        self.state = Some(ReadState {
            partitioner,
            overflowed: false,
        });
        Ok(())
    }

    /// True while the query has more to produce: either the last attempt
    /// overflowed or the partitioner still holds sub-regions.
    pub fn incomplete(&self) -> bool {
        self.state
            .as_ref()
            .is_some_and(|s| s.overflowed || !s.partitioner.done())
    }

    pub fn array_schema(&self) -> Option<&Arc<ArraySchema<T>>> {
        self.schema.as_ref()
    }

    pub fn attributes(&self) -> &[String] {
        &self.attrs
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn subarray(&self) -> Option<&Subarray<T>> {
        self.subarray.as_ref()
    }

    pub fn last_fragment_uri(&self) -> Option<&str> {
        self.fragments.last().map(|f| f.uri())
    }

    fn schema_ref(&self) -> TesseraResult<&Arc<ArraySchema<T>>> {
        self.schema
            .as_ref()
            .ok_or_else(|| tessera_err!(NotInitialized: "array schema not set"))
    }

    fn set_overflowed(&mut self, overflowed: bool) {
        if let Some(state) = self.state.as_mut() {
            state.overflowed = overflowed;
        }
    }

    fn validate_buffers(&self, buffers: &QueryBuffers<'_>) -> TesseraResult<()> {
        for attr in &self.attrs {
            let buf = buffers
                .get(attr)
                .ok_or_else(|| tessera_err!(InvalidAttribute: "no buffer passed for '{attr}'"))?;
            let declared_var = self.declared[attr].var.is_some();
            if declared_var != buf.var.is_some() {
                tessera_bail!(VarLengthMismatch: "buffer flavor for '{attr}' changed since declaration");
            }
        }
        for attr in buffers.attrs() {
            if !self.declared.contains_key(attr) {
                tessera_bail!(InvalidAttribute: "buffer for undeclared attribute '{attr}'");
            }
        }
        Ok(())
    }

    /// Process one sub-region of a sparse read (or a dense array in sparse
    /// mode). Returns whether a buffer overflowed.
    fn sparse_partition(
        &mut self,
        partition: &Subarray<T>,
        buffers: &mut QueryBuffers<'_>,
    ) -> TesseraResult<bool> {
        let schema = self.schema_ref()?.clone();
        let storage = self
            .storage
            .clone()
            .tessera_expect("storage checked at init");
        let mut overflowed = false;

        let mut set = locate_sparse_tiles(partition, &self.fragments);
        if set.is_empty() {
            return Ok(false);
        }
        trace!("sparse sub-region overlaps {} tile(s)", set.len());

        let ctx = FetchContext {
            schema: &schema,
            fragments: &self.fragments,
            storage: &storage,
            encryption: &self.encryption,
            cancellation: &self.cancellation,
        };
        fetch_and_decode(&ctx, &[COORDS.to_owned()], &mut set)?;
        let coord_data = CoordData::<T>::from_set(&set, schema.dim_num());

        // Resolve each range independently, in parallel: gather, order and
        // dedup (the dedup pass is unnecessary for single-fragment ranges).
        let set_ref = &set;
        let coord_ref = &coord_data;
        let layout = self.layout;
        let per_range: Vec<Vec<ResultCoord>> = (0..partition.range_num())
            .into_par_iter()
            .map(|r| -> TesseraResult<Vec<ResultCoord>> {
                self.cancellation.check()?;
                let range = partition.range(r);
                let mut coords = gather_range_coords(set_ref, coord_ref, &range, r as usize);
                if !set_ref.single_fragment[r as usize] {
                    let tc = compute_tile_coords(schema.domain(), coord_ref, &mut coords);
                    sort_coords(schema.domain(), set_ref, coord_ref, &tc, layout, &mut coords);
                    dedup_coords(set_ref, coord_ref, &mut coords);
                }
                Ok(coords)
            })
            .collect::<TesseraResult<_>>()?;

        // The final order: a whole-subarray sort for row/col layouts;
        // global and unordered results stay range-major.
        let mut all: Vec<ResultCoord> = per_range
            .into_iter()
            .flatten()
            .filter(|c| c.valid)
            .collect();
        if matches!(self.layout, Layout::RowMajor | Layout::ColMajor) {
            let tc = compute_tile_coords(schema.domain(), &coord_data, &mut all);
            sort_coords(schema.domain(), &set, &coord_data, &tc, self.layout, &mut all);
        }

        let mut cell_ranges: Vec<CellRange> = Vec::new();
        compute_cell_ranges(&all, &mut cell_ranges);
        drop(all);

        // Coordinates first, then one attribute at a time, dropping each
        // attribute's tiles as soon as it is copied to cap memory.
        if buffers.contains(COORDS) {
            copy_cells(
                &schema,
                &set,
                &cell_ranges,
                COORDS,
                buffers,
                &mut overflowed,
                &self.cancellation,
            )?;
        }
        set.clear_attr(COORDS);

        let attrs = self.attrs.clone();
        for attr in &attrs {
            if overflowed || attr.as_str() == COORDS {
                continue;
            }
            fetch_and_decode(&ctx, std::slice::from_ref(attr), &mut set)?;
            copy_cells(
                &schema,
                &set,
                &cell_ranges,
                attr,
                buffers,
                &mut overflowed,
                &self.cancellation,
            )?;
            set.clear_attr(attr);
        }
        Ok(overflowed)
    }
}

impl<T: DenseCoord> Reader<T> {
    /// Process one sub-region of a dense read. Returns whether a buffer
    /// overflowed.
    fn dense_partition_impl(
        &mut self,
        partition: &Subarray<T>,
        buffers: &mut QueryBuffers<'_>,
    ) -> TesseraResult<bool> {
        let schema = self.schema_ref()?.clone();
        let storage = self
            .storage
            .clone()
            .tessera_expect("storage checked at init");
        let mut overflowed = false;

        // Sparse fragments override dense cells; their coordinates come in
        // first.
        let mut set = locate_sparse_tiles(partition, &self.fragments);
        let ctx = FetchContext {
            schema: &schema,
            fragments: &self.fragments,
            storage: &storage,
            encryption: &self.encryption,
            cancellation: &self.cancellation,
        };
        if !set.is_empty() {
            fetch_and_decode(&ctx, &[COORDS.to_owned()], &mut set)?;
        }
        let coord_data = CoordData::<T>::from_set(&set, schema.dim_num());

        let mut cell_ranges: Vec<CellRange> = Vec::new();
        let mut regions = Vec::with_capacity(partition.range_num() as usize);
        let mut scratch: Vec<u64> = Vec::new();
        for r in 0..partition.range_num() {
            self.cancellation.check()?;
            let range = partition.range(r);

            let mut coords = gather_range_coords(&set, &coord_data, &range, r as usize);
            // The splice below consumes coordinates in walk order, so sort
            // even when dedup is unnecessary. Unordered dense reads walk
            // tile by tile, like global order.
            let sort_layout = match self.layout {
                Layout::Unordered => Layout::GlobalOrder,
                other => other,
            };
            let tc = compute_tile_coords(schema.domain(), &coord_data, &mut coords);
            sort_coords(schema.domain(), &set, &coord_data, &tc, sort_layout, &mut coords);
            if !set.single_fragment[r as usize] {
                dedup_coords(&set, &coord_data, &mut coords);
            }
            let overrides: Vec<SparseOverride> = coords
                .iter()
                .filter(|c| c.valid)
                .map(|c| {
                    let cs = coord_data.coords(c);
                    schema.domain().tile_coords_of(cs, &mut scratch);
                    SparseOverride {
                        tile_coords: scratch.clone(),
                        dense_pos: schema.domain().cell_pos_in_tile(cs),
                        fragment: set.tiles[c.tile].fragment,
                        sparse_tile: c.tile,
                        sparse_pos: c.pos,
                    }
                })
                .collect();

            compute_dense_ranges(
                &schema,
                &self.fragments,
                &range,
                self.layout,
                &overrides,
                &mut set,
                &mut cell_ranges,
            )?;
            regions.push(range);
        }
        debug!(
            "dense sub-region resolved to {} cell range(s) over {} tile(s)",
            cell_ranges.len(),
            set.len()
        );

        let fetch_attrs = dense_fetch_attrs(&self.attrs);
        fetch_and_decode(&ctx, &fetch_attrs, &mut set)?;

        for attr in &self.attrs.clone() {
            if overflowed || attr.as_str() == COORDS {
                continue;
            }
            copy_cells(
                &schema,
                &set,
                &cell_ranges,
                attr,
                buffers,
                &mut overflowed,
                &self.cancellation,
            )?;
        }
        if !overflowed && buffers.contains(COORDS) {
            fill_coords(&schema, &regions, self.layout, buffers, &mut overflowed)?;
        }
        Ok(overflowed)
    }
}

/// Coordinate types a [`Reader`] can run over.
///
/// Integral coordinates route dense sub-regions into the dense merger;
/// the real-valued implementations never reach their dense arm because
/// schemas reject dense arrays over real domains.
pub trait CoordRead: CoordType {
    #[doc(hidden)]
    fn dense_partition(
        reader: &mut Reader<Self>,
        partition: &Subarray<Self>,
        buffers: &mut QueryBuffers<'_>,
    ) -> TesseraResult<bool>;
}

macro_rules! dense_coord_read {
    ($($t:ty),*) => {$(
        impl CoordRead for $t {
            fn dense_partition(
                reader: &mut Reader<Self>,
                partition: &Subarray<Self>,
                buffers: &mut QueryBuffers<'_>,
            ) -> TesseraResult<bool> {
                reader.dense_partition_impl(partition, buffers)
            }
        }
    )*};
}

macro_rules! sparse_only_coord_read {
    ($($t:ty),*) => {$(
        impl CoordRead for $t {
            fn dense_partition(
                _reader: &mut Reader<Self>,
                _partition: &Subarray<Self>,
                _buffers: &mut QueryBuffers<'_>,
            ) -> TesseraResult<bool> {
                Err(tessera_err!(
                    UnsupportedDomainType: "dense reads are not defined over real domains"
                ))
            }
        }
    )*};
}

dense_coord_read!(i8, u8, i16, u16, i32, u32, i64, u64);
sparse_only_coord_read!(f32, f64);

impl<T: CoordRead> Reader<T> {
    /// Fill the caller's buffers with the next batch of results.
    ///
    /// Sizes in `buffers` are set to the bytes written; zero everywhere
    /// with `incomplete() == false` means the query is finished, while
    /// zero with `incomplete() == true` means the buffers are too small
    /// for even a single cell.
    pub fn read(&mut self, buffers: &mut QueryBuffers<'_>) -> TesseraResult<()> {
        let result = self.read_inner(buffers);
        if result.is_err() {
            buffers.zero_sizes();
            self.set_overflowed(false);
        }
        result
    }

    fn read_inner(&mut self, buffers: &mut QueryBuffers<'_>) -> TesseraResult<()> {
        if self.state.is_none() {
            tessera_bail!(NotInitialized: "init() was not called");
        }
        self.validate_buffers(buffers)?;
        self.cancellation.check()?;
        buffers.zero_sizes();

        if self.fragments.is_empty() {
            let state = self.state.as_mut().tessera_expect("state checked above");
            state.partitioner.finish();
            state.overflowed = false;
            return Ok(());
        }

        {
            let state = self.state.as_mut().tessera_expect("state checked above");
            if !state.partitioner.unsplittable() {
                state.partitioner.next()?;
            }
        }

        loop {
            let Some(partition) = self
                .state
                .as_ref()
                .and_then(|s| s.partitioner.current())
                .cloned()
            else {
                self.set_overflowed(false);
                return Ok(());
            };

            buffers.zero_sizes();
            self.set_overflowed(false);
            let dense = self
                .schema_ref()?
                .dense()
                && !self.sparse_mode;
            let overflowed = if dense {
                T::dense_partition(self, &partition, buffers)?
            } else {
                self.sparse_partition(&partition, buffers)?
            };

            if overflowed {
                trace!("sub-region overflowed, splitting");
                buffers.zero_sizes();
                self.set_overflowed(true);
                let state = self.state.as_mut().tessera_expect("state checked above");
                state.partitioner.split_current()?;
                if state.partitioner.unsplittable() {
                    // The caller must grow their buffers; the same cell is
                    // retried on the next call.
                    return Ok(());
                }
            } else {
                self.set_overflowed(false);
                let state = self.state.as_mut().tessera_expect("state checked above");
                state.partitioner.clear_unsplittable();
                if !buffers.no_results() {
                    return Ok(());
                }
                if state.partitioner.next()?.is_none() {
                    return Ok(());
                }
            }
        }
    }
}

macro_rules! typed_readers {
    ($(($variant:ident, $t:ty)),* $(,)?) => {
        /// A reader dispatched over the runtime coordinate type, for
        /// callers that only learn the dimension type when opening the
        /// array. Built once at query start from a typed [`Reader`].
        #[derive(Debug)]
        pub enum TypedReader {
            $($variant(Reader<$t>),)*
        }

        $(
            impl From<Reader<$t>> for TypedReader {
                fn from(reader: Reader<$t>) -> Self {
                    Self::$variant(reader)
                }
            }
        )*

        impl TypedReader {
            pub fn read(&mut self, buffers: &mut QueryBuffers<'_>) -> TesseraResult<()> {
                match self {
                    $(Self::$variant(r) => r.read(buffers),)*
                }
            }

            pub fn incomplete(&self) -> bool {
                match self {
                    $(Self::$variant(r) => r.incomplete(),)*
                }
            }

            pub fn cancellation(&self) -> Cancellation {
                match self {
                    $(Self::$variant(r) => r.cancellation(),)*
                }
            }
        }
    };
}

typed_readers!(
    (Int8, i8),
    (UInt8, u8),
    (Int16, i16),
    (UInt16, u16),
    (Int32, i32),
    (UInt32, u32),
    (Int64, i64),
    (UInt64, u64),
    (Float32, f32),
    (Float64, f64),
);
