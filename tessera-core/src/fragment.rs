//! Fragment metadata.
//!
//! A fragment is the immutable result of one committed write. The reader
//! consumes fragments strictly through this metadata: where each attribute
//! tile lives on disk, how large it is persisted and decoded, and — for
//! sparse fragments — the bounding rectangle of every tile.

use rustc_hash::FxHashMap;
use tessera_error::{tessera_bail, TesseraResult};

use crate::coord::{CoordType, DenseCoord};
use crate::domain::{grid_pos, Domain, NDRange};
use crate::layout::CellOrder;

/// Per-tile byte bookkeeping for one stream of one attribute.
#[derive(Debug, Clone, Default)]
pub struct StreamMeta {
    /// On-disk start offset of each tile.
    pub offsets: Vec<u64>,
    /// On-disk (encoded) byte size of each tile.
    pub persisted_sizes: Vec<u64>,
    /// Decoded byte size of each tile.
    pub sizes: Vec<u64>,
}

impl StreamMeta {
    pub fn push_tile(&mut self, offset: u64, persisted_size: u64, size: u64) {
        self.offsets.push(offset);
        self.persisted_sizes.push(persisted_size);
        self.sizes.push(size);
    }
}

/// Both streams of one attribute; var-sized attributes carry a value
/// stream next to the offset stream.
#[derive(Debug, Clone, Default)]
pub struct AttrFileMeta {
    pub fixed: StreamMeta,
    pub var: Option<StreamMeta>,
}

/// Read-only metadata of one on-disk fragment.
///
/// Fragments are ordered by recency: the reader receives them oldest first,
/// and a larger index always wins at shared coordinates.
#[derive(Debug, Clone)]
pub struct FragmentMetadata<T: CoordType> {
    uri: String,
    dense: bool,
    format_version: u32,
    non_empty_domain: NDRange<T>,
    /// Tile-index ranges of the expanded non-empty domain (dense only).
    tile_grid: Option<Vec<(u64, u64)>>,
    tile_order: CellOrder,
    /// Minimum bounding rectangle per tile (sparse only).
    mbrs: Vec<NDRange<T>>,
    tile_num: u64,
    attrs: FxHashMap<String, AttrFileMeta>,
}

impl<T: CoordType> FragmentMetadata<T> {
    /// Metadata of a sparse fragment with one MBR per tile.
    pub fn sparse(
        uri: impl Into<String>,
        format_version: u32,
        non_empty_domain: NDRange<T>,
        mbrs: Vec<NDRange<T>>,
    ) -> Self {
        let tile_num = mbrs.len() as u64;
        Self {
            uri: uri.into(),
            dense: false,
            format_version,
            non_empty_domain,
            tile_grid: None,
            tile_order: CellOrder::RowMajor,
            mbrs,
            tile_num,
            attrs: FxHashMap::default(),
        }
    }

    pub fn set_attr_meta(&mut self, attr: impl Into<String>, meta: AttrFileMeta) {
        self.attrs.insert(attr.into(), meta);
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn is_dense(&self) -> bool {
        self.dense
    }

    pub fn format_version(&self) -> u32 {
        self.format_version
    }

    pub fn non_empty_domain(&self) -> &NDRange<T> {
        &self.non_empty_domain
    }

    pub fn mbrs(&self) -> &[NDRange<T>] {
        &self.mbrs
    }

    pub fn tile_num(&self) -> u64 {
        self.tile_num
    }

    /// Tile-index ranges this dense fragment covers.
    pub fn tile_grid(&self) -> Option<&[(u64, u64)]> {
        self.tile_grid.as_deref()
    }

    /// URI of the fixed stream of `attr`.
    pub fn attr_uri(&self, attr: &str) -> String {
        format!("{}/{attr}.dat", self.uri)
    }

    /// URI of the value stream of a var-sized `attr`.
    pub fn attr_var_uri(&self, attr: &str) -> String {
        format!("{}/{attr}_var.dat", self.uri)
    }

    pub fn file_offset(&self, attr: &str, tile_idx: u64) -> TesseraResult<u64> {
        self.stream(attr)
            .and_then(|s| s.offsets.get(tile_idx as usize).copied())
            .ok_or_else(|| self.missing(attr, tile_idx))
    }

    pub fn persisted_tile_size(&self, attr: &str, tile_idx: u64) -> TesseraResult<u64> {
        self.stream(attr)
            .and_then(|s| s.persisted_sizes.get(tile_idx as usize).copied())
            .ok_or_else(|| self.missing(attr, tile_idx))
    }

    pub fn tile_size(&self, attr: &str, tile_idx: u64) -> TesseraResult<u64> {
        self.stream(attr)
            .and_then(|s| s.sizes.get(tile_idx as usize).copied())
            .ok_or_else(|| self.missing(attr, tile_idx))
    }

    pub fn file_var_offset(&self, attr: &str, tile_idx: u64) -> TesseraResult<u64> {
        self.var_stream(attr)
            .and_then(|s| s.offsets.get(tile_idx as usize).copied())
            .ok_or_else(|| self.missing(attr, tile_idx))
    }

    pub fn persisted_tile_var_size(&self, attr: &str, tile_idx: u64) -> TesseraResult<u64> {
        self.var_stream(attr)
            .and_then(|s| s.persisted_sizes.get(tile_idx as usize).copied())
            .ok_or_else(|| self.missing(attr, tile_idx))
    }

    pub fn tile_var_size(&self, attr: &str, tile_idx: u64) -> TesseraResult<u64> {
        self.var_stream(attr)
            .and_then(|s| s.sizes.get(tile_idx as usize).copied())
            .ok_or_else(|| self.missing(attr, tile_idx))
    }

    fn stream(&self, attr: &str) -> Option<&StreamMeta> {
        self.attrs.get(attr).map(|a| &a.fixed)
    }

    fn var_stream(&self, attr: &str) -> Option<&StreamMeta> {
        self.attrs.get(attr).and_then(|a| a.var.as_ref())
    }

    fn missing(&self, attr: &str, tile_idx: u64) -> tessera_error::TesseraError {
        tessera_error::tessera_err!(
            InvalidAttribute: "fragment '{}' has no tile {tile_idx} for attribute '{attr}'",
            self.uri
        )
    }
}

impl<T: DenseCoord> FragmentMetadata<T> {
    /// Metadata of a dense fragment covering `non_empty_domain` (expanded
    /// to tile boundaries on disk).
    pub fn dense(
        uri: impl Into<String>,
        format_version: u32,
        non_empty_domain: NDRange<T>,
        domain: &Domain<T>,
    ) -> TesseraResult<Self> {
        if !domain.contains_region(&non_empty_domain) {
            tessera_bail!(InvalidRange: "fragment domain escapes the array domain");
        }
        let grid = domain.tile_domain(&non_empty_domain);
        let tile_num: u64 = grid.iter().map(|&(lo, hi)| hi - lo + 1).product();
        Ok(Self {
            uri: uri.into(),
            dense: true,
            format_version,
            non_empty_domain,
            tile_grid: Some(grid),
            tile_order: domain.tile_order(),
            mbrs: Vec::new(),
            tile_num,
            attrs: FxHashMap::default(),
        })
    }

    /// This fragment's tile index for global tile coordinates, or an error
    /// when the tile lies outside the fragment.
    pub fn tile_pos(&self, tile_coords: &[u64]) -> TesseraResult<u64> {
        let grid = self
            .tile_grid
            .as_deref()
            .ok_or_else(|| tessera_error::tessera_err!("sparse fragments have no tile grid"))?;
        if tile_coords
            .iter()
            .zip(grid)
            .any(|(&c, &(lo, hi))| c < lo || c > hi)
        {
            tessera_bail!(
                "tile {tile_coords:?} lies outside fragment '{}'",
                self.uri
            );
        }
        Ok(grid_pos(tile_coords, grid, self.tile_order))
    }
}
