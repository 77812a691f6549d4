//! The tile fetcher.
//!
//! Resolves byte ranges for every overlapping tile, consults the
//! decoded-tile cache, batches misses into one coalesced read per file and
//! then runs the reverse filter pipeline over freshly read tiles in
//! parallel, writing the decoded bytes back through the cache.

use std::ops::Range;
use std::sync::Arc;

use bytes::Bytes;
use itertools::Itertools;
use log::debug;
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use tessera_core::{
    ArraySchema, Cancellation, CoordType, Datatype, EncryptionKey, FilterPipeline,
    FragmentMetadata, Tile, TilePair, COORDS,
};
use tessera_error::{tessera_err, TesseraResult};

use crate::locator::TileSet;
use crate::Storage;

/// Everything a fetch stage needs besides the tile set itself.
pub(crate) struct FetchContext<'a, T: CoordType> {
    pub schema: &'a ArraySchema<T>,
    pub fragments: &'a [Arc<FragmentMetadata<T>>],
    pub storage: &'a Storage,
    pub encryption: &'a EncryptionKey,
    pub cancellation: &'a Cancellation,
}

/// Where one freshly read region lands: an arena tile's fixed or var
/// stream.
struct Dest {
    tile: usize,
    attr: String,
    var: bool,
}

/// Populate every tile of `set` with the raw bytes of `attrs`, fixed and
/// var streams alike. Cache hits arrive already decoded; misses are read
/// through the VFS, coalesced per file and issued in parallel.
pub(crate) fn read_tiles<T: CoordType>(
    ctx: &FetchContext<'_, T>,
    attrs: &[String],
    set: &mut TileSet,
) -> TesseraResult<()> {
    if set.is_empty() || attrs.is_empty() {
        return Ok(());
    }

    let mut per_uri: FxHashMap<String, (Vec<Range<u64>>, Vec<Dest>)> = FxHashMap::default();
    for (idx, tile) in set.tiles.iter_mut().enumerate() {
        ctx.cancellation.check()?;
        let fragment = &ctx.fragments[tile.fragment];
        for attr in attrs {
            if tile.attr_tiles.contains_key(attr) {
                continue;
            }
            let var = ctx.schema.var_size(attr)?;
            let cell_size = ctx.schema.cell_size(attr)?;
            let fixed_type = if var {
                Datatype::UInt64
            } else {
                ctx.schema.type_of(attr)?
            };
            let mut pair = if var {
                let value_type = ctx.schema.type_of(attr)?;
                TilePair::with_var(
                    Tile::new(fixed_type, cell_size),
                    Tile::new(value_type, value_type.size()),
                )
            } else {
                TilePair::fixed(Tile::new(fixed_type, cell_size))
            };

            let uri = fragment.attr_uri(attr);
            let offset = fragment.file_offset(attr, tile.tile_idx)?;
            let persisted = fragment.persisted_tile_size(attr, tile.tile_idx)?;
            match ctx.storage.cache.get(&uri, offset) {
                Some(hit) => pair.fixed.set_data(hit, true),
                None => {
                    let (regions, dests) = per_uri.entry(uri).or_default();
                    regions.push(offset..offset + persisted);
                    dests.push(Dest {
                        tile: idx,
                        attr: attr.clone(),
                        var: false,
                    });
                }
            }

            if var {
                let var_uri = fragment.attr_var_uri(attr);
                let var_offset = fragment.file_var_offset(attr, tile.tile_idx)?;
                let var_persisted = fragment.persisted_tile_var_size(attr, tile.tile_idx)?;
                match ctx.storage.cache.get(&var_uri, var_offset) {
                    Some(hit) => {
                        if let Some(v) = pair.var.as_mut() {
                            v.set_data(hit, true);
                        }
                    }
                    None => {
                        let (regions, dests) = per_uri.entry(var_uri).or_default();
                        regions.push(var_offset..var_offset + var_persisted);
                        dests.push(Dest {
                            tile: idx,
                            attr: attr.clone(),
                            var: true,
                        });
                    }
                }
            }

            tile.attr_tiles.insert(attr.clone(), pair);
        }
    }

    if per_uri.is_empty() {
        return Ok(());
    }
    debug!(
        "reading {} file(s) for {} attribute(s)",
        per_uri.len(),
        attrs.len()
    );

    // One coalesced read per file, all files in flight at once.
    let mut pending = Vec::with_capacity(per_uri.len());
    for (uri, (regions, dests)) in per_uri {
        let fut = ctx.storage.vfs.read_all(&uri, regions, ctx.cancellation)?;
        pending.push((fut, dests));
    }
    for (fut, dests) in pending {
        let chunks = futures::executor::block_on(fut)?;
        for (bytes, dest) in chunks.into_iter().zip_eq(dests) {
            let pair = set.tiles[dest.tile]
                .attr_tiles
                .get_mut(&dest.attr)
                .ok_or_else(|| tessera_err!("read destination lost its tile"))?;
            let stream = if dest.var {
                pair.var
                    .as_mut()
                    .ok_or_else(|| tessera_err!("read destination lost its var stream"))?
            } else {
                &mut pair.fixed
            };
            stream.set_data(bytes, false);
        }
        ctx.cancellation.check()?;
    }
    Ok(())
}

/// Run the reverse filter pipeline over every not-yet-decoded tile of
/// `attrs`, in parallel across tiles, and write the decoded bytes back to
/// the cache.
pub(crate) fn filter_tiles<T: CoordType>(
    ctx: &FetchContext<'_, T>,
    attrs: &[String],
    set: &mut TileSet,
) -> TesseraResult<()> {
    if set.is_empty() {
        return Ok(());
    }

    // Assemble pipelines once; decryption runs first on the reverse pass.
    let mut pipelines: Vec<(String, FilterPipeline, Option<FilterPipeline>)> =
        Vec::with_capacity(attrs.len());
    for attr in attrs {
        let var = ctx.schema.var_size(attr)?;
        let (fixed, var_pipe) = if var {
            (
                ctx.schema.offsets_filters().with_encryption(ctx.encryption)?,
                Some(ctx.schema.filters_for(attr).with_encryption(ctx.encryption)?),
            )
        } else {
            (
                ctx.schema.filters_for(attr).with_encryption(ctx.encryption)?,
                None,
            )
        };
        pipelines.push((attr.clone(), fixed, var_pipe));
    }

    let fragments = ctx.fragments;
    let cache = &ctx.storage.cache;
    set.tiles
        .par_iter_mut()
        .try_for_each(|tile| -> TesseraResult<()> {
            ctx.cancellation.check()?;
            let fragment = &fragments[tile.fragment];
            for (attr, fixed_pipe, var_pipe) in &pipelines {
                let Some(pair) = tile.attr_tiles.get_mut(attr) else {
                    continue;
                };
                if !pair.fixed.filtered() {
                    let decoded = fixed_pipe.run_reverse(pair.fixed.data().clone())?;
                    expect_decoded_len(&decoded, fragment.tile_size(attr, tile.tile_idx)?)?;
                    pair.fixed.set_data(decoded.clone(), true);
                    cache.put(
                        fragment.attr_uri(attr),
                        fragment.file_offset(attr, tile.tile_idx)?,
                        decoded,
                    );
                }
                if let (Some(var_tile), Some(pipe)) = (pair.var.as_mut(), var_pipe) {
                    if !var_tile.filtered() {
                        let decoded = pipe.run_reverse(var_tile.data().clone())?;
                        expect_decoded_len(&decoded, fragment.tile_var_size(attr, tile.tile_idx)?)?;
                        var_tile.set_data(decoded.clone(), true);
                        cache.put(
                            fragment.attr_var_uri(attr),
                            fragment.file_var_offset(attr, tile.tile_idx)?,
                            decoded,
                        );
                    }
                }
            }
            Ok(())
        })?;
    ctx.cancellation.check()
}

fn expect_decoded_len(decoded: &Bytes, logical: u64) -> TesseraResult<()> {
    if decoded.len() as u64 != logical {
        return Err(tessera_err!(
            Decode: "decoded tile is {} bytes, metadata says {logical}",
            decoded.len()
        ));
    }
    Ok(())
}

/// Convenience: fetch and decode in one go.
pub(crate) fn fetch_and_decode<T: CoordType>(
    ctx: &FetchContext<'_, T>,
    attrs: &[String],
    set: &mut TileSet,
) -> TesseraResult<()> {
    read_tiles(ctx, attrs, set)?;
    filter_tiles(ctx, attrs, set)
}

/// The attribute list a dense read fetches: every requested attribute
/// except the synthetic coordinates.
pub(crate) fn dense_fetch_attrs(attrs: &[String]) -> Vec<String> {
    attrs.iter().filter(|a| a.as_str() != COORDS).cloned().collect()
}
