//! The decoded-tile cache.

use std::collections::VecDeque;
use std::sync::RwLock;

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tessera_error::TesseraExpect;

type CacheKey = (String, u64);

#[derive(Debug, Default)]
struct Inner {
    map: FxHashMap<CacheKey, Bytes>,
    queue: VecDeque<CacheKey>,
    bytes: u64,
}

/// A byte-budgeted cache of decoded tiles keyed by `(uri, offset)`.
///
/// Reads go through it before the VFS; decoded tiles are written back after
/// the reverse filter pipeline, so hits always arrive decoded. Eviction is
/// insertion-ordered.
#[derive(Debug)]
pub struct TileCache {
    inner: RwLock<Inner>,
    max_bytes: u64,
}

impl TileCache {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            max_bytes,
        }
    }

    pub fn get(&self, uri: &str, offset: u64) -> Option<Bytes> {
        self.inner
            .read()
            .tessera_expect("poisoned tile cache")
            .map
            .get(&(uri.to_owned(), offset))
            .cloned()
    }

    pub fn put(&self, uri: impl Into<String>, offset: u64, data: Bytes) {
        let key = (uri.into(), offset);
        let mut inner = self.inner.write().tessera_expect("poisoned tile cache");
        if let Some(old) = inner.map.insert(key.clone(), data.clone()) {
            inner.bytes -= old.len() as u64;
        } else {
            inner.queue.push_back(key);
        }
        inner.bytes += data.len() as u64;
        while inner.bytes > self.max_bytes {
            let Some(victim) = inner.queue.pop_front() else {
                break;
            };
            if let Some(evicted) = inner.map.remove(&victim) {
                inner.bytes -= evicted.len() as u64;
            }
        }
    }
}

impl Default for TileCache {
    fn default() -> Self {
        // Matches the default tile cache footprint of the storage manager.
        Self::new(10 * 1024 * 1024)
    }
}
