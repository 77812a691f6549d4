//! The virtual file system.

use std::future::Future;
use std::ops::Range;
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use futures::channel::oneshot;
use rustc_hash::FxHashMap;
use tessera_core::Cancellation;
use tessera_error::{tessera_err, TesseraExpect, TesseraResult};

use crate::ranges::{coalesce_regions, slice_regions, CoalescePolicy};
use crate::read::ReadAt;
use crate::IoDispatcher;

/// A registry of readable objects addressed by URI, issuing coalesced
/// parallel reads through an [`IoDispatcher`].
#[derive(Debug)]
pub struct Vfs {
    dispatcher: Arc<IoDispatcher>,
    files: RwLock<FxHashMap<String, Arc<dyn ReadAt>>>,
    policy: CoalescePolicy,
}

impl Vfs {
    pub fn new(dispatcher: Arc<IoDispatcher>) -> Self {
        Self {
            dispatcher,
            files: RwLock::new(FxHashMap::default()),
            policy: CoalescePolicy::default(),
        }
    }

    pub fn with_coalesce_policy(mut self, policy: CoalescePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Make `uri` readable through this VFS.
    pub fn register(&self, uri: impl Into<String>, reader: Arc<dyn ReadAt>) {
        self.files
            .write()
            .tessera_expect("poisoned vfs registry")
            .insert(uri.into(), reader);
    }

    /// Open a local file and register it under `uri`.
    pub fn register_file(&self, uri: impl Into<String>, path: &std::path::Path) -> TesseraResult<()> {
        let file = std::fs::File::open(path)?;
        self.register(uri, Arc::new(file));
        Ok(())
    }

    fn reader(&self, uri: &str) -> TesseraResult<Arc<dyn ReadAt>> {
        self.files
            .read()
            .tessera_expect("poisoned vfs registry")
            .get(uri)
            .cloned()
            .ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::NotFound, format!("no object at '{uri}'"))
                    .into()
            })
    }

    /// Read every region of `uri`, coalescing nearby regions into one IO
    /// and running the coalesced reads in parallel on the dispatcher.
    /// Every worker checks `cancellation` before touching storage.
    ///
    /// The returned future resolves to one `Bytes` per requested region,
    /// in request order.
    pub fn read_all(
        &self,
        uri: &str,
        regions: Vec<Range<u64>>,
        cancellation: &Cancellation,
    ) -> TesseraResult<impl Future<Output = TesseraResult<Vec<Bytes>>> + Send + 'static> {
        let reader = self.reader(uri)?;
        let merged = coalesce_regions(regions.clone(), self.policy);
        let receivers: Vec<oneshot::Receiver<TesseraResult<Bytes>>> = merged
            .iter()
            .map(|range| {
                let reader = reader.clone();
                let cancel = cancellation.clone();
                let (start, len) = (range.start, range.end - range.start);
                self.dispatcher.dispatch(move || -> TesseraResult<Bytes> {
                    cancel.check()?;
                    Ok(reader.read_byte_range(start, len)?)
                })
            })
            .collect::<TesseraResult<_>>()?;
        Ok(async move {
            let mut read = Vec::with_capacity(receivers.len());
            for rx in receivers {
                let bytes = rx
                    .await
                    .map_err(|_| tessera_err!("io worker dropped its result"))??;
                read.push(bytes);
            }
            Ok(slice_regions(&merged, &read, &regions))
        })
    }
}

#[cfg(test)]
mod tests {
    use tessera_error::TesseraError;

    use super::*;

    fn vfs() -> Vfs {
        Vfs::new(Arc::new(IoDispatcher::new(2)))
    }

    #[tokio::test]
    async fn read_all_slices_per_region() {
        let v = vfs().with_coalesce_policy(CoalescePolicy {
            max_gap: 16,
            ..CoalescePolicy::default()
        });
        v.register("mem://t", Arc::new(Bytes::from_static(b"trytoreadthisinmultiplechunks")));
        let out = v
            .read_all("mem://t", vec![5..9, 23..29], &Cancellation::new())
            .unwrap()
            .await
            .unwrap();
        assert_eq!(out, vec![Bytes::from_static(b"read"), Bytes::from_static(b"chunks")]);
    }

    #[test]
    fn unknown_uri_errors_before_io() {
        assert!(vfs()
            .read_all("mem://nope", vec![0..1], &Cancellation::new())
            .is_err());
    }

    #[test]
    fn out_of_bounds_read_surfaces_io_error() {
        let v = vfs();
        v.register("mem://t", Arc::new(Bytes::from_static(b"abc")));
        let fut = v.read_all("mem://t", vec![0..10], &Cancellation::new()).unwrap();
        assert!(futures::executor::block_on(fut).is_err());
    }

    #[test]
    fn cancelled_reads_never_touch_storage() {
        let v = vfs();
        v.register("mem://t", Arc::new(Bytes::from_static(b"abc")));
        let cancel = Cancellation::new();
        cancel.cancel();
        let fut = v.read_all("mem://t", vec![0..1], &cancel).unwrap();
        assert!(matches!(
            futures::executor::block_on(fut),
            Err(TesseraError::Cancelled)
        ));
    }
}
