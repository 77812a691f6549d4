//! Filter pipelines.
//!
//! A pipeline is an attribute-specific chain of byte transforms applied to a
//! tile at write time; the read path only ever runs it in reverse to decode
//! a tile fetched from storage. The forward direction is kept on the trait
//! because filters are symmetric codecs and test fixtures author fragment
//! bytes through it.

use std::fmt::Debug;
use std::sync::Arc;

use bytes::Bytes;
use tessera_error::{tessera_bail, TesseraResult};

/// One stage of a filter pipeline.
pub trait TileFilter: Debug + Send + Sync {
    fn name(&self) -> &'static str;

    /// Encode a tile payload.
    fn run_forward(&self, data: Bytes) -> TesseraResult<Bytes>;

    /// Decode a tile payload.
    fn run_reverse(&self, data: Bytes) -> TesseraResult<Bytes>;
}

/// An encryption key for an array, applied after all other filters.
#[derive(Debug, Clone, Default)]
pub enum EncryptionKey {
    #[default]
    None,
    Aes256Gcm(Box<[u8; 32]>),
}

/// An ordered chain of filters.
#[derive(Debug, Clone, Default)]
pub struct FilterPipeline {
    stages: Vec<Arc<dyn TileFilter>>,
}

impl FilterPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(mut self, filter: impl TileFilter + 'static) -> Self {
        self.stages.push(Arc::new(filter));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Encode: stages run in order.
    pub fn run_forward(&self, mut data: Bytes) -> TesseraResult<Bytes> {
        for stage in &self.stages {
            data = stage.run_forward(data)?;
        }
        Ok(data)
    }

    /// Decode: stages run in reverse order.
    pub fn run_reverse(&self, mut data: Bytes) -> TesseraResult<Bytes> {
        for stage in self.stages.iter().rev() {
            data = stage.run_reverse(data)?;
        }
        Ok(data)
    }

    /// The pipeline with the array's encryption filter appended, so that
    /// decryption runs first on the reverse pass.
    pub fn with_encryption(&self, key: &EncryptionKey) -> TesseraResult<Self> {
        match key {
            EncryptionKey::None => Ok(self.clone()),
            EncryptionKey::Aes256Gcm(_) => {
                tessera_bail!(Decode: "aes-256-gcm encrypted arrays are not supported by this build")
            }
        }
    }
}

/// Groups the k-th byte of every element together, which helps the
/// downstream compressor on numeric data.
#[derive(Debug, Clone, Copy)]
pub struct ByteShuffle {
    elem_size: usize,
}

impl ByteShuffle {
    pub fn new(elem_size: usize) -> Self {
        debug_assert!(elem_size > 0);
        Self { elem_size }
    }
}

impl TileFilter for ByteShuffle {
    fn name(&self) -> &'static str {
        "byte-shuffle"
    }

    fn run_forward(&self, data: Bytes) -> TesseraResult<Bytes> {
        if data.len() % self.elem_size != 0 {
            tessera_bail!(Decode: "byte-shuffle: {} bytes not a multiple of {}", data.len(), self.elem_size);
        }
        let n = data.len() / self.elem_size;
        let mut out = vec![0u8; data.len()];
        for (i, elem) in data.chunks_exact(self.elem_size).enumerate() {
            for (k, &b) in elem.iter().enumerate() {
                out[k * n + i] = b;
            }
        }
        Ok(out.into())
    }

    fn run_reverse(&self, data: Bytes) -> TesseraResult<Bytes> {
        if data.len() % self.elem_size != 0 {
            tessera_bail!(Decode: "byte-shuffle: {} bytes not a multiple of {}", data.len(), self.elem_size);
        }
        let n = data.len() / self.elem_size;
        let mut out = vec![0u8; data.len()];
        for i in 0..n {
            for k in 0..self.elem_size {
                out[i * self.elem_size + k] = data[k * n + i];
            }
        }
        Ok(out.into())
    }
}

/// LZ4 block compression with a length prefix.
#[derive(Debug, Clone, Copy, Default)]
pub struct Lz4;

impl TileFilter for Lz4 {
    fn name(&self) -> &'static str {
        "lz4"
    }

    fn run_forward(&self, data: Bytes) -> TesseraResult<Bytes> {
        Ok(lz4_flex::compress_prepend_size(&data).into())
    }

    fn run_reverse(&self, data: Bytes) -> TesseraResult<Bytes> {
        lz4_flex::decompress_size_prepended(&data)
            .map(Bytes::from)
            .map_err(|e| tessera_error::tessera_err!(Decode: "lz4: {e}"))
    }
}
