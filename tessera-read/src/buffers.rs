//! Caller-owned output buffers.

use rustc_hash::FxHashMap;

/// One attribute's output buffers for a single `read` call.
///
/// Var-sized attributes write their per-cell start offsets into `data` and
/// the payload into `var`. After a call, `size` (and `var_size`) hold the
/// bytes written.
#[derive(Debug)]
pub struct AttrBuffer<'a> {
    pub data: &'a mut [u8],
    pub var: Option<&'a mut [u8]>,
    pub size: u64,
    pub var_size: u64,
}

/// The full set of output buffers handed to [`Reader::read`].
///
/// [`Reader::read`]: crate::Reader::read
#[derive(Debug, Default)]
pub struct QueryBuffers<'a> {
    bufs: FxHashMap<String, AttrBuffer<'a>>,
}

impl<'a> QueryBuffers<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fixed(&mut self, attr: impl Into<String>, data: &'a mut [u8]) {
        self.bufs.insert(
            attr.into(),
            AttrBuffer {
                data,
                var: None,
                size: 0,
                var_size: 0,
            },
        );
    }

    pub fn set_var(
        &mut self,
        attr: impl Into<String>,
        offsets: &'a mut [u8],
        values: &'a mut [u8],
    ) {
        self.bufs.insert(
            attr.into(),
            AttrBuffer {
                data: offsets,
                var: Some(values),
                size: 0,
                var_size: 0,
            },
        );
    }

    /// Bytes written into `attr` by the last call: `(fixed, var)`.
    pub fn sizes(&self, attr: &str) -> Option<(u64, u64)> {
        self.bufs.get(attr).map(|b| (b.size, b.var_size))
    }

    pub fn contains(&self, attr: &str) -> bool {
        self.bufs.contains_key(attr)
    }

    pub fn attrs(&self) -> impl Iterator<Item = &str> {
        self.bufs.keys().map(String::as_str)
    }

    pub(crate) fn get_mut(&mut self, attr: &str) -> Option<&mut AttrBuffer<'a>> {
        self.bufs.get_mut(attr)
    }

    pub(crate) fn get(&self, attr: &str) -> Option<&AttrBuffer<'a>> {
        self.bufs.get(attr)
    }

    pub(crate) fn zero_sizes(&mut self) {
        for buf in self.bufs.values_mut() {
            buf.size = 0;
            buf.var_size = 0;
        }
    }

    /// Whether the last call produced no bytes at all.
    pub fn no_results(&self) -> bool {
        self.bufs.values().all(|b| b.size == 0 && b.var_size == 0)
    }
}
