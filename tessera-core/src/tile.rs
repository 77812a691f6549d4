//! In-memory tiles.

use bytes::Bytes;

use crate::coord::CoordType;
use crate::datatype::Datatype;

/// Bytes of one entry in a var-sized attribute's offset stream.
pub const CELL_VAR_OFFSET_SIZE: u64 = 8;

/// One decoded (or still encoded) attribute stream of an on-disk tile.
#[derive(Debug, Clone)]
pub struct Tile {
    datatype: Datatype,
    cell_size: u64,
    data: Bytes,
    filtered: bool,
}

impl Tile {
    pub fn new(datatype: Datatype, cell_size: u64) -> Self {
        Self {
            datatype,
            cell_size,
            data: Bytes::new(),
            filtered: false,
        }
    }

    pub fn datatype(&self) -> Datatype {
        self.datatype
    }

    pub fn cell_size(&self) -> u64 {
        self.cell_size
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn cell_num(&self) -> u64 {
        self.size() / self.cell_size
    }

    /// Whether the payload has been through the reverse filter pipeline.
    pub fn filtered(&self) -> bool {
        self.filtered
    }

    pub fn set_data(&mut self, data: Bytes, filtered: bool) {
        self.data = data;
        self.filtered = filtered;
    }

    pub fn mark_filtered(&mut self) {
        self.filtered = true;
    }

    /// Decode the payload as a sequence of `T` values.
    pub fn typed_vec<T: CoordType>(&self) -> Vec<T> {
        self.data
            .chunks_exact(T::SIZE as usize)
            .map(T::from_le)
            .collect()
    }

    /// Decode the payload as the `u64` offset stream of a var tile.
    pub fn offsets(&self) -> Vec<u64> {
        self.data
            .chunks_exact(CELL_VAR_OFFSET_SIZE as usize)
            .map(|c| u64::from_le_bytes(c.try_into().unwrap_or_default()))
            .collect()
    }
}

/// The fixed stream of an attribute tile plus, for var attributes, its
/// value stream.
#[derive(Debug, Clone)]
pub struct TilePair {
    pub fixed: Tile,
    pub var: Option<Tile>,
}

impl TilePair {
    pub fn fixed(tile: Tile) -> Self {
        Self {
            fixed: tile,
            var: None,
        }
    }

    pub fn with_var(fixed: Tile, var: Tile) -> Self {
        Self {
            fixed,
            var: Some(var),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_round_trip() {
        let mut bytes = Vec::new();
        for v in [3i32, -1, 7] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        let mut t = Tile::new(Datatype::Int32, 4);
        t.set_data(bytes.into(), true);
        assert_eq!(t.cell_num(), 3);
        assert_eq!(t.typed_vec::<i32>(), vec![3, -1, 7]);
    }
}
