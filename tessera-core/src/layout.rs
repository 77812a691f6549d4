//! Traversal orders.

use std::fmt;

/// The order cells are laid out in, within a tile (cell order) or across
/// tiles (tile order).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellOrder {
    RowMajor,
    ColMajor,
}

/// The order a query emits its results in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Layout {
    #[default]
    RowMajor,
    ColMajor,
    /// Tiles in tile order, cells within a tile in cell order.
    GlobalOrder,
    /// No ordering guarantee; results arrive range by range.
    Unordered,
}

impl Layout {
    /// The cell order this layout traverses cells in, given the array's
    /// own cell order. Global and unordered traversals follow the array.
    pub fn effective_order(&self, cell_order: CellOrder) -> CellOrder {
        match self {
            Self::RowMajor => CellOrder::RowMajor,
            Self::ColMajor => CellOrder::ColMajor,
            Self::GlobalOrder | Self::Unordered => cell_order,
        }
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::RowMajor => "row-major",
            Self::ColMajor => "col-major",
            Self::GlobalOrder => "global-order",
            Self::Unordered => "unordered",
        };
        write!(f, "{name}")
    }
}

impl fmt::Display for CellOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RowMajor => write!(f, "row-major"),
            Self::ColMajor => write!(f, "col-major"),
        }
    }
}
