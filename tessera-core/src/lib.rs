//! Core data model of the Tessera storage engine: datatypes, coordinate
//! types, array schemas, domain arithmetic, subarrays, fragment metadata,
//! tiles, filter pipelines and query-wide utilities.

pub mod cancel;
pub mod config;
pub mod coord;
pub mod datatype;
pub mod domain;
pub mod filter;
pub mod fragment;
pub mod layout;
pub mod schema;
pub mod subarray;
pub mod tile;

pub use cancel::Cancellation;
pub use config::{Config, MemoryBudget, MEMORY_BUDGET_KEY, MEMORY_BUDGET_VAR_KEY};
pub use coord::{CoordType, DenseCoord};
pub use datatype::Datatype;
pub use domain::{DimRange, Dimension, Domain, NDRange};
pub use filter::{ByteShuffle, EncryptionKey, FilterPipeline, Lz4, TileFilter};
pub use fragment::{AttrFileMeta, FragmentMetadata, StreamMeta};
pub use layout::{CellOrder, Layout};
pub use schema::{ArraySchema, Attribute, COORDS};
pub use subarray::Subarray;
pub use tile::{Tile, TilePair, CELL_VAR_OFFSET_SIZE};
