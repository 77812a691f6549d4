//! Array schemas: dimensions, attributes and their storage properties.

use tessera_error::{tessera_bail, TesseraResult};

use crate::coord::CoordType;
use crate::datatype::Datatype;
use crate::domain::Domain;
use crate::filter::FilterPipeline;
use crate::tile::CELL_VAR_OFFSET_SIZE;

/// Name of the implicit coordinates attribute of sparse results.
pub const COORDS: &str = "__coords";

/// A named, typed attribute.
#[derive(Debug, Clone)]
pub struct Attribute {
    name: String,
    datatype: Datatype,
    var_sized: bool,
    filters: FilterPipeline,
    fill: Option<Vec<u8>>,
}

impl Attribute {
    /// A fixed-size attribute with an empty filter pipeline.
    pub fn new(name: impl Into<String>, datatype: Datatype) -> Self {
        Self {
            name: name.into(),
            datatype,
            var_sized: false,
            filters: FilterPipeline::default(),
            fill: None,
        }
    }

    /// A variable-length attribute; cells hold zero or more `datatype`
    /// values.
    pub fn var(name: impl Into<String>, datatype: Datatype) -> Self {
        Self {
            var_sized: true,
            ..Self::new(name, datatype)
        }
    }

    pub fn with_filters(mut self, filters: FilterPipeline) -> Self {
        self.filters = filters;
        self
    }

    /// Override the fill value emitted for cells no fragment has written.
    pub fn with_fill(mut self, fill: Vec<u8>) -> TesseraResult<Self> {
        if fill.len() as u64 != self.datatype.size() {
            tessera_bail!(
                InvalidAttribute: "fill value for '{}' must be {} bytes, got {}",
                self.name,
                self.datatype.size(),
                fill.len()
            );
        }
        self.fill = Some(fill);
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn datatype(&self) -> Datatype {
        self.datatype
    }

    pub fn var_sized(&self) -> bool {
        self.var_sized
    }

    pub fn filters(&self) -> &FilterPipeline {
        &self.filters
    }

    pub fn fill_value(&self) -> &[u8] {
        self.fill
            .as_deref()
            .unwrap_or_else(|| self.datatype.fill_value())
    }
}

/// The read-only description of an array.
#[derive(Debug, Clone)]
pub struct ArraySchema<T: CoordType> {
    domain: Domain<T>,
    dense: bool,
    capacity: u64,
    attributes: Vec<Attribute>,
    coords_filters: FilterPipeline,
    offsets_filters: FilterPipeline,
}

impl<T: CoordType> ArraySchema<T> {
    /// Validate and build a schema.
    ///
    /// `capacity` is the maximum cell count of a sparse tile; it is ignored
    /// for dense arrays.
    pub fn build(
        dense: bool,
        domain: Domain<T>,
        attributes: Vec<Attribute>,
        capacity: u64,
    ) -> TesseraResult<Self> {
        if dense && T::DATATYPE.is_real() {
            tessera_bail!(
                UnsupportedDomainType: "dense arrays require an integral domain, got {}",
                T::DATATYPE
            );
        }
        if dense && domain.tile_extents().is_none() {
            tessera_bail!(InvalidRange: "dense arrays require tile extents");
        }
        if attributes.is_empty() {
            tessera_bail!(InvalidAttribute: "schema needs at least one attribute");
        }
        if !dense && capacity == 0 {
            tessera_bail!(InvalidRange: "sparse tile capacity must be positive");
        }
        for (i, a) in attributes.iter().enumerate() {
            if a.name() == COORDS {
                tessera_bail!(InvalidAttribute: "'{COORDS}' is a reserved attribute name");
            }
            if attributes[..i].iter().any(|b| b.name() == a.name()) {
                tessera_bail!(InvalidAttribute: "duplicate attribute '{}'", a.name());
            }
        }
        Ok(Self {
            domain,
            dense,
            capacity,
            attributes,
            coords_filters: FilterPipeline::default(),
            offsets_filters: FilterPipeline::default(),
        })
    }

    pub fn with_coords_filters(mut self, filters: FilterPipeline) -> Self {
        self.coords_filters = filters;
        self
    }

    pub fn with_offsets_filters(mut self, filters: FilterPipeline) -> Self {
        self.offsets_filters = filters;
        self
    }

    /// The filter pipeline decoding var-attribute offset streams.
    pub fn offsets_filters(&self) -> &FilterPipeline {
        &self.offsets_filters
    }

    pub fn domain(&self) -> &Domain<T> {
        &self.domain
    }

    pub fn dense(&self) -> bool {
        self.dense
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn dim_num(&self) -> usize {
        self.domain.dim_num()
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name() == name)
    }

    /// Whether `attr` is var-sized; errors for unknown attributes.
    pub fn var_size(&self, attr: &str) -> TesseraResult<bool> {
        if attr == COORDS {
            return Ok(false);
        }
        self.attribute(attr)
            .map(Attribute::var_sized)
            .ok_or_else(|| tessera_error::tessera_err!(InvalidAttribute: "unknown attribute '{attr}'"))
    }

    /// Bytes of one coordinate tuple.
    pub fn coords_size(&self) -> u64 {
        self.domain.dim_num() as u64 * T::SIZE
    }

    /// Bytes of one cell in the fixed stream of `attr`: the coordinate
    /// tuple size for coordinates, one offset entry for var attributes and
    /// one value otherwise.
    pub fn cell_size(&self, attr: &str) -> TesseraResult<u64> {
        if attr == COORDS {
            return Ok(self.coords_size());
        }
        let a = self
            .attribute(attr)
            .ok_or_else(|| tessera_error::tessera_err!(InvalidAttribute: "unknown attribute '{attr}'"))?;
        Ok(if a.var_sized() {
            CELL_VAR_OFFSET_SIZE
        } else {
            a.datatype().size()
        })
    }

    pub fn type_of(&self, attr: &str) -> TesseraResult<Datatype> {
        if attr == COORDS {
            return Ok(T::DATATYPE);
        }
        self.attribute(attr)
            .map(Attribute::datatype)
            .ok_or_else(|| tessera_error::tessera_err!(InvalidAttribute: "unknown attribute '{attr}'"))
    }

    /// The filter pipeline decoding `attr`'s tiles.
    pub fn filters_for(&self, attr: &str) -> &FilterPipeline {
        if attr == COORDS {
            &self.coords_filters
        } else {
            self.attribute(attr)
                .map(Attribute::filters)
                .unwrap_or(&self.coords_filters)
        }
    }
}
