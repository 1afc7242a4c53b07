use serde::{Deserialize, Serialize};

use crate::constants::{FORMAT_VERSION, SPECIAL_NAME_PREFIX};
use crate::datatype::Datatype;
use crate::encryption::KeyValidation;
use crate::error::{Error, Result};

/// Whether an array stores every cell of its domain or only written cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArrayType {
    /// Every cell of the domain is addressable.
    Dense,
    /// Only written cells exist.
    Sparse,
}

/// A cell or tile ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Layout {
    /// Row-major (C) order.
    #[default]
    RowMajor,
    /// Column-major (Fortran) order.
    ColMajor,
    /// The array's global tile-then-cell order.
    GlobalOrder,
    /// No defined order.
    Unordered,
}

/// A filter applied to tiles of an attribute.
///
/// The filter pipeline is an external collaborator; this engine accepts only
/// the empty (identity) pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Filter {
    /// Gzip compression.
    Gzip,
    /// Zstd compression.
    Zstd,
    /// CRC32C checksumming.
    Crc32c,
}

/// A dimension of the array domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimension {
    name: String,
    datatype: Datatype,
    domain: [i64; 2],
    tile_extent: u64,
}

impl Dimension {
    /// Create a new dimension.
    pub fn new(
        name: impl Into<String>,
        datatype: Datatype,
        domain: [i64; 2],
        tile_extent: u64,
    ) -> Self {
        Self {
            name: name.into(),
            datatype,
            domain,
            tile_extent,
        }
    }

    /// The dimension name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The inclusive `[min, max]` domain.
    #[must_use]
    pub fn domain(&self) -> [i64; 2] {
        self.domain
    }

    /// The tile extent in cells.
    #[must_use]
    pub fn tile_extent(&self) -> u64 {
        self.tile_extent
    }
}

/// An attribute of the array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    name: String,
    datatype: Datatype,
    cell_val_num: u32,
    #[serde(default)]
    filters: Vec<Filter>,
}

impl Attribute {
    /// Create a new single-value attribute.
    pub fn new(name: impl Into<String>, datatype: Datatype) -> Self {
        Self {
            name: name.into(),
            datatype,
            cell_val_num: 1,
            filters: Vec::new(),
        }
    }

    /// Set the number of values per cell.
    #[must_use]
    pub fn with_cell_val_num(mut self, cell_val_num: u32) -> Self {
        self.cell_val_num = cell_val_num;
        self
    }

    /// Set the filter pipeline.
    #[must_use]
    pub fn with_filters(mut self, filters: Vec<Filter>) -> Self {
        self.filters = filters;
        self
    }

    /// The attribute name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The value datatype.
    #[must_use]
    pub fn datatype(&self) -> Datatype {
        self.datatype
    }

    /// The number of values per cell.
    #[must_use]
    pub fn cell_val_num(&self) -> u32 {
        self.cell_val_num
    }

    /// The size of one cell in bytes.
    #[must_use]
    pub fn cell_size(&self) -> u64 {
        self.datatype.size() * u64::from(self.cell_val_num)
    }
}

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with(SPECIAL_NAME_PREFIX)
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// The immutable schema of an array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArraySchema {
    version: u32,
    array_type: ArrayType,
    dimensions: Vec<Dimension>,
    attributes: Vec<Attribute>,
    tile_order: Layout,
    cell_order: Layout,
    capacity: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    key_validation: Option<KeyValidation>,
}

impl ArraySchema {
    /// Create a new schema with row-major tile and cell order.
    pub fn new(
        array_type: ArrayType,
        dimensions: Vec<Dimension>,
        attributes: Vec<Attribute>,
    ) -> Self {
        Self {
            version: FORMAT_VERSION,
            array_type,
            dimensions,
            attributes,
            tile_order: Layout::RowMajor,
            cell_order: Layout::RowMajor,
            capacity: 10_000,
            key_validation: None,
        }
    }

    /// Set the sparse tile capacity in cells.
    #[must_use]
    pub fn with_capacity(mut self, capacity: u64) -> Self {
        self.capacity = capacity;
        self
    }

    /// Validate the schema.
    ///
    /// # Errors
    /// Returns [`Error::InvalidArgument`] for structural problems and
    /// [`Error::Unsupported`] for declared non-identity filter pipelines.
    pub fn check(&self) -> Result<()> {
        if self.dimensions.is_empty() {
            return Err(Error::InvalidArgument("schema has no dimensions".into()));
        }
        if self.attributes.is_empty() {
            return Err(Error::InvalidArgument("schema has no attributes".into()));
        }
        let mut names: Vec<&str> = self
            .dimensions
            .iter()
            .map(Dimension::name)
            .chain(self.attributes.iter().map(Attribute::name))
            .collect();
        names.sort_unstable();
        if names.windows(2).any(|pair| pair[0] == pair[1]) {
            return Err(Error::InvalidArgument(
                "dimension and attribute names must be unique".into(),
            ));
        }
        for name in names {
            if !valid_name(name) {
                return Err(Error::InvalidArgument(format!("invalid name {name:?}")));
            }
        }
        for dimension in &self.dimensions {
            if !dimension.datatype.is_integral() {
                return Err(Error::InvalidArgument(format!(
                    "dimension {:?} must have an integral datatype",
                    dimension.name
                )));
            }
            if dimension.domain[0] > dimension.domain[1] {
                return Err(Error::InvalidArgument(format!(
                    "dimension {:?} has an empty domain",
                    dimension.name
                )));
            }
            if dimension.tile_extent == 0 {
                return Err(Error::InvalidArgument(format!(
                    "dimension {:?} has a zero tile extent",
                    dimension.name
                )));
            }
        }
        for attribute in &self.attributes {
            if attribute.cell_val_num == 0 {
                return Err(Error::InvalidArgument(format!(
                    "attribute {:?} has zero values per cell",
                    attribute.name
                )));
            }
            if !attribute.filters.is_empty() {
                return Err(Error::Unsupported(format!(
                    "attribute {:?} declares a filter pipeline; only the identity pipeline is supported",
                    attribute.name
                )));
            }
        }
        if self.tile_order != Layout::RowMajor || self.cell_order != Layout::RowMajor {
            return Err(Error::Unsupported(
                "only row-major tile and cell order are supported".into(),
            ));
        }
        Ok(())
    }

    /// The number of dimensions.
    #[must_use]
    pub fn dim_num(&self) -> usize {
        self.dimensions.len()
    }

    /// Whether the array is dense.
    #[must_use]
    pub fn is_dense(&self) -> bool {
        self.array_type == ArrayType::Dense
    }

    /// The dimensions.
    #[must_use]
    pub fn dimensions(&self) -> &[Dimension] {
        &self.dimensions
    }

    /// The attributes.
    #[must_use]
    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    /// The attribute named `name`.
    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    /// The per-dimension `[min, max]` domain.
    #[must_use]
    pub fn domain(&self) -> Vec<[i64; 2]> {
        self.dimensions.iter().map(|d| d.domain).collect()
    }

    /// The per-dimension tile extents.
    #[must_use]
    pub fn tile_extents(&self) -> Vec<u64> {
        self.dimensions.iter().map(|d| d.tile_extent).collect()
    }

    /// The sparse tile capacity in cells.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Validate a subarray against the domain.
    ///
    /// # Errors
    /// Returns [`Error::InvalidArgument`] if the dimensionality differs or a
    /// range is empty or out of the domain.
    pub fn check_subarray(&self, subarray: &[[i64; 2]]) -> Result<()> {
        if subarray.len() != self.dimensions.len() {
            return Err(Error::InvalidArgument(format!(
                "subarray has {} ranges, array has {} dimensions",
                subarray.len(),
                self.dimensions.len()
            )));
        }
        for (range, dimension) in subarray.iter().zip(&self.dimensions) {
            if range[0] > range[1]
                || range[0] < dimension.domain[0]
                || range[1] > dimension.domain[1]
            {
                return Err(Error::InvalidArgument(format!(
                    "range {range:?} is outside the domain {:?} of dimension {:?}",
                    dimension.domain, dimension.name
                )));
            }
        }
        Ok(())
    }

    /// Whether every range of `subarray` starts on a tile boundary and ends
    /// on a tile boundary or at the end of the domain.
    #[must_use]
    pub fn is_tile_aligned(&self, subarray: &[[i64; 2]]) -> bool {
        subarray.iter().zip(&self.dimensions).all(|(range, dim)| {
            let extent = dim.tile_extent as i64;
            (range[0] - dim.domain[0]) % extent == 0
                && (range[1] == dim.domain[1] || (range[1] - dim.domain[0] + 1) % extent == 0)
        })
    }

    pub(crate) fn key_validation(&self) -> Option<&KeyValidation> {
        self.key_validation.as_ref()
    }

    pub(crate) fn set_key_validation(&mut self, validation: KeyValidation) {
        self.key_validation = Some(validation);
    }

    /// Serialize the schema to its on-disk document.
    ///
    /// # Errors
    /// Returns [`Error::InvalidArgument`] if serialization fails.
    pub fn to_json_vec(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).map_err(|e| Error::InvalidArgument(e.to_string()))
    }

    /// Deserialize a schema, checking its format version.
    ///
    /// # Errors
    /// Returns [`Error::UnsupportedVersion`] for documents written by a
    /// newer engine and [`Error::InvalidArgument`] for malformed documents.
    pub fn from_json_slice(bytes: &[u8]) -> Result<Self> {
        let value: serde_json::Value =
            serde_json::from_slice(bytes).map_err(|e| Error::InvalidArgument(e.to_string()))?;
        let version = value
            .get("version")
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| Error::InvalidArgument("schema document has no version".into()))?;
        let version = u32::try_from(version).map_err(|_| Error::UnsupportedVersion(u32::MAX))?;
        if version > FORMAT_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        serde_json::from_value(value).map_err(|e| Error::InvalidArgument(e.to_string()))
    }
}
