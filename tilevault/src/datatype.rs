use serde::{Deserialize, Serialize};

/// The fixed-size cell datatypes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Datatype {
    /// Signed 8-bit integer.
    Int8,
    /// Unsigned 8-bit integer.
    Uint8,
    /// Signed 16-bit integer.
    Int16,
    /// Unsigned 16-bit integer.
    Uint16,
    /// Signed 32-bit integer.
    Int32,
    /// Unsigned 32-bit integer.
    Uint32,
    /// Signed 64-bit integer.
    Int64,
    /// Unsigned 64-bit integer.
    Uint64,
    /// IEEE 754 single precision float.
    Float32,
    /// IEEE 754 double precision float.
    Float64,
}

impl Datatype {
    /// The size of one value in bytes.
    #[must_use]
    pub const fn size(&self) -> u64 {
        match self {
            Self::Int8 | Self::Uint8 => 1,
            Self::Int16 | Self::Uint16 => 2,
            Self::Int32 | Self::Uint32 | Self::Float32 => 4,
            Self::Int64 | Self::Uint64 | Self::Float64 => 8,
        }
    }

    /// Whether the datatype may index a dimension.
    #[must_use]
    pub const fn is_integral(&self) -> bool {
        !matches!(self, Self::Float32 | Self::Float64)
    }

    /// The little-endian bytes of the *empty* sentinel written into dense
    /// cells no fragment covers.
    #[must_use]
    pub fn empty_value(&self) -> Vec<u8> {
        match self {
            Self::Int8 => i8::MIN.to_le_bytes().to_vec(),
            Self::Uint8 => u8::MAX.to_le_bytes().to_vec(),
            Self::Int16 => i16::MIN.to_le_bytes().to_vec(),
            Self::Uint16 => u16::MAX.to_le_bytes().to_vec(),
            Self::Int32 => i32::MIN.to_le_bytes().to_vec(),
            Self::Uint32 => u32::MAX.to_le_bytes().to_vec(),
            Self::Int64 => i64::MIN.to_le_bytes().to_vec(),
            Self::Uint64 => u64::MAX.to_le_bytes().to_vec(),
            Self::Float32 => f32::NAN.to_le_bytes().to_vec(),
            Self::Float64 => f64::NAN.to_le_bytes().to_vec(),
        }
    }
}

impl std::fmt::Display for Datatype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Int8 => "int8",
            Self::Uint8 => "uint8",
            Self::Int16 => "int16",
            Self::Uint16 => "uint16",
            Self::Int32 => "int32",
            Self::Uint32 => "uint32",
            Self::Int64 => "int64",
            Self::Uint64 => "uint64",
            Self::Float32 => "float32",
            Self::Float64 => "float64",
        };
        write!(f, "{name}")
    }
}
