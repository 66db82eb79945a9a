use serde::{Deserialize, Serialize};
use std::fmt;

/// The closed set of element types a dataset can carry.
///
/// Tags map 1:1 to netCDF type codes; `F80` is the extended-precision
/// accumulator tag and is stored as f64 internally.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    F80,
    Char,
    Str,
}

impl DataType {
    pub fn is_numeric(self) -> bool {
        !matches!(self, DataType::Char | DataType::Str)
    }

    pub fn is_float(self) -> bool {
        matches!(self, DataType::F32 | DataType::F64 | DataType::F80)
    }

    pub fn is_integral(self) -> bool {
        self.is_numeric() && !self.is_float()
    }

    /// The netCDF external type name for this tag.
    pub fn nc_name(self) -> &'static str {
        match self {
            DataType::I8 => "byte",
            DataType::I16 => "short",
            DataType::I32 => "int",
            DataType::I64 => "int64",
            DataType::U8 => "ubyte",
            DataType::U16 => "ushort",
            DataType::U32 => "uint",
            DataType::U64 => "uint64",
            DataType::F32 => "float",
            DataType::F64 => "double",
            DataType::F80 => "double",
            DataType::Char => "char",
            DataType::Str => "string",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.nc_name())
    }
}
