use serde::{Deserialize, Serialize};

/// On-disk container flavor, established at open/create time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileFormat {
    /// classic 32-bit offset
    Cdf1,
    /// 64-bit offset
    Cdf2,
    /// 64-bit data
    Cdf5,
    Netcdf4,
    Netcdf4Classic,
}

impl Default for FileFormat {
    fn default() -> Self {
        FileFormat::Cdf1
    }
}
