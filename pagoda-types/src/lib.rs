pub mod datatype;
pub mod error;
pub mod format;

pub use datatype::DataType;
pub use error::{PagodaError, Result};
pub use format::FileFormat;
