use thiserror::Error;

/// The user-visible error taxonomy.
///
/// Errors raised inside a collective never unwind across ranks; the driver
/// that catches one of these is expected to abort the process group.
#[derive(Debug, Error)]
pub enum PagodaError {
    #[error("command error: {0}")]
    Command(String),
    #[error("range error: {0}")]
    Range(String),
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),
    #[error("data type error: {0}")]
    DataType(String),
    #[error("dimension mismatch: {0}")]
    DimensionMismatch(String),
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),
    #[error("io error: {0}")]
    Io(String),
    #[error("net error: {0}")]
    Net(String),
    #[error("{0}")]
    Internal(String),
}

impl From<std::io::Error> for PagodaError {
    fn from(e: std::io::Error) -> Self {
        PagodaError::Io(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PagodaError>;
