//! The narrow seam over the container format library. A parallel netCDF
//! binding implements these traits; `MemoryStore` is the in-process
//! reference implementation the tests run against.

use pagoda_array::ArrayBuffer;
use pagoda_core::{Attribute, Dimension, Variable};
use pagoda_types::{DataType, FileFormat, Result};
use std::path::Path;

/// Identifier of a posted non-blocking request, scoped to one open file.
pub type RequestId = usize;

/// A read completed by `wait_all`.
pub struct CompletedRead {
    pub request: RequestId,
    pub data: ArrayBuffer,
}

pub trait VaraStore: Clone + Send + Sync + 'static {
    type File: VaraFile;

    fn exists(&self, path: &Path) -> bool;
    fn open(&self, path: &Path) -> Result<Self::File>;
    fn create(&self, path: &Path, format: FileFormat) -> Result<Self::File>;
}

/// One open container file. Rectangle reads and writes take `start`/`count`
/// vectors; a rank that contributes nothing passes empty vectors.
pub trait VaraFile: Send + Sync {
    fn format(&self) -> FileFormat;

    /// Dimensions in define order; the record dimension reports the current
    /// record count.
    fn dims(&self) -> Vec<Dimension>;
    fn atts(&self) -> Vec<Attribute>;
    fn vars(&self) -> Vec<Variable>;

    /// `size` of `None` defines the unlimited dimension. Redefinition with
    /// identical metadata is idempotent (every rank defines collectively).
    fn def_dim(&mut self, name: &str, size: Option<i64>) -> Result<()>;
    fn def_var(&mut self, name: &str, ty: DataType, dims: &[String]) -> Result<()>;
    fn put_att(&mut self, var: Option<&str>, att: Attribute) -> Result<()>;
    fn enddef(&mut self) -> Result<()>;
    fn set_header_pad(&mut self, bytes: i64);

    fn get_vara(&self, var: &str, start: &[i64], count: &[i64]) -> Result<ArrayBuffer>;
    fn put_vara(&mut self, var: &str, start: &[i64], count: &[i64], data: &ArrayBuffer)
        -> Result<()>;
    fn iget_vara(&mut self, var: &str, start: &[i64], count: &[i64]) -> Result<RequestId>;
    fn iput_vara(
        &mut self,
        var: &str,
        start: &[i64],
        count: &[i64],
        data: ArrayBuffer,
    ) -> Result<RequestId>;

    /// Complete every pending request: writes are applied, reads returned.
    fn wait_all(&mut self) -> Result<Vec<CompletedRead>>;
}

/// I/O hints forwarded verbatim to the format library.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Hints {
    pub cb_buffer_size: Option<String>,
    pub romio_cb_read: Option<String>,
    pub romio_ds_read: Option<String>,
    pub romio_no_indep_rw: Option<String>,
    pub striping_unit: Option<String>,
}

impl Hints {
    pub fn from_env() -> Hints {
        let get = |name: &str| std::env::var(name).ok();
        Hints {
            cb_buffer_size: get("cb_buffer_size"),
            romio_cb_read: get("romio_cb_read"),
            romio_ds_read: get("romio_ds_read"),
            romio_no_indep_rw: get("romio_no_indep_rw"),
            striping_unit: get("striping_unit"),
        }
    }

    pub fn to_pairs(&self) -> Vec<(&'static str, &str)> {
        [
            ("cb_buffer_size", &self.cb_buffer_size),
            ("romio_cb_read", &self.romio_cb_read),
            ("romio_ds_read", &self.romio_ds_read),
            ("romio_no_indep_rw", &self.romio_no_indep_rw),
            ("striping_unit", &self.striping_unit),
        ]
        .into_iter()
        .filter_map(|(name, value)| value.as_deref().map(|v| (name, v)))
        .collect()
    }
}

/// The effective `--groups` value; `TESTREAD_NUMGROUPS` wins when set.
pub fn num_groups(from_options: usize) -> usize {
    std::env::var("TESTREAD_NUMGROUPS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(from_options)
        .max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hints_forward_only_set_values() {
        let hints = Hints {
            cb_buffer_size: Some("16777216".to_string()),
            striping_unit: Some("1048576".to_string()),
            ..Default::default()
        };
        let pairs = hints.to_pairs();
        assert_eq!(
            pairs,
            vec![("cb_buffer_size", "16777216"), ("striping_unit", "1048576")]
        );
    }
}
