use async_trait::async_trait;
use pagoda_array::{ArrayBuffer, DistributedArray};
use pagoda_net::Collectives;
use pagoda_types::{DataType, FileFormat, Result};

/// A named axis. Two dimensions are equal when their names, sizes, and
/// record-ness all match.
#[derive(Clone, Debug, PartialEq)]
pub struct Dimension {
    pub name: String,
    pub size: i64,
    pub unlimited: bool,
}

impl Dimension {
    pub fn new(name: impl Into<String>, size: i64, unlimited: bool) -> Dimension {
        Dimension {
            name: name.into(),
            size,
            unlimited,
        }
    }

    pub fn fixed(name: impl Into<String>, size: i64) -> Dimension {
        Dimension::new(name, size, false)
    }

    pub fn record(name: impl Into<String>, size: i64) -> Dimension {
        Dimension::new(name, size, true)
    }
}

/// A typed key/value pair attached to a dataset or variable.
#[derive(Clone, Debug, PartialEq)]
pub struct Attribute {
    pub name: String,
    pub values: ArrayBuffer,
}

impl Attribute {
    pub fn new(name: impl Into<String>, values: ArrayBuffer) -> Attribute {
        Attribute {
            name: name.into(),
            values,
        }
    }

    pub fn text(name: impl Into<String>, value: &str) -> Attribute {
        Attribute::new(name, ArrayBuffer::Char(value.as_bytes().to_vec()))
    }

    pub fn datatype(&self) -> DataType {
        self.values.datatype()
    }

    pub fn count(&self) -> i64 {
        self.values.len() as i64
    }

    pub fn as_string(&self) -> Option<String> {
        match &self.values {
            ArrayBuffer::Char(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
            ArrayBuffer::Str(strings) => Some(strings.join("")),
            _ => None,
        }
    }

    pub fn first_f64(&self) -> Option<f64> {
        self.values.get_f64(0).ok()
    }
}

/// Variable metadata: a type over an ordered run of dimensions, plus its
/// attributes. The leading dimension may be the record dimension.
#[derive(Clone, Debug, PartialEq)]
pub struct Variable {
    pub name: String,
    pub ty: DataType,
    pub dims: Vec<Dimension>,
    pub atts: Vec<Attribute>,
}

impl Variable {
    pub fn new(name: impl Into<String>, ty: DataType, dims: Vec<Dimension>) -> Variable {
        Variable {
            name: name.into(),
            ty,
            dims,
            atts: Vec::new(),
        }
    }

    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    /// Global shape; scalars read as a single-element array.
    pub fn shape(&self) -> Vec<i64> {
        if self.dims.is_empty() {
            vec![1]
        } else {
            self.dims.iter().map(|d| d.size).collect()
        }
    }

    /// Shape of one record (the shape with the leading axis dropped).
    pub fn record_shape(&self) -> Vec<i64> {
        if self.dims.len() <= 1 {
            vec![1]
        } else {
            self.dims[1..].iter().map(|d| d.size).collect()
        }
    }

    pub fn is_record(&self) -> bool {
        self.dims.first().map(|d| d.unlimited).unwrap_or(false)
    }

    pub fn num_records(&self) -> i64 {
        self.dims.first().map(|d| d.size).unwrap_or(1)
    }

    pub fn att(&self, name: &str) -> Option<&Attribute> {
        self.atts.iter().find(|a| a.name == name)
    }

    pub fn has_fill_value(&self) -> bool {
        self.get_fill_value().is_some()
    }

    /// The per-variable sentinel, from `_FillValue` or `missing_value`.
    pub fn get_fill_value(&self) -> Option<f64> {
        self.att("_FillValue")
            .or_else(|| self.att("missing_value"))
            .and_then(|a| a.first_f64())
    }

    pub fn uses_dim(&self, name: &str) -> bool {
        self.dims.iter().any(|d| d.name == name)
    }
}

/// Handle for a posted non-blocking read; redeemed with `take` after `wait`.
pub type ReadHandle = usize;

/// The dataset contract: metadata accessors are local, reads are collective.
///
/// An aggregation is indistinguishable from a single dataset through this
/// trait.
#[async_trait]
pub trait Dataset<N: Collectives>: Send + Sync {
    fn get_dims(&self) -> &[Dimension];
    fn get_vars(&self) -> &[Variable];
    fn get_atts(&self) -> &[Attribute];
    fn get_file_format(&self) -> FileFormat;

    fn get_udim(&self) -> Option<&Dimension> {
        self.get_dims().iter().find(|d| d.unlimited)
    }

    fn get_dim(&self, name: &str) -> Option<&Dimension> {
        self.get_dims().iter().find(|d| d.name == name)
    }

    fn get_var(&self, name: &str) -> Option<&Variable> {
        self.get_vars().iter().find(|v| v.name == name)
    }

    /// Name-keyed attribute lookup; `within_vars` extends the search into
    /// every variable's attributes.
    fn get_att(&self, name: &str, ignore_case: bool, within_vars: bool) -> Option<&Attribute> {
        let matches = |att: &Attribute| {
            if ignore_case {
                att.name.eq_ignore_ascii_case(name)
            } else {
                att.name == name
            }
        };
        if let Some(att) = self.get_atts().iter().find(|a| matches(a)) {
            return Some(att);
        }
        if within_vars {
            for var in self.get_vars() {
                if let Some(att) = var.atts.iter().find(|a| matches(a)) {
                    return Some(att);
                }
            }
        }
        None
    }

    /// Collective. Read the whole variable into a fresh array.
    async fn read(&self, var: &str, net: &N) -> Result<DistributedArray>;

    /// Collective. Read one record (axis 0 fixed) into a fresh array.
    async fn read_record(&self, var: &str, record: i64, net: &N) -> Result<DistributedArray>;

    /// Collective. Post a non-blocking whole-variable read; the returned
    /// array is undefined until `wait` completes.
    async fn iread(&mut self, var: &str, net: &N) -> Result<ReadHandle>;

    /// Collective. Post a non-blocking single-record read.
    async fn iread_record(&mut self, var: &str, record: i64, net: &N) -> Result<ReadHandle>;

    /// Collective. Complete every pending read.
    async fn wait(&mut self, net: &N) -> Result<()>;

    /// Redeem a completed read posted by `iread`/`iread_record`.
    fn take(&mut self, handle: ReadHandle) -> Option<DistributedArray>;
}
