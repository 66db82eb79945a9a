//! In-process reference implementation of the container seam. Every rank of
//! a local process group sees the same file images, collective defines are
//! idempotent, and non-blocking requests are queued until `wait_all`.

use crate::store::{CompletedRead, RequestId, VaraFile, VaraStore};
use pagoda_array::shape::flat_indices_of_rect;
use pagoda_array::ArrayBuffer;
use pagoda_core::{Attribute, Dimension, Variable};
use pagoda_types::{DataType, FileFormat, PagodaError, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq)]
struct DimDef {
    name: String,
    size: i64,
    unlimited: bool,
}

#[derive(Clone, Debug)]
struct VarDef {
    name: String,
    ty: DataType,
    dims: Vec<String>,
    atts: Vec<Attribute>,
}

struct FileImage {
    format: FileFormat,
    dims: Vec<DimDef>,
    atts: Vec<Attribute>,
    vars: Vec<VarDef>,
    data: HashMap<String, ArrayBuffer>,
    numrecs: i64,
    header_pad: i64,
}

impl FileImage {
    fn new(format: FileFormat) -> FileImage {
        FileImage {
            format,
            dims: Vec::new(),
            atts: Vec::new(),
            vars: Vec::new(),
            data: HashMap::new(),
            numrecs: 0,
            header_pad: 0,
        }
    }

    fn dim(&self, name: &str) -> Option<&DimDef> {
        self.dims.iter().find(|d| d.name == name)
    }

    fn var(&self, name: &str) -> Result<&VarDef> {
        self.vars
            .iter()
            .find(|v| v.name == name)
            .ok_or_else(|| PagodaError::Io(format!("no such variable '{}'", name)))
    }

    fn dim_size(&self, name: &str) -> Result<i64> {
        let dim = self
            .dim(name)
            .ok_or_else(|| PagodaError::Io(format!("no such dimension '{}'", name)))?;
        Ok(if dim.unlimited { self.numrecs } else { dim.size })
    }

    fn var_shape(&self, var: &VarDef) -> Result<Vec<i64>> {
        if var.dims.is_empty() {
            return Ok(vec![1]);
        }
        var.dims.iter().map(|d| self.dim_size(d)).collect()
    }

    fn is_record_var(&self, var: &VarDef) -> bool {
        var.dims
            .first()
            .and_then(|d| self.dim(d))
            .map(|d| d.unlimited)
            .unwrap_or(false)
    }

    fn record_size(&self, var: &VarDef) -> Result<i64> {
        Ok(var.dims[1..]
            .iter()
            .map(|d| self.dim_size(d))
            .collect::<Result<Vec<_>>>()?
            .iter()
            .product())
    }

    fn grow_records(&mut self, records: i64) -> Result<()> {
        if records <= self.numrecs {
            return Ok(());
        }
        let record_vars: Vec<(String, i64)> = self
            .vars
            .iter()
            .filter(|v| self.is_record_var(v))
            .map(|v| Ok((v.name.clone(), self.record_size(v)?)))
            .collect::<Result<Vec<_>>>()?;
        self.numrecs = records;
        for (name, record_size) in record_vars {
            if let Some(buffer) = self.data.get_mut(&name) {
                buffer.resize((records * record_size) as usize);
            }
        }
        Ok(())
    }
}

/// A shared registry of file images keyed by path.
#[derive(Clone, Default)]
pub struct MemoryStore {
    files: Arc<Mutex<HashMap<PathBuf, Arc<RwLock<FileImage>>>>>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }
}

impl VaraStore for MemoryStore {
    type File = MemoryFile;

    fn exists(&self, path: &Path) -> bool {
        self.files.lock().contains_key(path)
    }

    fn open(&self, path: &Path) -> Result<MemoryFile> {
        let image = self
            .files
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| PagodaError::Io(format!("cannot open {}", path.display())))?;
        Ok(MemoryFile {
            image,
            pending: Vec::new(),
            next_request: 0,
        })
    }

    /// Truncating create; the writer serializes this through the root rank.
    fn create(&self, path: &Path, format: FileFormat) -> Result<MemoryFile> {
        let image = Arc::new(RwLock::new(FileImage::new(format)));
        self.files
            .lock()
            .insert(path.to_path_buf(), image.clone());
        Ok(MemoryFile {
            image,
            pending: Vec::new(),
            next_request: 0,
        })
    }
}

enum Pending {
    Read {
        request: RequestId,
        var: String,
        start: Vec<i64>,
        count: Vec<i64>,
    },
    Write {
        var: String,
        start: Vec<i64>,
        count: Vec<i64>,
        data: ArrayBuffer,
    },
}

pub struct MemoryFile {
    image: Arc<RwLock<FileImage>>,
    pending: Vec<Pending>,
    next_request: RequestId,
}

fn rect_of(start: &[i64], count: &[i64]) -> (Vec<i64>, Vec<i64>) {
    let hi = start
        .iter()
        .zip(count.iter())
        .map(|(s, c)| s + c - 1)
        .collect();
    (start.to_vec(), hi)
}

impl MemoryFile {
    /// The reserved header size, for inspection in tests.
    pub fn header_pad(&self) -> i64 {
        self.image.read().header_pad
    }

    fn read_rect(&self, var: &str, start: &[i64], count: &[i64]) -> Result<ArrayBuffer> {
        let image = self.image.read();
        let vdef = image.var(var)?;
        if start.is_empty() {
            return Ok(ArrayBuffer::alloc(vdef.ty, 0));
        }
        let shape = image.var_shape(vdef)?;
        if start.len() != shape.len() || count.len() != shape.len() {
            return Err(PagodaError::ShapeMismatch(format!(
                "read rank differs for variable '{}'",
                var
            )));
        }
        for d in 0..shape.len() {
            if start[d] < 0 || count[d] < 0 || start[d] + count[d] > shape[d] {
                return Err(PagodaError::Range(format!(
                    "read beyond the edge of variable '{}'",
                    var
                )));
            }
        }
        if count.iter().any(|c| *c == 0) {
            return Ok(ArrayBuffer::alloc(vdef.ty, 0));
        }
        let (lo, hi) = rect_of(start, count);
        let full_lo = vec![0; shape.len()];
        let full_hi: Vec<i64> = shape.iter().map(|s| s - 1).collect();
        let idx = flat_indices_of_rect(&full_lo, &full_hi, &lo, &hi);
        let buffer = image
            .data
            .get(var)
            .ok_or_else(|| PagodaError::Io(format!("variable '{}' has no data", var)))?;
        Ok(buffer.gather_flat(&idx))
    }

    fn write_rect(
        &mut self,
        var: &str,
        start: &[i64],
        count: &[i64],
        data: &ArrayBuffer,
    ) -> Result<()> {
        if start.is_empty() {
            return Ok(());
        }
        let mut image = self.image.write();
        let vdef = image.var(var)?.clone();
        if image.is_record_var(&vdef) && start[0] + count[0] > image.numrecs {
            image.grow_records(start[0] + count[0])?;
        }
        let shape = image.var_shape(&vdef)?;
        if start.len() != shape.len() || count.len() != shape.len() {
            return Err(PagodaError::ShapeMismatch(format!(
                "write rank differs for variable '{}'",
                var
            )));
        }
        for d in 0..shape.len() {
            if start[d] < 0 || count[d] < 0 || start[d] + count[d] > shape[d] {
                return Err(PagodaError::Range(format!(
                    "write beyond the edge of variable '{}'",
                    var
                )));
            }
        }
        let expected: i64 = count.iter().product();
        if data.len() as i64 != expected {
            return Err(PagodaError::ShapeMismatch(format!(
                "write of {} elements into a rectangle of {}",
                data.len(),
                expected
            )));
        }
        if expected == 0 {
            return Ok(());
        }
        let cast = data.cast_to(vdef.ty)?;
        let (lo, hi) = rect_of(start, count);
        let full_lo = vec![0; shape.len()];
        let full_hi: Vec<i64> = shape.iter().map(|s| s - 1).collect();
        let idx = flat_indices_of_rect(&full_lo, &full_hi, &lo, &hi);
        image
            .data
            .get_mut(var)
            .ok_or_else(|| PagodaError::Io(format!("variable '{}' has no data", var)))?
            .scatter_flat(&idx, &cast)?;
        Ok(())
    }
}

impl VaraFile for MemoryFile {
    fn format(&self) -> FileFormat {
        self.image.read().format
    }

    fn dims(&self) -> Vec<Dimension> {
        let image = self.image.read();
        image
            .dims
            .iter()
            .map(|d| {
                Dimension::new(
                    &d.name,
                    if d.unlimited { image.numrecs } else { d.size },
                    d.unlimited,
                )
            })
            .collect()
    }

    fn atts(&self) -> Vec<Attribute> {
        self.image.read().atts.clone()
    }

    fn vars(&self) -> Vec<Variable> {
        let image = self.image.read();
        image
            .vars
            .iter()
            .map(|v| {
                let dims = v
                    .dims
                    .iter()
                    .map(|name| {
                        let d = image.dim(name).expect("variable over undefined dimension");
                        Dimension::new(
                            &d.name,
                            if d.unlimited { image.numrecs } else { d.size },
                            d.unlimited,
                        )
                    })
                    .collect();
                let mut var = Variable::new(&v.name, v.ty, dims);
                var.atts = v.atts.clone();
                var
            })
            .collect()
    }

    fn def_dim(&mut self, name: &str, size: Option<i64>) -> Result<()> {
        let mut image = self.image.write();
        let def = DimDef {
            name: name.to_string(),
            size: size.unwrap_or(0),
            unlimited: size.is_none(),
        };
        if let Some(existing) = image.dim(name) {
            if *existing != def {
                return Err(PagodaError::Io(format!(
                    "dimension '{}' redefined inconsistently",
                    name
                )));
            }
            return Ok(());
        }
        if def.unlimited && image.dims.iter().any(|d| d.unlimited) {
            return Err(PagodaError::Io(
                "a dataset has at most one unlimited dimension".to_string(),
            ));
        }
        image.dims.push(def);
        Ok(())
    }

    fn def_var(&mut self, name: &str, ty: DataType, dims: &[String]) -> Result<()> {
        let mut image = self.image.write();
        for dim in dims {
            if image.dim(dim).is_none() {
                return Err(PagodaError::Io(format!(
                    "variable '{}' uses undefined dimension '{}'",
                    name, dim
                )));
            }
        }
        if let Some(existing) = image.vars.iter().find(|v| v.name == name) {
            if existing.ty != ty || existing.dims != dims {
                return Err(PagodaError::Io(format!(
                    "variable '{}' redefined inconsistently",
                    name
                )));
            }
            return Ok(());
        }
        let def = VarDef {
            name: name.to_string(),
            ty,
            dims: dims.to_vec(),
            atts: Vec::new(),
        };
        let initial = if image.is_record_var(&def) {
            image.numrecs * image.record_size(&def)?
        } else {
            image.var_shape(&def)?.iter().product()
        };
        image.data.insert(name.to_string(), ArrayBuffer::alloc(ty, initial as usize));
        image.vars.push(def);
        Ok(())
    }

    fn put_att(&mut self, var: Option<&str>, att: Attribute) -> Result<()> {
        let mut image = self.image.write();
        let atts = match var {
            None => &mut image.atts,
            Some(name) => {
                let var = image
                    .vars
                    .iter_mut()
                    .find(|v| v.name == name)
                    .ok_or_else(|| PagodaError::Io(format!("no such variable '{}'", name)))?;
                &mut var.atts
            }
        };
        match atts.iter_mut().find(|a| a.name == att.name) {
            Some(existing) => *existing = att,
            None => atts.push(att),
        }
        Ok(())
    }

    fn enddef(&mut self) -> Result<()> {
        Ok(())
    }

    fn set_header_pad(&mut self, bytes: i64) {
        self.image.write().header_pad = bytes;
    }

    fn get_vara(&self, var: &str, start: &[i64], count: &[i64]) -> Result<ArrayBuffer> {
        self.read_rect(var, start, count)
    }

    fn put_vara(
        &mut self,
        var: &str,
        start: &[i64],
        count: &[i64],
        data: &ArrayBuffer,
    ) -> Result<()> {
        self.write_rect(var, start, count, data)
    }

    fn iget_vara(&mut self, var: &str, start: &[i64], count: &[i64]) -> Result<RequestId> {
        let request = self.next_request;
        self.next_request += 1;
        self.pending.push(Pending::Read {
            request,
            var: var.to_string(),
            start: start.to_vec(),
            count: count.to_vec(),
        });
        Ok(request)
    }

    fn iput_vara(
        &mut self,
        var: &str,
        start: &[i64],
        count: &[i64],
        data: ArrayBuffer,
    ) -> Result<RequestId> {
        let request = self.next_request;
        self.next_request += 1;
        self.pending.push(Pending::Write {
            var: var.to_string(),
            start: start.to_vec(),
            count: count.to_vec(),
            data,
        });
        Ok(request)
    }

    fn wait_all(&mut self) -> Result<Vec<CompletedRead>> {
        let pending = std::mem::take(&mut self.pending);
        let mut completed = Vec::new();
        for op in pending {
            match op {
                Pending::Read {
                    request,
                    var,
                    start,
                    count,
                } => {
                    let data = self.read_rect(&var, &start, &count)?;
                    completed.push(CompletedRead { request, data });
                }
                Pending::Write {
                    var,
                    start,
                    count,
                    data,
                } => self.write_rect(&var, &start, &count, &data)?,
            }
        }
        Ok(completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn define_write_read_round_trip() {
        let store = MemoryStore::new();
        let path = Path::new("roundtrip.nc");
        let mut file = store.create(path, FileFormat::Cdf2).unwrap();
        file.def_dim("cells", Some(4)).unwrap();
        file.def_var("T", DataType::F64, &["cells".to_string()]).unwrap();
        file.put_att(None, Attribute::text("title", "round trip")).unwrap();
        file.enddef().unwrap();
        file.put_vara("T", &[0], &[4], &ArrayBuffer::F64(vec![1.0, 2.0, 3.0, 4.0]))
            .unwrap();

        file.set_header_pad(4096);
        let reopened = store.open(path).unwrap();
        assert_eq!(reopened.format(), FileFormat::Cdf2);
        assert_eq!(reopened.header_pad(), 4096);
        let got = reopened.get_vara("T", &[1], &[2]).unwrap();
        assert_eq!(got, ArrayBuffer::F64(vec![2.0, 3.0]));
        assert_eq!(reopened.atts()[0].as_string().unwrap(), "round trip");
    }

    #[test]
    fn record_dimension_grows_with_writes() {
        let store = MemoryStore::new();
        let path = Path::new("records.nc");
        let mut file = store.create(path, FileFormat::Cdf1).unwrap();
        file.def_dim("time", None).unwrap();
        file.def_dim("cells", Some(2)).unwrap();
        file.def_var("X", DataType::I32, &["time".to_string(), "cells".to_string()])
            .unwrap();
        file.enddef().unwrap();
        for r in 0..3 {
            file.put_vara(
                "X",
                &[r, 0],
                &[1, 2],
                &ArrayBuffer::I32(vec![r as i32 * 2, r as i32 * 2 + 1]),
            )
            .unwrap();
        }
        let dims = file.dims();
        let time = dims.iter().find(|d| d.name == "time").unwrap();
        assert!(time.unlimited);
        assert_eq!(time.size, 3);
        let all = file.get_vara("X", &[0, 0], &[3, 2]).unwrap();
        assert_eq!(all, ArrayBuffer::I32(vec![0, 1, 2, 3, 4, 5]));
    }

    #[test]
    fn collective_defines_are_idempotent() {
        let store = MemoryStore::new();
        let path = Path::new("idem.nc");
        let mut a = store.create(path, FileFormat::Cdf1).unwrap();
        a.def_dim("cells", Some(4)).unwrap();
        let mut b = store.open(path).unwrap();
        b.def_dim("cells", Some(4)).unwrap();
        assert!(b.def_dim("cells", Some(5)).is_err());
        a.def_var("T", DataType::F32, &["cells".to_string()]).unwrap();
        b.def_var("T", DataType::F32, &["cells".to_string()]).unwrap();
        assert!(b.def_var("T", DataType::F64, &["cells".to_string()]).is_err());
        assert!(b.def_dim("extra", None).is_ok());
        assert!(b.def_dim("another_record", None).is_err());
    }

    #[test]
    fn queued_requests_complete_at_wait() {
        let store = MemoryStore::new();
        let path = Path::new("nbio.nc");
        let mut file = store.create(path, FileFormat::Cdf5).unwrap();
        file.def_dim("n", Some(3)).unwrap();
        file.def_var("v", DataType::I64, &["n".to_string()]).unwrap();
        file.enddef().unwrap();
        let w = file
            .iput_vara("v", &[0], &[3], ArrayBuffer::I64(vec![7, 8, 9]))
            .unwrap();
        let r = file.iget_vara("v", &[0], &[3]).unwrap();
        assert_ne!(w, r);
        // nothing lands before wait_all
        assert_eq!(
            file.get_vara("v", &[0], &[3]).unwrap(),
            ArrayBuffer::I64(vec![0, 0, 0])
        );
        let completed = file.wait_all().unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].request, r);
        assert_eq!(completed[0].data, ArrayBuffer::I64(vec![7, 8, 9]));
        assert_eq!(
            file.get_vara("v", &[0], &[3]).unwrap(),
            ArrayBuffer::I64(vec![7, 8, 9])
        );
    }
}
