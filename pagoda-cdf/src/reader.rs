use crate::store::{RequestId, VaraFile, VaraStore};
use async_trait::async_trait;
use pagoda_array::DistributedArray;
use pagoda_core::{Attribute, Dataset, Dimension, ReadHandle, Variable};
use pagoda_net::{Collectives, ProcessGroup, StreamId};
use pagoda_types::{FileFormat, PagodaError, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// The per-rank file rectangle backing a distributed array, with the record
/// axis prepended when `record` is set. Non-owning ranks contribute empty
/// vectors.
fn file_rect(
    var: &Variable,
    array: &DistributedArray,
    record: Option<i64>,
) -> (Vec<i64>, Vec<i64>) {
    if !array.owns_data() {
        return (Vec::new(), Vec::new());
    }
    let (lo, hi) = array.get_distribution();
    match record {
        None => {
            let count = lo.iter().zip(hi.iter()).map(|(l, h)| h - l + 1).collect();
            (lo, count)
        }
        Some(r) => {
            if var.ndim() <= 1 {
                // a record of a 1-D record variable is a single element
                (vec![r], vec![1])
            } else {
                let mut start = vec![r];
                start.extend(lo.iter().copied());
                let mut count = vec![1];
                count.extend(lo.iter().zip(hi.iter()).map(|(l, h)| h - l + 1));
                (start, count)
            }
        }
    }
}

struct PendingRead {
    request: RequestId,
    array: DistributedArray,
}

/// A dataset backed by one container file. Metadata is snapshotted at open;
/// reads land in freshly created arrays; non-blocking reads sit in the
/// per-dataset request pool until `wait`.
pub struct CdfDataset<S: VaraStore> {
    path: PathBuf,
    file: S::File,
    dims: Vec<Dimension>,
    vars: Vec<Variable>,
    atts: Vec<Attribute>,
    format: FileFormat,
    pending: HashMap<ReadHandle, PendingRead>,
    next_handle: ReadHandle,
}

impl<S: VaraStore> CdfDataset<S> {
    /// Collective. The existence probe runs on the root and is broadcast so
    /// every rank raises the same error for a missing file.
    pub async fn open<N: Collectives>(store: &S, path: &Path, net: &N) -> Result<CdfDataset<S>> {
        let probed = if net.is_root() {
            Some(store.exists(path))
        } else {
            None
        };
        if !net.broadcast(probed, StreamId::Io).await? {
            return Err(PagodaError::Command(format!(
                "file does not exist: {}",
                path.display()
            )));
        }
        let file = store.open(path)?;
        Ok(CdfDataset {
            path: path.to_path_buf(),
            dims: file.dims(),
            vars: file.vars(),
            atts: file.atts(),
            format: file.format(),
            file,
            pending: HashMap::new(),
            next_handle: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // Inherent metadata accessors mirroring the trait, so callers holding a
    // concrete dataset need not pin the process-group type parameter.
    pub fn get_dims(&self) -> &[Dimension] {
        &self.dims
    }

    pub fn get_vars(&self) -> &[Variable] {
        &self.vars
    }

    pub fn get_atts(&self) -> &[Attribute] {
        &self.atts
    }

    pub fn get_file_format(&self) -> FileFormat {
        self.format
    }

    pub fn get_dim(&self, name: &str) -> Option<&Dimension> {
        self.dims.iter().find(|d| d.name == name)
    }

    pub fn get_var(&self, name: &str) -> Option<&Variable> {
        self.vars.iter().find(|v| v.name == name)
    }

    pub fn get_udim(&self) -> Option<&Dimension> {
        self.dims.iter().find(|d| d.unlimited)
    }

    fn var_meta(&self, name: &str) -> Result<&Variable> {
        self.vars
            .iter()
            .find(|v| v.name == name)
            .ok_or_else(|| PagodaError::Command(format!("no such variable '{}'", name)))
    }

    fn check_record(&self, var: &Variable, record: i64) -> Result<()> {
        if record < 0 || record >= var.num_records() {
            return Err(PagodaError::Range(format!(
                "record {} beyond variable '{}' of {} records",
                record,
                var.name,
                var.num_records()
            )));
        }
        Ok(())
    }

    fn create_array<N: Collectives>(
        &self,
        var: &Variable,
        record: Option<i64>,
        net: &N,
    ) -> DistributedArray {
        let shape = match record {
            None => var.shape(),
            Some(_) => var.record_shape(),
        };
        DistributedArray::create(var.ty, shape, net)
    }

    async fn read_now<N: Collectives>(
        &self,
        name: &str,
        record: Option<i64>,
        net: &N,
    ) -> Result<DistributedArray> {
        let var = self.var_meta(name)?.clone();
        if let Some(r) = record {
            self.check_record(&var, r)?;
        }
        let mut array = self.create_array(&var, record, net);
        let (start, count) = file_rect(&var, &array, record);
        let data = self.file.get_vara(name, &start, &count)?;
        if array.owns_data() {
            *array.access_mut() = data;
        }
        net.barrier(StreamId::Io).await?;
        Ok(array)
    }

    async fn post_read<N: Collectives>(
        &mut self,
        name: &str,
        record: Option<i64>,
        net: &N,
    ) -> Result<ReadHandle> {
        let var = self.var_meta(name)?.clone();
        if let Some(r) = record {
            self.check_record(&var, r)?;
        }
        let array = self.create_array(&var, record, net);
        let (start, count) = file_rect(&var, &array, record);
        let request = self.file.iget_vara(name, &start, &count)?;
        let handle = self.next_handle;
        self.next_handle += 1;
        self.pending.insert(handle, PendingRead { request, array });
        Ok(handle)
    }
}

#[async_trait]
impl<S: VaraStore, N: Collectives + 'static> Dataset<N> for CdfDataset<S> {
    fn get_dims(&self) -> &[Dimension] {
        &self.dims
    }

    fn get_vars(&self) -> &[Variable] {
        &self.vars
    }

    fn get_atts(&self) -> &[Attribute] {
        &self.atts
    }

    fn get_file_format(&self) -> FileFormat {
        self.format
    }

    async fn read(&self, var: &str, net: &N) -> Result<DistributedArray> {
        self.read_now(var, None, net).await
    }

    async fn read_record(&self, var: &str, record: i64, net: &N) -> Result<DistributedArray> {
        self.read_now(var, Some(record), net).await
    }

    async fn iread(&mut self, var: &str, net: &N) -> Result<ReadHandle> {
        self.post_read(var, None, net).await
    }

    async fn iread_record(&mut self, var: &str, record: i64, net: &N) -> Result<ReadHandle> {
        self.post_read(var, Some(record), net).await
    }

    async fn wait(&mut self, net: &N) -> Result<()> {
        let completed = self.file.wait_all()?;
        let by_request: HashMap<RequestId, pagoda_array::ArrayBuffer> = completed
            .into_iter()
            .map(|c| (c.request, c.data))
            .collect();
        for pending in self.pending.values_mut() {
            if let Some(data) = by_request.get(&pending.request) {
                if pending.array.owns_data() {
                    *pending.array.access_mut() = data.clone();
                }
            }
        }
        net.barrier(StreamId::Io).await?;
        Ok(())
    }

    fn take(&mut self, handle: ReadHandle) -> Option<DistributedArray> {
        self.pending.remove(&handle).map(|p| p.array)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::store::VaraFile;
    use pagoda_array::ArrayBuffer;
    use pagoda_net::LocalProcessGroup;
    use pagoda_types::DataType;

    const NPROCS: usize = 4;

    fn seed_input(store: &MemoryStore) {
        let mut file = store
            .create(Path::new("in.nc"), FileFormat::Cdf2)
            .unwrap();
        file.def_dim("time", None).unwrap();
        file.def_dim("cells", Some(2)).unwrap();
        file.def_var("X", DataType::F64, &["time".to_string(), "cells".to_string()])
            .unwrap();
        file.enddef().unwrap();
        file.put_vara(
            "X",
            &[0, 0],
            &[4, 2],
            &ArrayBuffer::F64(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]),
        )
        .unwrap();
    }

    #[tokio::test]
    async fn missing_file_raises_on_every_rank() {
        let group = LocalProcessGroup::new_local_group(NPROCS).await.unwrap();
        let store = MemoryStore::new();
        let results = group
            .simulate_group_round(store, |net, store| async move {
                match CdfDataset::open(&store, Path::new("absent.nc"), &net).await {
                    Err(PagodaError::Command(msg)) => msg,
                    _ => panic!("expected a command error"),
                }
            })
            .await;
        for msg in results {
            assert!(msg.contains("file does not exist"));
        }
    }

    #[tokio::test]
    async fn blocking_and_nonblocking_reads_agree() {
        let group = LocalProcessGroup::new_local_group(NPROCS).await.unwrap();
        let store = MemoryStore::new();
        seed_input(&store);
        let results = group
            .simulate_group_round(store, |net, store| async move {
                let mut ds = CdfDataset::open(&store, Path::new("in.nc"), &net)
                    .await
                    .unwrap();
                assert_eq!(ds.get_udim().unwrap().name, "time");

                let whole = ds.read("X", &net).await.unwrap();
                let record2 = ds.read_record("X", 2, &net).await.unwrap();

                let h_whole = ds.iread("X", &net).await.unwrap();
                let h_record = ds.iread_record("X", 2, &net).await.unwrap();
                ds.wait(&net).await.unwrap();
                let iwhole = Dataset::<pagoda_net::multi::GroupConnection<tokio::net::TcpStream>>::take(
                    &mut ds, h_whole,
                )
                .unwrap();
                let irecord = Dataset::<pagoda_net::multi::GroupConnection<tokio::net::TcpStream>>::take(
                    &mut ds, h_record,
                )
                .unwrap();

                assert!(ds.read_record("X", 9, &net).await.is_err());

                (
                    whole.get(&[0, 0], &[3, 1], &net).await.unwrap(),
                    iwhole.get(&[0, 0], &[3, 1], &net).await.unwrap(),
                    record2.get(&[0], &[1], &net).await.unwrap(),
                    irecord.get(&[0], &[1], &net).await.unwrap(),
                )
            })
            .await;
        for (whole, iwhole, record2, irecord) in results {
            assert_eq!(whole, iwhole);
            assert_eq!(record2, irecord);
            assert_eq!(record2, ArrayBuffer::F64(vec![5.0, 6.0]));
        }
    }
}
