use crate::store::{VaraFile, VaraStore};
use pagoda_array::DistributedArray;
use pagoda_core::{Attribute, Dimension, Variable};
use pagoda_net::{Collectives, ProcessGroup, StreamId};
use pagoda_types::{FileFormat, PagodaError, Result};
use std::path::{Path, PathBuf};

#[derive(Clone, Debug, Default)]
pub struct WriterOptions {
    pub append: bool,
    pub overwrite: bool,
    /// Freeze the unlimited dimension to its current size.
    pub fix_record_dimension: bool,
    pub header_pad: Option<i64>,
    /// Falls back to the first input's format when unset.
    pub format: Option<FileFormat>,
}

#[derive(PartialEq)]
enum Phase {
    Define,
    Data,
}

/// Writes one output file in two phases: definitions first, then data.
/// The first write emits the end-of-define marker; defining anything after
/// that is fatal.
pub struct FileWriter<S: VaraStore> {
    path: PathBuf,
    file: S::File,
    phase: Phase,
    fix_record: bool,
}

impl<S: VaraStore> FileWriter<S> {
    /// Collective. Validates `overwrite`/`append` against the target before
    /// any resources are allocated; creation is serialized through the root.
    pub async fn create<N: Collectives>(
        store: &S,
        path: &Path,
        options: &WriterOptions,
        default_format: FileFormat,
        net: &N,
    ) -> Result<FileWriter<S>> {
        let probed = if net.is_root() {
            Some(store.exists(path))
        } else {
            None
        };
        let exists = net.broadcast(probed, StreamId::Io).await?;
        if exists && !options.overwrite && !options.append {
            return Err(PagodaError::Command(format!(
                "{} exists; use overwrite or append",
                path.display()
            )));
        }
        let appending = exists && options.append;
        let format = options.format.unwrap_or(default_format);
        let file = if appending {
            store.open(path)?
        } else {
            // the root truncates, everyone else attaches afterwards
            if net.is_root() {
                store.create(path, format)?;
            }
            net.barrier(StreamId::Io).await?;
            store.open(path)?
        };
        let mut writer = FileWriter {
            path: path.to_path_buf(),
            file,
            phase: Phase::Define,
            fix_record: options.fix_record_dimension,
        };
        if let Some(pad) = options.header_pad {
            VaraFile::set_header_pad(&mut writer.file, pad);
        }
        Ok(writer)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn check_define(&self) -> Result<()> {
        if self.phase != Phase::Define {
            return Err(PagodaError::Command(
                "definition is closed once data has been written".to_string(),
            ));
        }
        Ok(())
    }

    /// Define a dimension; the unlimited dimension becomes fixed when the
    /// writer was asked to freeze it.
    pub fn def_dim(&mut self, dim: &Dimension) -> Result<()> {
        self.check_define()?;
        let size = if dim.unlimited && !self.fix_record {
            None
        } else {
            Some(dim.size)
        };
        self.file.def_dim(&dim.name, size)
    }

    /// Define a variable and copy its attributes.
    pub fn def_var(&mut self, var: &Variable) -> Result<()> {
        self.check_define()?;
        let dims: Vec<String> = var.dims.iter().map(|d| d.name.clone()).collect();
        self.file.def_var(&var.name, var.ty, &dims)?;
        for att in &var.atts {
            self.file.put_att(Some(&var.name), att.clone())?;
        }
        Ok(())
    }

    /// Write a global attribute.
    pub fn write_att(&mut self, att: &Attribute) -> Result<()> {
        self.check_define()?;
        self.file.put_att(None, att.clone())
    }

    fn promote(&mut self) -> Result<()> {
        if self.phase == Phase::Define {
            self.file.enddef()?;
            self.phase = Phase::Data;
        }
        Ok(())
    }

    fn var_ndim(&self, name: &str) -> usize {
        self.file
            .vars()
            .iter()
            .find(|v| v.name == name)
            .map(|v| v.ndim())
            .unwrap_or(1)
    }

    fn rect(
        array: &DistributedArray,
        record: Option<i64>,
        at: &[i64],
        var_ndim: usize,
    ) -> (Vec<i64>, Vec<i64>) {
        if !array.owns_data() {
            return (Vec::new(), Vec::new());
        }
        let (lo, hi) = array.get_distribution();
        let extents: Vec<i64> = lo.iter().zip(hi.iter()).map(|(l, h)| h - l + 1).collect();
        match record {
            // one record of a 1-D record variable is a single element
            Some(r) if var_ndim <= 1 => (vec![r], vec![1]),
            Some(r) => {
                let mut start = vec![r];
                start.extend(lo.iter().copied());
                let mut count = vec![1];
                count.extend(extents);
                (start, count)
            }
            None => {
                let start = lo
                    .iter()
                    .enumerate()
                    .map(|(d, l)| l + at.get(d).copied().unwrap_or(0))
                    .collect();
                (start, extents)
            }
        }
    }

    /// Collective whole-shape write.
    pub async fn write<N: Collectives>(
        &mut self,
        array: &DistributedArray,
        name: &str,
        net: &N,
    ) -> Result<()> {
        self.write_at(array, name, &[], net).await
    }

    /// Collective write of one record; the array holds the record's shape.
    pub async fn write_record<N: Collectives>(
        &mut self,
        array: &DistributedArray,
        name: &str,
        record: i64,
        net: &N,
    ) -> Result<()> {
        self.promote()?;
        let (start, count) = Self::rect(array, Some(record), &[], self.var_ndim(name));
        self.file.put_vara(name, &start, &count, array.access())?;
        net.barrier(StreamId::Io).await?;
        Ok(())
    }

    /// Collective patch write at a global offset.
    pub async fn write_at<N: Collectives>(
        &mut self,
        array: &DistributedArray,
        name: &str,
        at: &[i64],
        net: &N,
    ) -> Result<()> {
        self.promote()?;
        let (start, count) = Self::rect(array, None, at, self.var_ndim(name));
        self.file.put_vara(name, &start, &count, array.access())?;
        net.barrier(StreamId::Io).await?;
        Ok(())
    }

    /// Post a non-blocking whole-shape write.
    pub fn iwrite(&mut self, array: &DistributedArray, name: &str) -> Result<()> {
        self.promote()?;
        let (start, count) = Self::rect(array, None, &[], self.var_ndim(name));
        self.file
            .iput_vara(name, &start, &count, array.access().clone())?;
        Ok(())
    }

    /// Post a non-blocking single-record write.
    pub fn iwrite_record(
        &mut self,
        array: &DistributedArray,
        name: &str,
        record: i64,
    ) -> Result<()> {
        self.promote()?;
        let (start, count) = Self::rect(array, Some(record), &[], self.var_ndim(name));
        self.file
            .iput_vara(name, &start, &count, array.access().clone())?;
        Ok(())
    }

    /// Collective. Complete every pending non-blocking write.
    pub async fn wait<N: Collectives>(&mut self, net: &N) -> Result<()> {
        self.promote()?;
        self.file.wait_all()?;
        net.barrier(StreamId::Io).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::reader::CdfDataset;
    use pagoda_array::DistributedArray;
    use pagoda_types::DataType;

    const NPROCS: usize = 4;

    #[tokio::test]
    async fn define_then_write_then_redefine_fails() {
        let group = pagoda_net::LocalProcessGroup::new_local_group(NPROCS)
            .await
            .unwrap();
        let store = MemoryStore::new();
        let results = group
            .simulate_group_round(store, |net, store| async move {
                let mut writer = FileWriter::create(
                    &store,
                    Path::new("out.nc"),
                    &WriterOptions::default(),
                    FileFormat::Cdf2,
                    &net,
                )
                .await
                .unwrap();
                let cells = Dimension::fixed("cells", 4);
                writer.def_dim(&cells).unwrap();
                writer
                    .def_var(&Variable::new("T", DataType::F32, vec![cells.clone()]))
                    .unwrap();

                let mut t = DistributedArray::create(DataType::F32, vec![4], &net);
                t.fill_value(2.5).unwrap();
                writer.write(&t, "T", &net).await.unwrap();

                writer.def_dim(&Dimension::fixed("late", 1)).is_err()
            })
            .await;
        assert!(results.into_iter().all(|failed| failed));
    }

    #[tokio::test]
    async fn overwrite_and_append_are_validated() {
        let group = pagoda_net::LocalProcessGroup::new_local_group(NPROCS)
            .await
            .unwrap();
        let store = MemoryStore::new();
        let results = group
            .simulate_group_round(store, |net, store| async move {
                let path = Path::new("exists.nc");
                let options = WriterOptions::default();
                let mut writer =
                    FileWriter::create(&store, path, &options, FileFormat::Cdf1, &net)
                        .await
                        .unwrap();
                writer.def_dim(&Dimension::fixed("n", 1)).unwrap();
                let refused = FileWriter::create(&store, path, &options, FileFormat::Cdf1, &net)
                    .await
                    .is_err();
                let allowed = FileWriter::create(
                    &store,
                    path,
                    &WriterOptions {
                        overwrite: true,
                        ..Default::default()
                    },
                    FileFormat::Cdf1,
                    &net,
                )
                .await
                .is_ok();
                (refused, allowed)
            })
            .await;
        for (refused, allowed) in results {
            assert!(refused);
            assert!(allowed);
        }
    }

    #[tokio::test]
    async fn frozen_record_dimension_is_fixed_in_the_output() {
        let group = pagoda_net::LocalProcessGroup::new_local_group(NPROCS)
            .await
            .unwrap();
        let store = MemoryStore::new();
        let results = group
            .simulate_group_round(store, |net, store| async move {
                let mut writer = FileWriter::create(
                    &store,
                    Path::new("fixed.nc"),
                    &WriterOptions {
                        fix_record_dimension: true,
                        ..Default::default()
                    },
                    FileFormat::Cdf2,
                    &net,
                )
                .await
                .unwrap();
                writer.def_dim(&Dimension::record("time", 3)).unwrap();
                writer
                    .def_var(&Variable::new(
                        "t",
                        DataType::F64,
                        vec![Dimension::record("time", 3)],
                    ))
                    .unwrap();
                let mut t = DistributedArray::create(DataType::F64, vec![3], &net);
                pagoda_array::enumerate(&mut t, 0.0, 1.0).unwrap();
                writer.write(&t, "t", &net).await.unwrap();

                let ds = CdfDataset::open(&store, Path::new("fixed.nc"), &net)
                    .await
                    .unwrap();
                let time = ds.get_dim("time").unwrap().clone();
                (time.unlimited, time.size)
            })
            .await;
        for (unlimited, size) in results {
            assert!(!unlimited);
            assert_eq!(size, 3);
        }
    }
}
