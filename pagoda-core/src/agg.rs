use crate::dataset::{Attribute, Dataset, Dimension, ReadHandle, Variable};
use async_trait::async_trait;
use pagoda_array::{copy_patch, DistributedArray};
use pagoda_net::Collectives;
use pagoda_types::{FileFormat, PagodaError, Result};
use std::collections::{HashMap, HashSet};

/// A dataset composed of member datasets matched by name: first writer wins
/// for attributes and variables, dimension size conflicts are fatal.
pub struct AggregationUnion<N: Collectives + 'static> {
    members: Vec<Box<dyn Dataset<N>>>,
    dims: Vec<Dimension>,
    atts: Vec<Attribute>,
    vars: Vec<Variable>,
    var_owner: HashMap<String, usize>,
    format: Option<FileFormat>,
    handles: HashMap<ReadHandle, (usize, ReadHandle)>,
    next_handle: ReadHandle,
}

impl<N: Collectives + 'static> AggregationUnion<N> {
    pub fn new() -> AggregationUnion<N> {
        AggregationUnion {
            members: Vec::new(),
            dims: Vec::new(),
            atts: Vec::new(),
            vars: Vec::new(),
            var_owner: HashMap::new(),
            format: None,
            handles: HashMap::new(),
            next_handle: 0,
        }
    }

    pub fn add(&mut self, ds: Box<dyn Dataset<N>>) -> Result<()> {
        for dim in ds.get_dims() {
            match self.dims.iter().find(|d| d.name == dim.name) {
                Some(existing) if existing != dim => {
                    return Err(PagodaError::DimensionMismatch(format!(
                        "dimension '{}' is {} here but {} in an earlier member",
                        dim.name, dim.size, existing.size
                    )));
                }
                Some(_) => {}
                None => self.dims.push(dim.clone()),
            }
        }
        for att in ds.get_atts() {
            if !self.atts.iter().any(|a| a.name == att.name) {
                self.atts.push(att.clone());
            }
        }
        let index = self.members.len();
        for var in ds.get_vars() {
            if !self.var_owner.contains_key(&var.name) {
                self.var_owner.insert(var.name.clone(), index);
                self.vars.push(var.clone());
            }
        }
        if self.format.is_none() {
            self.format = Some(ds.get_file_format());
        }
        self.members.push(ds);
        Ok(())
    }

    fn owner(&self, var: &str) -> Result<usize> {
        self.var_owner.get(var).copied().ok_or_else(|| {
            PagodaError::Command(format!("variable '{}' not found in aggregation", var))
        })
    }
}

impl<N: Collectives + 'static> Default for AggregationUnion<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<N: Collectives + 'static> Dataset<N> for AggregationUnion<N> {
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
        self.format.unwrap_or_default()
    }

    async fn read(&self, var: &str, net: &N) -> Result<DistributedArray> {
        let owner = self.owner(var)?;
        self.members[owner].read(var, net).await
    }

    async fn read_record(&self, var: &str, record: i64, net: &N) -> Result<DistributedArray> {
        let owner = self.owner(var)?;
        self.members[owner].read_record(var, record, net).await
    }

    async fn iread(&mut self, var: &str, net: &N) -> Result<ReadHandle> {
        let owner = self.owner(var)?;
        let inner = self.members[owner].iread(var, net).await?;
        let handle = self.next_handle;
        self.next_handle += 1;
        self.handles.insert(handle, (owner, inner));
        Ok(handle)
    }

    async fn iread_record(&mut self, var: &str, record: i64, net: &N) -> Result<ReadHandle> {
        let owner = self.owner(var)?;
        let inner = self.members[owner].iread_record(var, record, net).await?;
        let handle = self.next_handle;
        self.next_handle += 1;
        self.handles.insert(handle, (owner, inner));
        Ok(handle)
    }

    async fn wait(&mut self, net: &N) -> Result<()> {
        for member in self.members.iter_mut() {
            member.wait(net).await?;
        }
        Ok(())
    }

    fn take(&mut self, handle: ReadHandle) -> Option<DistributedArray> {
        let (owner, inner) = self.handles.remove(&handle)?;
        self.members[owner].take(inner)
    }
}

enum PendingJoin {
    Forward(usize, ReadHandle),
    Done(DistributedArray),
}

/// A dataset whose members are concatenated along one existing dimension.
/// A variable whose outer dimension is the join dimension reads record `r`
/// from the member bracketing `r`; everything else is union-merged.
pub struct AggregationJoinExisting<N: Collectives + 'static> {
    join_dim: String,
    members: Vec<Box<dyn Dataset<N>>>,
    member_sizes: Vec<i64>,
    dims: Vec<Dimension>,
    atts: Vec<Attribute>,
    vars: Vec<Variable>,
    var_owner: HashMap<String, usize>,
    agg_vars: HashSet<String>,
    format: Option<FileFormat>,
    handles: HashMap<ReadHandle, PendingJoin>,
    next_handle: ReadHandle,
}

impl<N: Collectives + 'static> AggregationJoinExisting<N> {
    pub fn new(join_dim: impl Into<String>) -> AggregationJoinExisting<N> {
        AggregationJoinExisting {
            join_dim: join_dim.into(),
            members: Vec::new(),
            member_sizes: Vec::new(),
            dims: Vec::new(),
            atts: Vec::new(),
            vars: Vec::new(),
            var_owner: HashMap::new(),
            agg_vars: HashSet::new(),
            format: None,
            handles: HashMap::new(),
            next_handle: 0,
        }
    }

    pub fn add(&mut self, ds: Box<dyn Dataset<N>>) -> Result<()> {
        let join = self.join_dim.clone();
        let joined = ds.get_dim(&join).cloned().ok_or_else(|| {
            PagodaError::DimensionMismatch(format!("member does not expose dimension '{}'", join))
        })?;
        let outer_joined = |v: &Variable| v.dims.first().map(|d| d.name == join).unwrap_or(false);
        if !ds.get_vars().iter().any(|v| outer_joined(v)) {
            return Err(PagodaError::DimensionMismatch(format!(
                "member has no variable along '{}'",
                join
            )));
        }

        for dim in ds.get_dims() {
            if dim.name == join {
                if self.dims.iter().all(|d| d.name != join) {
                    self.dims.push(Dimension::record(&join, 0));
                }
                continue;
            }
            match self.dims.iter().find(|d| d.name == dim.name) {
                Some(existing) if existing != dim => {
                    return Err(PagodaError::DimensionMismatch(format!(
                        "dimension '{}' is {} here but {} in an earlier member",
                        dim.name, dim.size, existing.size
                    )));
                }
                Some(_) => {}
                None => self.dims.push(dim.clone()),
            }
        }
        for att in ds.get_atts() {
            if !self.atts.iter().any(|a| a.name == att.name) {
                self.atts.push(att.clone());
            }
        }
        let index = self.members.len();
        for var in ds.get_vars() {
            if outer_joined(var) {
                if !self.agg_vars.contains(&var.name) {
                    self.agg_vars.insert(var.name.clone());
                    self.vars.push(var.clone());
                }
            } else if !self.var_owner.contains_key(&var.name) {
                self.var_owner.insert(var.name.clone(), index);
                self.vars.push(var.clone());
            }
        }
        if self.format.is_none() {
            self.format = Some(ds.get_file_format());
        }
        self.member_sizes.push(joined.size);
        self.members.push(ds);
        self.refresh_join_sizes();
        Ok(())
    }

    fn refresh_join_sizes(&mut self) {
        let total: i64 = self.member_sizes.iter().sum();
        for dim in self.dims.iter_mut() {
            if dim.name == self.join_dim {
                dim.size = total;
                dim.unlimited = true;
            }
        }
        for var in self.vars.iter_mut() {
            for dim in var.dims.iter_mut() {
                if dim.name == self.join_dim {
                    dim.size = total;
                    dim.unlimited = true;
                }
            }
        }
    }

    /// The member holding aggregate record `r`, and its local record offset.
    fn locate(&self, record: i64) -> Result<(usize, i64)> {
        let mut offset = record;
        for (m, size) in self.member_sizes.iter().enumerate() {
            if offset < *size {
                return Ok((m, offset));
            }
            offset -= size;
        }
        Err(PagodaError::Range(format!(
            "record {} beyond aggregation of {}",
            record,
            self.member_sizes.iter().sum::<i64>()
        )))
    }

    fn owner(&self, var: &str) -> Result<usize> {
        self.var_owner.get(var).copied().ok_or_else(|| {
            PagodaError::Command(format!("variable '{}' not found in aggregation", var))
        })
    }
}

#[async_trait]
impl<N: Collectives + 'static> Dataset<N> for AggregationJoinExisting<N> {
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
        self.format.unwrap_or_default()
    }

    async fn read(&self, var: &str, net: &N) -> Result<DistributedArray> {
        if !self.agg_vars.contains(var) {
            let owner = self.owner(var)?;
            return self.members[owner].read(var, net).await;
        }
        let template = self
            .get_var(var)
            .ok_or_else(|| PagodaError::Command(format!("no such variable '{}'", var)))?
            .clone();
        let shape = template.shape();
        let mut result = DistributedArray::create(template.ty, shape.clone(), net);
        let tail = &shape[1..];
        let mut offset = 0i64;
        for (m, size) in self.member_sizes.iter().enumerate() {
            if *size == 0 {
                continue;
            }
            let part = self.members[m].read(var, net).await?;
            let src_lo = vec![0i64; shape.len()];
            let mut src_hi = vec![*size - 1];
            src_hi.extend(tail.iter().map(|t| t - 1));
            let mut dst_lo = vec![offset];
            dst_lo.extend(std::iter::repeat(0).take(tail.len()));
            let mut dst_hi = vec![offset + size - 1];
            dst_hi.extend(tail.iter().map(|t| t - 1));
            copy_patch(&part, &src_lo, &src_hi, &mut result, &dst_lo, &dst_hi, net).await?;
            offset += size;
        }
        Ok(result)
    }

    async fn read_record(&self, var: &str, record: i64, net: &N) -> Result<DistributedArray> {
        if self.agg_vars.contains(var) {
            let (member, local) = self.locate(record)?;
            self.members[member].read_record(var, local, net).await
        } else {
            let owner = self.owner(var)?;
            self.members[owner].read_record(var, record, net).await
        }
    }

    async fn iread(&mut self, var: &str, net: &N) -> Result<ReadHandle> {
        let pending = if self.agg_vars.contains(var) {
            // member-spanning reads complete immediately
            PendingJoin::Done(self.read(var, net).await?)
        } else {
            let owner = self.owner(var)?;
            PendingJoin::Forward(owner, self.members[owner].iread(var, net).await?)
        };
        let handle = self.next_handle;
        self.next_handle += 1;
        self.handles.insert(handle, pending);
        Ok(handle)
    }

    async fn iread_record(&mut self, var: &str, record: i64, net: &N) -> Result<ReadHandle> {
        let pending = if self.agg_vars.contains(var) {
            let (member, local) = self.locate(record)?;
            PendingJoin::Forward(member, self.members[member].iread_record(var, local, net).await?)
        } else {
            let owner = self.owner(var)?;
            PendingJoin::Forward(owner, self.members[owner].iread_record(var, record, net).await?)
        };
        let handle = self.next_handle;
        self.next_handle += 1;
        self.handles.insert(handle, pending);
        Ok(handle)
    }

    async fn wait(&mut self, net: &N) -> Result<()> {
        for member in self.members.iter_mut() {
            member.wait(net).await?;
        }
        Ok(())
    }

    fn take(&mut self, handle: ReadHandle) -> Option<DistributedArray> {
        match self.handles.remove(&handle)? {
            PendingJoin::Forward(member, inner) => self.members[member].take(inner),
            PendingJoin::Done(array) => Some(array),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pagoda_array::{block_distribution, ArrayBuffer};
    use pagoda_net::LocalProcessGroup;
    use pagoda_types::DataType;

    const NPROCS: usize = 4;

    /// A dataset backed by in-memory buffers, for exercising aggregations.
    struct TestDataset {
        dims: Vec<Dimension>,
        vars: Vec<Variable>,
        atts: Vec<Attribute>,
        data: HashMap<String, ArrayBuffer>,
        pending: Vec<DistributedArray>,
    }

    impl TestDataset {
        fn new(dims: Vec<Dimension>, vars: Vec<Variable>) -> TestDataset {
            TestDataset {
                dims,
                vars,
                atts: Vec::new(),
                data: HashMap::new(),
                pending: Vec::new(),
            }
        }

        fn with(mut self, name: &str, values: ArrayBuffer) -> TestDataset {
            self.data.insert(name.to_string(), values);
            self
        }

        fn load<N: Collectives>(
            &self,
            var: &Variable,
            shape: Vec<i64>,
            slice: ArrayBuffer,
            net: &N,
        ) -> Result<DistributedArray> {
            let mut array = DistributedArray::create(var.ty, shape, net);
            if array.owns_data() {
                let (lo, hi) = array.get_distribution();
                let row: i64 = array.get_shape()[1..].iter().product();
                let start = (lo[0] * row) as usize;
                let len = ((hi[0] - lo[0] + 1) * row) as usize;
                let local = slice.slice(start, len);
                *array.access_mut() = local;
            }
            Ok(array)
        }
    }

    #[async_trait]
    impl<N: Collectives + 'static> Dataset<N> for TestDataset {
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
            FileFormat::Cdf2
        }

        async fn read(&self, var: &str, net: &N) -> Result<DistributedArray> {
            let v = <Self as Dataset<N>>::get_var(self, var).unwrap().clone();
            let buf = self.data.get(var).unwrap().clone();
            self.load(&v, v.shape(), buf, net)
        }

        async fn read_record(&self, var: &str, record: i64, net: &N) -> Result<DistributedArray> {
            let v = <Self as Dataset<N>>::get_var(self, var).unwrap().clone();
            let shape = v.record_shape();
            let len: i64 = shape.iter().product();
            let buf = self
                .data
                .get(var)
                .unwrap()
                .slice((record * len) as usize, len as usize);
            self.load(&v, shape, buf, net)
        }

        async fn iread(&mut self, var: &str, net: &N) -> Result<ReadHandle> {
            let array = self.read(var, net).await?;
            self.pending.push(array);
            Ok(self.pending.len() - 1)
        }

        async fn iread_record(&mut self, var: &str, record: i64, net: &N) -> Result<ReadHandle> {
            let array = self.read_record(var, record, net).await?;
            self.pending.push(array);
            Ok(self.pending.len() - 1)
        }

        async fn wait(&mut self, _net: &N) -> Result<()> {
            Ok(())
        }

        fn take(&mut self, handle: ReadHandle) -> Option<DistributedArray> {
            self.pending.get(handle).cloned()
        }
    }

    fn join_member(values: Vec<i32>) -> TestDataset {
        let time = Dimension::record("time", 3);
        let cells = Dimension::fixed("cells", 2);
        let t = Variable::new("T", DataType::I32, vec![time.clone(), cells.clone()]);
        TestDataset::new(vec![time, cells], vec![t]).with("T", ArrayBuffer::I32(values))
    }

    #[tokio::test]
    async fn join_existing_concatenates_records() {
        let group = LocalProcessGroup::new_local_group(NPROCS).await.unwrap();
        let results = group
            .simulate_group_round((), |net, _| async move {
                let mut agg = AggregationJoinExisting::new("time");
                agg.add(Box::new(join_member((0..6).collect()))).unwrap();
                agg.add(Box::new(join_member((10..16).collect()))).unwrap();

                assert_eq!(agg.get_dim("time").unwrap().size, 6);
                assert!(agg.get_udim().is_some());
                let record4 = agg.read_record("T", 4, &net).await.unwrap();
                let whole = agg.read("T", &net).await.unwrap();
                (
                    record4.get(&[0], &[1], &net).await.unwrap(),
                    whole.get(&[0, 0], &[5, 1], &net).await.unwrap(),
                )
            })
            .await;
        for (record4, whole) in results {
            // record 4 of the aggregation is record 1 of the second member
            assert_eq!(record4, ArrayBuffer::I32(vec![12, 13]));
            assert_eq!(
                whole,
                ArrayBuffer::I32(vec![0, 1, 2, 3, 4, 5, 10, 11, 12, 13, 14, 15])
            );
        }
    }

    #[tokio::test]
    async fn union_first_wins_and_conflicts_are_fatal() {
        let group = LocalProcessGroup::new_local_group(NPROCS).await.unwrap();
        let results = group
            .simulate_group_round((), |net, _| async move {
                let cells = Dimension::fixed("cells", 3);
                let a = TestDataset::new(
                    vec![cells.clone()],
                    vec![Variable::new("P", DataType::I32, vec![cells.clone()])],
                )
                .with("P", ArrayBuffer::I32(vec![1, 2, 3]));
                let b = TestDataset::new(
                    vec![cells.clone()],
                    vec![
                        Variable::new("P", DataType::I32, vec![cells.clone()]),
                        Variable::new("Q", DataType::I32, vec![cells.clone()]),
                    ],
                )
                .with("P", ArrayBuffer::I32(vec![7, 8, 9]))
                .with("Q", ArrayBuffer::I32(vec![4, 5, 6]));

                let mut agg = AggregationUnion::new();
                agg.add(Box::new(a)).unwrap();
                agg.add(Box::new(b)).unwrap();

                let p = agg.read("P", &net).await.unwrap();
                let q = agg.read("Q", &net).await.unwrap();
                let p = p.get(&[0], &[2], &net).await.unwrap();
                let q = q.get(&[0], &[2], &net).await.unwrap();

                let shorter = Dimension::fixed("cells", 2);
                let bad = TestDataset::new(
                    vec![shorter.clone()],
                    vec![Variable::new("R", DataType::I32, vec![shorter])],
                )
                .with("R", ArrayBuffer::I32(vec![0, 0]));
                let conflict = agg.add(Box::new(bad)).is_err();
                (p, q, conflict)
            })
            .await;
        for (p, q, conflict) in results {
            // the first member's P wins
            assert_eq!(p, ArrayBuffer::I32(vec![1, 2, 3]));
            assert_eq!(q, ArrayBuffer::I32(vec![4, 5, 6]));
            assert!(conflict);
        }
    }

    #[test]
    fn block_math_matches_test_loader() {
        // the loader slices flat storage by leading-axis blocks
        let shape = vec![6i64, 2];
        let (lo, hi) = block_distribution(&shape, 3, 1);
        assert_eq!((lo[0], hi[0]), (2, 3));
    }

    #[test]
    fn join_requires_the_dimension() {
        type Net = pagoda_net::multi::GroupConnection<tokio::net::TcpStream>;
        let cells = Dimension::fixed("cells", 2);
        let ds = TestDataset::new(
            vec![cells.clone()],
            vec![Variable::new("P", DataType::I32, vec![cells])],
        )
        .with("P", ArrayBuffer::I32(vec![1, 2]));
        let mut agg = AggregationJoinExisting::<Net>::new("time");
        assert!(agg.add(Box::new(ds)).is_err());
    }
}
