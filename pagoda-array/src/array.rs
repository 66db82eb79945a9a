use crate::buffer::ArrayBuffer;
use crate::shape::{flat_indices_of_rect, ravel, rect_extents, rect_intersect, rect_size};
use pagoda_net::{Collectives, ProcessGroup, StreamId};
use pagoda_types::{DataType, PagodaError, Result};
use serde::{Deserialize, Serialize};

/// The near-equal block of axis 0 owned by `rank`. A rank with no rows gets
/// the all-negative rectangle.
pub fn block_distribution(shape: &[i64], nprocs: usize, rank: usize) -> (Vec<i64>, Vec<i64>) {
    let ndim = shape.len();
    let rows = shape[0];
    let base = rows / nprocs as i64;
    let rem = (rows % nprocs as i64) as usize;
    let mine = base + i64::from(rank < rem);
    if mine == 0 {
        return (vec![-1; ndim], vec![-1; ndim]);
    }
    let start = rank as i64 * base + rem.min(rank) as i64;
    let mut lo = vec![0; ndim];
    let mut hi: Vec<i64> = shape.iter().map(|s| s - 1).collect();
    lo[0] = start;
    hi[0] = start + mine - 1;
    (lo, hi)
}

fn owner_of_row(shape: &[i64], nprocs: usize, row: i64) -> usize {
    let rows = shape[0];
    let base = rows / nprocs as i64;
    let rem = rows % nprocs as i64;
    let cut = rem * (base + 1);
    if row < cut {
        (row / (base + 1)) as usize
    } else {
        (rem + (row - cut) / base.max(1)) as usize
    }
}

/// A rectangular patch in global coordinates.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct Patch {
    lo: Vec<i64>,
    hi: Vec<i64>,
    data: ArrayBuffer,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct PointMsg {
    subs: Vec<i64>,
    data: ArrayBuffer,
}

/// A typed rectangular array block-partitioned along axis 0 across the
/// process group. Creation and every data-moving operation is collective;
/// `access`/`access_mut` expose the locally owned rectangle.
#[derive(Debug, Clone, PartialEq)]
pub struct DistributedArray {
    ty: DataType,
    shape: Vec<i64>,
    lo: Vec<i64>,
    hi: Vec<i64>,
    local: ArrayBuffer,
    nprocs: usize,
}

impl DistributedArray {
    /// Collective. `shape` is global; ranks that receive no rows of axis 0
    /// own no data.
    pub fn create<N: ProcessGroup>(ty: DataType, shape: Vec<i64>, net: &N) -> DistributedArray {
        assert!(!shape.is_empty(), "arrays have at least one axis");
        let (lo, hi) = block_distribution(&shape, net.nprocs(), net.rank() as usize);
        let n = if lo[0] < 0 { 0 } else { rect_size(&lo, &hi) };
        DistributedArray {
            ty,
            shape,
            lo,
            hi,
            local: ArrayBuffer::alloc(ty, n as usize),
            nprocs: net.nprocs(),
        }
    }

    /// Collective. A fresh zeroed array with this array's shape and type.
    pub fn duplicate<N: ProcessGroup>(&self, net: &N) -> DistributedArray {
        DistributedArray::create(self.ty, self.shape.clone(), net)
    }

    pub fn get_type(&self) -> DataType {
        self.ty
    }

    pub fn get_shape(&self) -> &[i64] {
        &self.shape
    }

    pub fn get_ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn owns_data(&self) -> bool {
        self.lo[0] >= 0
    }

    pub fn get_distribution(&self) -> (Vec<i64>, Vec<i64>) {
        (self.lo.clone(), self.hi.clone())
    }

    pub fn get_local_shape(&self) -> Vec<i64> {
        if self.owns_data() {
            rect_extents(&self.lo, &self.hi)
        } else {
            vec![0; self.shape.len()]
        }
    }

    pub fn get_local_size(&self) -> i64 {
        self.local.len() as i64
    }

    pub fn same_distribution(&self, other: &DistributedArray) -> bool {
        self.shape == other.shape && self.nprocs == other.nprocs
    }

    /// Local read view of the owned rectangle.
    pub fn access(&self) -> &ArrayBuffer {
        &self.local
    }

    /// Local read-write view of the owned rectangle.
    pub fn access_mut(&mut self) -> &mut ArrayBuffer {
        &mut self.local
    }

    /// Collective broadcast-assign of a scalar.
    pub fn fill_value(&mut self, value: f64) -> Result<()> {
        self.local.fill_f64(value)
    }

    fn check_subscripts(&self, subs: &[i64]) -> Result<()> {
        for tuple in subs.chunks(self.shape.len()) {
            for (s, n) in tuple.iter().zip(self.shape.iter()) {
                if *s < 0 || s >= n {
                    return Err(PagodaError::Range(format!(
                        "subscript {:?} out of bounds for shape {:?}",
                        tuple, self.shape
                    )));
                }
            }
        }
        Ok(())
    }

    fn check_rect(&self, lo: &[i64], hi: &[i64]) -> Result<()> {
        if lo.len() != self.shape.len() || hi.len() != self.shape.len() {
            return Err(PagodaError::ShapeMismatch(format!(
                "rectangle rank {} does not match array rank {}",
                lo.len(),
                self.shape.len()
            )));
        }
        for d in 0..lo.len() {
            if lo[d] < 0 || hi[d] < lo[d] || hi[d] >= self.shape[d] {
                return Err(PagodaError::Range(format!(
                    "rectangle [{:?},{:?}] out of bounds for shape {:?}",
                    lo, hi, self.shape
                )));
            }
        }
        Ok(())
    }

    /// Collective fetch of a global rectangle into a dense local buffer.
    /// Ranks may request different rectangles; a rank with nothing to fetch
    /// passes empty slices and gets an empty buffer back.
    pub async fn get<N: Collectives>(
        &self,
        lo: &[i64],
        hi: &[i64],
        net: &N,
    ) -> Result<ArrayBuffer> {
        let request = if lo.is_empty() {
            None
        } else {
            self.check_rect(lo, hi)?;
            Some((lo.to_vec(), hi.to_vec()))
        };
        let requests: Vec<Option<(Vec<i64>, Vec<i64>)>> =
            net.allgather(&request, StreamId::Data).await?;

        let mut outgoing: Vec<Option<Patch>> = Vec::with_capacity(net.nprocs());
        for peer_request in &requests {
            let patch = match (self.owns_data(), peer_request) {
                (true, Some((plo, phi))) => rect_intersect(&self.lo, &self.hi, plo, phi).map(
                    |(ilo, ihi)| {
                        let idx = flat_indices_of_rect(&self.lo, &self.hi, &ilo, &ihi);
                        Patch {
                            data: self.local.gather_flat(&idx),
                            lo: ilo,
                            hi: ihi,
                        }
                    },
                ),
                _ => None,
            };
            outgoing.push(patch);
        }
        let incoming: Vec<Option<Patch>> = net.alltoall(&outgoing, StreamId::Data).await?;

        let (lo, hi) = match request {
            Some(r) => r,
            None => return Ok(ArrayBuffer::alloc(self.ty, 0)),
        };
        let mut out = ArrayBuffer::alloc(self.ty, rect_size(&lo, &hi) as usize);
        for patch in incoming.into_iter().flatten() {
            let idx = flat_indices_of_rect(&lo, &hi, &patch.lo, &patch.hi);
            out.scatter_flat(&idx, &patch.data)?;
        }
        Ok(out)
    }

    /// Collective store of a dense buffer into a global rectangle. Writes to
    /// overlapping rectangles from different ranks are undefined. A rank
    /// with nothing to store passes empty slices.
    pub async fn put<N: Collectives>(
        &mut self,
        buf: &ArrayBuffer,
        lo: &[i64],
        hi: &[i64],
        net: &N,
    ) -> Result<()> {
        let src = if lo.is_empty() {
            None
        } else {
            self.check_rect(lo, hi)?;
            if buf.len() as i64 != rect_size(lo, hi) {
                return Err(PagodaError::ShapeMismatch(format!(
                    "buffer holds {} elements, rectangle needs {}",
                    buf.len(),
                    rect_size(lo, hi)
                )));
            }
            Some(buf.cast_to(self.ty)?)
        };

        let mut outgoing: Vec<Option<Patch>> = Vec::with_capacity(net.nprocs());
        for rank in 0..net.nprocs() {
            let (block_lo, block_hi) = block_distribution(&self.shape, self.nprocs, rank);
            let patch = match &src {
                Some(data) if block_lo[0] >= 0 => rect_intersect(&block_lo, &block_hi, lo, hi)
                    .map(|(ilo, ihi)| {
                        let idx = flat_indices_of_rect(lo, hi, &ilo, &ihi);
                        Patch {
                            data: data.gather_flat(&idx),
                            lo: ilo,
                            hi: ihi,
                        }
                    }),
                _ => None,
            };
            outgoing.push(patch);
        }
        let incoming: Vec<Option<Patch>> = net.alltoall(&outgoing, StreamId::Data).await?;

        for patch in incoming.into_iter().flatten() {
            let idx = flat_indices_of_rect(&self.lo, &self.hi, &patch.lo, &patch.hi);
            self.local.scatter_flat(&idx, &patch.data)?;
        }
        Ok(())
    }

    /// Collective write of `values[k]` at the k-th subscript tuple.
    /// `subs` is the flattened ndim-tuples.
    pub async fn scatter<N: Collectives>(
        &mut self,
        values: &ArrayBuffer,
        subs: &[i64],
        net: &N,
    ) -> Result<()> {
        let ndim = self.shape.len();
        if subs.len() % ndim != 0 || subs.len() / ndim != values.len() {
            return Err(PagodaError::ShapeMismatch(
                "scatter subscripts do not match value count".to_string(),
            ));
        }
        self.check_subscripts(subs)?;
        let values = values.cast_to(self.ty)?;

        let mut per_rank_subs: Vec<Vec<i64>> = vec![Vec::new(); net.nprocs()];
        let mut per_rank_idx: Vec<Vec<usize>> = vec![Vec::new(); net.nprocs()];
        for k in 0..values.len() {
            let tuple = &subs[k * ndim..(k + 1) * ndim];
            let owner = owner_of_row(&self.shape, self.nprocs, tuple[0]);
            per_rank_subs[owner].extend_from_slice(tuple);
            per_rank_idx[owner].push(k);
        }
        let outgoing: Vec<PointMsg> = (0..net.nprocs())
            .map(|rank| PointMsg {
                subs: std::mem::take(&mut per_rank_subs[rank]),
                data: values.gather_flat(&per_rank_idx[rank]),
            })
            .collect();
        let incoming: Vec<PointMsg> = net.alltoall(&outgoing, StreamId::Data).await?;

        let local_extents = rect_extents(&self.lo, &self.hi);
        for msg in incoming {
            let mut idx = Vec::with_capacity(msg.data.len());
            for tuple in msg.subs.chunks(ndim) {
                let rel: Vec<i64> = tuple.iter().zip(self.lo.iter()).map(|(s, l)| s - l).collect();
                idx.push(ravel(&rel, &local_extents) as usize);
            }
            self.local.scatter_flat(&idx, &msg.data)?;
        }
        Ok(())
    }

    /// Collective read of the values at explicit subscript tuples.
    pub async fn gather<N: Collectives>(&self, subs: &[i64], net: &N) -> Result<ArrayBuffer> {
        let ndim = self.shape.len();
        if subs.len() % ndim != 0 {
            return Err(PagodaError::ShapeMismatch(
                "gather subscripts are not whole tuples".to_string(),
            ));
        }
        self.check_subscripts(subs)?;
        let count = subs.len() / ndim;

        let mut per_rank_subs: Vec<Vec<i64>> = vec![Vec::new(); net.nprocs()];
        let mut per_rank_pos: Vec<Vec<usize>> = vec![Vec::new(); net.nprocs()];
        for k in 0..count {
            let tuple = &subs[k * ndim..(k + 1) * ndim];
            let owner = owner_of_row(&self.shape, self.nprocs, tuple[0]);
            per_rank_subs[owner].extend_from_slice(tuple);
            per_rank_pos[owner].push(k);
        }
        let requests: Vec<Vec<i64>> = net.alltoall(&per_rank_subs, StreamId::Data).await?;

        let local_extents = if self.owns_data() {
            rect_extents(&self.lo, &self.hi)
        } else {
            Vec::new()
        };
        let responses: Vec<ArrayBuffer> = requests
            .iter()
            .map(|wanted| {
                let mut idx = Vec::with_capacity(wanted.len() / ndim.max(1));
                for tuple in wanted.chunks(ndim) {
                    let rel: Vec<i64> =
                        tuple.iter().zip(self.lo.iter()).map(|(s, l)| s - l).collect();
                    idx.push(ravel(&rel, &local_extents) as usize);
                }
                self.local.gather_flat(&idx)
            })
            .collect();
        let incoming: Vec<ArrayBuffer> = net.alltoall(&responses, StreamId::Data).await?;

        let mut out = ArrayBuffer::alloc(self.ty, count);
        for (rank, values) in incoming.into_iter().enumerate() {
            out.scatter_flat(&per_rank_pos[rank], &values)?;
        }
        Ok(out)
    }

    /// Collective whole-array copy with elementwise cast when types differ.
    pub async fn copy_from<N: Collectives>(
        &mut self,
        src: &DistributedArray,
        net: &N,
    ) -> Result<()> {
        if self.shape != src.shape {
            return Err(PagodaError::ShapeMismatch(format!(
                "copy shapes differ: {:?} vs {:?}",
                self.shape, src.shape
            )));
        }
        net.barrier(StreamId::Data).await?;
        self.local = src.local.cast_to(self.ty)?;
        Ok(())
    }
}

/// Collective patch copy: `dst[dst_lo..=dst_hi] = src[src_lo..=src_hi]`,
/// casting elementwise when types differ. The two rectangles must agree on
/// their non-unit extents in order.
pub async fn copy_patch<N: Collectives>(
    src: &DistributedArray,
    src_lo: &[i64],
    src_hi: &[i64],
    dst: &mut DistributedArray,
    dst_lo: &[i64],
    dst_hi: &[i64],
    net: &N,
) -> Result<()> {
    let src_extents = rect_extents(src_lo, src_hi);
    let dst_extents = rect_extents(dst_lo, dst_hi);
    let src_nz: Vec<i64> = src_extents.iter().copied().filter(|e| *e > 1).collect();
    let dst_nz: Vec<i64> = dst_extents.iter().copied().filter(|e| *e > 1).collect();
    if src_nz != dst_nz {
        return Err(PagodaError::ShapeMismatch(format!(
            "patch extents differ: {:?} vs {:?}",
            src_extents, dst_extents
        )));
    }

    // Which part of the destination rectangle lives on this rank?
    let (my_lo, my_hi) = dst.get_distribution();
    let target = if dst.owns_data() {
        rect_intersect(&my_lo, &my_hi, dst_lo, dst_hi)
    } else {
        None
    };

    // Translate it into source coordinates, axis-aligned over the non-unit
    // extents.
    let query = target.as_ref().map(|(tlo, thi)| {
        let mut qlo = Vec::with_capacity(src_lo.len());
        let mut qhi = Vec::with_capacity(src_lo.len());
        let mut pending: Vec<(i64, i64)> = Vec::new();
        for d in 0..dst_extents.len() {
            if dst_extents[d] > 1 {
                pending.push((tlo[d] - dst_lo[d], thi[d] - dst_lo[d]));
            }
        }
        let mut next = 0;
        for s in 0..src_extents.len() {
            if src_extents[s] > 1 {
                let (rlo, rhi) = pending[next];
                next += 1;
                qlo.push(src_lo[s] + rlo);
                qhi.push(src_lo[s] + rhi);
            } else {
                qlo.push(src_lo[s]);
                qhi.push(src_lo[s]);
            }
        }
        (qlo, qhi)
    });

    let data = match &query {
        Some((qlo, qhi)) => src.get(qlo, qhi, net).await?,
        None => src.get(&[], &[], net).await?,
    };

    if let Some((tlo, thi)) = target {
        let data = data.cast_to(dst.get_type())?;
        let idx = flat_indices_of_rect(&my_lo, &my_hi, &tlo, &thi);
        dst.access_mut().scatter_flat(&idx, &data)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pagoda_net::LocalProcessGroup;

    const NPROCS: usize = 4;

    #[test]
    fn block_split_covers_shape() {
        let shape = vec![10i64, 3];
        let mut total = 0;
        for rank in 0..4 {
            let (lo, hi) = block_distribution(&shape, 4, rank);
            total += hi[0] - lo[0] + 1;
            assert_eq!(lo[1], 0);
            assert_eq!(hi[1], 2);
            for row in lo[0]..=hi[0] {
                assert_eq!(owner_of_row(&shape, 4, row), rank);
            }
        }
        assert_eq!(total, 10);
    }

    #[test]
    fn small_axis_leaves_trailing_ranks_empty() {
        let shape = vec![2i64];
        assert_eq!(block_distribution(&shape, 4, 2), (vec![-1], vec![-1]));
        assert_eq!(block_distribution(&shape, 4, 0), (vec![0], vec![0]));
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let group = LocalProcessGroup::new_local_group(NPROCS).await.unwrap();
        let results = group
            .simulate_group_round((), |net, _| async move {
                let mut a = DistributedArray::create(DataType::I32, vec![8, 2], &net);
                // rank 0 writes the whole array, everyone else participates
                if net.is_root() {
                    let buf = ArrayBuffer::I32((0..16).collect());
                    a.put(&buf, &[0, 0], &[7, 1], &net).await.unwrap();
                } else {
                    a.put(&ArrayBuffer::alloc(DataType::I32, 0), &[], &[], &net)
                        .await
                        .unwrap();
                }
                // every rank reads a different row
                let row = net.rank() as i64;
                a.get(&[row, 0], &[row, 1], &net).await.unwrap()
            })
            .await;
        for (rank, buf) in results.into_iter().enumerate() {
            let base = rank as i32 * 2;
            assert_eq!(buf, ArrayBuffer::I32(vec![base, base + 1]));
        }
    }

    #[tokio::test]
    async fn scatter_and_gather_points() {
        let group = LocalProcessGroup::new_local_group(NPROCS).await.unwrap();
        let results = group
            .simulate_group_round((), |net, _| async move {
                let mut a = DistributedArray::create(DataType::F64, vec![9], &net);
                // each rank marks two cells of its choosing
                let me = net.rank() as i64;
                let subs = vec![me, 8 - me];
                let ones = ArrayBuffer::F64(vec![1.0, 1.0]);
                a.scatter(&ones, &subs, &net).await.unwrap();
                a.gather(&[0, 1, 2, 3, 4, 5, 6, 7, 8], &net).await.unwrap()
            })
            .await;
        for buf in results {
            // cells 0..4 and 5..8 were hit, cell 4 was not
            assert_eq!(
                buf,
                ArrayBuffer::F64(vec![1.0, 1.0, 1.0, 1.0, 0.0, 1.0, 1.0, 1.0, 1.0])
            );
        }
    }

    #[tokio::test]
    async fn patch_copy_casts_and_places() {
        let group = LocalProcessGroup::new_local_group(NPROCS).await.unwrap();
        let results = group
            .simulate_group_round((), |net, _| async move {
                let mut src = DistributedArray::create(DataType::I32, vec![4], &net);
                if net.is_root() {
                    src.put(&ArrayBuffer::I32(vec![5, 6, 7, 8]), &[0], &[3], &net)
                        .await
                        .unwrap();
                } else {
                    src.put(&ArrayBuffer::alloc(DataType::I32, 0), &[], &[], &net)
                        .await
                        .unwrap();
                }
                let mut dst = DistributedArray::create(DataType::F64, vec![2, 4], &net);
                copy_patch(&src, &[0], &[3], &mut dst, &[1, 0], &[1, 3], &net)
                    .await
                    .unwrap();
                dst.get(&[1, 0], &[1, 3], &net).await.unwrap()
            })
            .await;
        for buf in results {
            assert_eq!(buf, ArrayBuffer::F64(vec![5.0, 6.0, 7.0, 8.0]));
        }
    }
}
