use crate::dataset::Dimension;
use crate::slab::{CoordHyperslab, IndexHyperslab, LatLonBox};
use log::warn;
use pagoda_array::{partial_sum, ArrayBuffer, DistributedArray};
use pagoda_net::{Collectives, ProcessGroup, StreamId};
use pagoda_types::{DataType, PagodaError, Result};
use std::collections::HashMap;

/// The keep/drop bitmap over one dimension, held as a distributed 1-D int
/// array. A fresh mask keeps everything; the first modification replaces
/// that default and later modifications union into it.
pub struct Mask {
    dim: Dimension,
    data: DistributedArray,
    count: i64,
    cleared: bool,
    dirty: bool,
}

impl Mask {
    /// Collective. A default mask that keeps every index.
    pub fn create<N: ProcessGroup>(dim: &Dimension, net: &N) -> Result<Mask> {
        let mut data = DistributedArray::create(DataType::I32, vec![dim.size], net);
        data.fill_value(1.0)?;
        Ok(Mask {
            dim: dim.clone(),
            data,
            count: dim.size,
            cleared: false,
            dirty: false,
        })
    }

    pub fn dim(&self) -> &Dimension {
        &self.dim
    }

    pub fn data(&self) -> &DistributedArray {
        &self.data
    }

    pub fn size(&self) -> i64 {
        self.dim.size
    }

    /// Collective. Kept-cell total, recomputed when stale.
    pub async fn get_count<N: Collectives>(&mut self, net: &N) -> Result<i64> {
        if self.dirty {
            let local = if self.data.owns_data() {
                self.data
                    .access()
                    .to_f64_vec()?
                    .iter()
                    .filter(|m| **m != 0.0)
                    .count() as i64
            } else {
                0
            };
            self.count = net.gop_sum(vec![local], StreamId::Control).await?[0];
            self.dirty = false;
        }
        Ok(self.count)
    }

    /// Drop every index.
    pub fn clear(&mut self) -> Result<()> {
        self.data.fill_value(0.0)?;
        self.count = 0;
        self.cleared = true;
        self.dirty = false;
        Ok(())
    }

    /// The first modification replaces the keep-all default.
    fn prepare_modify(&mut self) -> Result<()> {
        if !self.cleared {
            self.clear()?;
        }
        self.dirty = true;
        Ok(())
    }

    fn keep_where(&mut self, pred: impl Fn(i64, usize) -> bool) -> Result<()> {
        self.prepare_modify()?;
        if !self.data.owns_data() {
            return Ok(());
        }
        let (lo, _hi) = self.data.get_distribution();
        let buf = self.data.access_mut();
        for i in 0..buf.len() {
            if pred(lo[0] + i as i64, i) {
                buf.set_f64(i, 1.0)?;
            }
        }
        Ok(())
    }

    /// Union the slab's kept indices into the mask.
    pub fn modify(&mut self, slab: &IndexHyperslab) -> Result<()> {
        let resolved = slab.resolve(self.dim.size)?;
        self.keep_where(|g, _| IndexHyperslab::keeps(resolved, g))
    }

    /// Resolve a coordinate slab against this dimension's coordinate values
    /// by forward scan, then apply the resulting index range.
    pub async fn modify_coord<N: Collectives>(
        &mut self,
        slab: &CoordHyperslab,
        coords: &DistributedArray,
        net: &N,
    ) -> Result<()> {
        if coords.get_shape() != [self.dim.size] {
            return Err(PagodaError::ShapeMismatch(format!(
                "coordinate variable does not span dimension '{}'",
                self.dim.name
            )));
        }
        let mut first = i64::MAX;
        let mut last = -1i64;
        if coords.owns_data() {
            let (lo, _hi) = coords.get_distribution();
            for (i, value) in coords.access().to_f64_vec()?.iter().enumerate() {
                if slab.accepts(*value) {
                    let g = lo[0] + i as i64;
                    first = first.min(g);
                    last = last.max(g);
                }
            }
        }
        let first = net.gop_min(vec![first], StreamId::Control).await?[0];
        let last = net.gop_max(vec![last], StreamId::Control).await?[0];
        if first == i64::MAX || last < 0 {
            return Err(PagodaError::Range(format!(
                "no coordinates of '{}' fall within the requested range",
                self.dim.name
            )));
        }
        self.modify(&IndexHyperslab::range(&self.dim.name, first, last))
    }

    /// Keep the cells whose center falls inside the box. `lat` and `lon`
    /// are cell-centered coordinates over this mask's dimension.
    pub fn modify_box(
        &mut self,
        box_: &LatLonBox,
        lat: &DistributedArray,
        lon: &DistributedArray,
    ) -> Result<()> {
        if lat.get_shape() != [self.dim.size] || lon.get_shape() != [self.dim.size] {
            return Err(PagodaError::ShapeMismatch(format!(
                "lat/lon variables do not span dimension '{}'",
                self.dim.name
            )));
        }
        let lat = if lat.owns_data() {
            lat.access().to_f64_vec()?
        } else {
            Vec::new()
        };
        let lon = if lon.owns_data() {
            lon.access().to_f64_vec()?
        } else {
            Vec::new()
        };
        let box_ = *box_;
        self.keep_where(|_, i| box_.contains(lat[i], lon[i]))
    }

    /// Collective. Mark explicit indices as kept; used by topology
    /// propagation.
    pub async fn scatter_ones<N: Collectives>(
        &mut self,
        subscripts: &[i64],
        net: &N,
    ) -> Result<()> {
        self.prepare_modify()?;
        let ones = ArrayBuffer::I32(vec![1; subscripts.len()]);
        self.data.scatter(&ones, subscripts, net).await
    }

    /// Keep only indices kept by both masks.
    pub fn intersect(&mut self, other: &Mask) -> Result<()> {
        self.check_same_dim(other)?;
        self.data.imul(&other.data)?;
        self.dirty = true;
        Ok(())
    }

    /// Keep indices kept by either mask.
    pub fn union_with(&mut self, other: &Mask) -> Result<()> {
        self.check_same_dim(other)?;
        self.data.imax(&other.data)?;
        self.dirty = true;
        Ok(())
    }

    fn check_same_dim(&self, other: &Mask) -> Result<()> {
        if self.dim != other.dim {
            return Err(PagodaError::DimensionMismatch(format!(
                "masks cover '{}' and '{}'",
                self.dim.name, other.dim.name
            )));
        }
        Ok(())
    }

    /// Collective. Companion index array: kept positions receive their new
    /// dense ordinal, dropped positions receive -1.
    pub async fn reindex<N: Collectives>(&self, net: &N) -> Result<DistributedArray> {
        let mut index = DistributedArray::create(DataType::I64, vec![self.dim.size], net);
        partial_sum(&self.data, &mut index, true, net).await?;
        if self.data.owns_data() {
            let kept = self.data.access().to_f64_vec()?;
            let buf = index.access_mut();
            for (i, m) in kept.iter().enumerate() {
                if *m == 0.0 {
                    buf.set_f64(i, -1.0)?;
                }
            }
        }
        Ok(index)
    }
}

/// Insertion-lazy map from dimension name to its mask.
#[derive(Default)]
pub struct MaskMap {
    masks: HashMap<String, Mask>,
}

impl MaskMap {
    pub fn new() -> MaskMap {
        MaskMap {
            masks: HashMap::new(),
        }
    }

    /// Collective on first use of a dimension.
    pub fn get_mask<N: ProcessGroup>(&mut self, dim: &Dimension, net: &N) -> Result<&mut Mask> {
        if !self.masks.contains_key(&dim.name) {
            let mask = Mask::create(dim, net)?;
            self.masks.insert(dim.name.clone(), mask);
        }
        Ok(self.masks.get_mut(&dim.name).unwrap())
    }

    pub fn get(&self, name: &str) -> Option<&Mask> {
        self.masks.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Mask> {
        self.masks.get_mut(name)
    }

    /// Collective. Materialize a default mask for every dimension.
    pub fn create_masks<N: ProcessGroup>(&mut self, dims: &[Dimension], net: &N) -> Result<()> {
        for dim in dims {
            self.get_mask(dim, net)?;
        }
        Ok(())
    }

    /// Apply each index slab to the mask of its named dimension; unknown
    /// names are reported and skipped.
    pub fn modify_slabs<N: ProcessGroup>(
        &mut self,
        slabs: &[IndexHyperslab],
        dims: &[Dimension],
        net: &N,
    ) -> Result<()> {
        for slab in slabs {
            match dims.iter().find(|d| d.name == slab.name) {
                Some(dim) => self.get_mask(dim, net)?.modify(slab)?,
                None => warn!("sliced dimension '{}' does not exist", slab.name),
            }
        }
        Ok(())
    }

    /// §4.3a topology propagation: every target index referenced by a kept
    /// source element becomes kept. The first propagation into a target
    /// replaces its keep-all default.
    pub async fn propagate<N: Collectives>(
        &mut self,
        masked: &Dimension,
        to_mask: &Dimension,
        topology: &DistributedArray,
        net: &N,
    ) -> Result<()> {
        let connections = topology.get_shape()[1];
        let subscripts = {
            let mask = self.get_mask(masked, net)?;
            let slab = if mask.data.owns_data() {
                let (lo, hi) = mask.data.get_distribution();
                topology
                    .get(&[lo[0], 0], &[hi[0], connections - 1], net)
                    .await?
            } else {
                topology.get(&[], &[], net).await?
            };
            let mut subscripts = Vec::new();
            if mask.data.owns_data() {
                let kept = mask.data.access().to_f64_vec()?;
                let slab = slab.to_f64_vec()?;
                for (i, m) in kept.iter().enumerate() {
                    if *m != 0.0 {
                        let row = i * connections as usize;
                        for c in 0..connections as usize {
                            let target = slab[row + c] as i64;
                            if target >= 0 && target < to_mask.size {
                                subscripts.push(target);
                            }
                        }
                    }
                }
            }
            subscripts
        };
        self.get_mask(to_mask, net)?
            .scatter_ones(&subscripts, net)
            .await
    }
}
