//! The subset kernel: prefix sums over masks, N-dimensional packing, and
//! the 1-D inverse.

use crate::array::DistributedArray;
use crate::buffer::ArrayBuffer;
use crate::shape::{rect_extents, shape_size, unravel};
use log::trace;
use pagoda_net::{Collectives, ProcessGroup, StreamId};
use pagoda_types::{DataType, PagodaError, Result};

/// Collective prefix sum of a 1-D array into `dst` (same distribution).
///
/// `exclusive` gives `dst[0] = 0`, `dst[i] = dst[i-1] + src[i-1]`; otherwise
/// `dst[0] = src[0]`, `dst[i] = dst[i-1] + src[i]`.
pub async fn partial_sum<N: Collectives>(
    src: &DistributedArray,
    dst: &mut DistributedArray,
    exclusive: bool,
    net: &N,
) -> Result<()> {
    if !src.same_distribution(dst) {
        return Err(PagodaError::ShapeMismatch(
            "partial_sum: arrays must share a distribution".to_string(),
        ));
    }
    if src.get_ndim() != 1 {
        return Err(PagodaError::ShapeMismatch(
            "partial_sum supports 1-dim arrays only".to_string(),
        ));
    }

    let values = if src.owns_data() {
        src.access().to_f64_vec()?
    } else {
        Vec::new()
    };
    let mut prefix = vec![0f64; values.len()];
    if !values.is_empty() {
        if exclusive {
            for i in 1..values.len() {
                prefix[i] = prefix[i - 1] + values[i - 1];
            }
        } else {
            prefix[0] = values[0];
            for i in 1..values.len() {
                prefix[i] = prefix[i - 1] + values[i];
            }
        }
    }

    // every rank contributes its block total, then shifts by the ranks below
    let local_total: f64 = values.iter().sum();
    let totals = net.allgather(&local_total, StreamId::Data).await?;
    let offset: f64 = totals[..net.rank() as usize].iter().sum();
    for p in prefix.iter_mut() {
        *p += offset;
    }

    if dst.owns_data() {
        *dst.access_mut() = ArrayBuffer::from_f64_vec(dst.get_type(), &prefix)?;
    }
    Ok(())
}

/// Collective fill of a 1-D array with `dst[i] = start + i*step` over the
/// global index.
pub fn enumerate(array: &mut DistributedArray, start: f64, step: f64) -> Result<()> {
    if array.get_ndim() != 1 {
        return Err(PagodaError::ShapeMismatch(
            "enumerate expects a 1-dim array".to_string(),
        ));
    }
    if !array.owns_data() {
        return Ok(());
    }
    let (lo, _hi) = array.get_distribution();
    let n = array.get_local_size() as usize;
    let values: Vec<f64> = (0..n)
        .map(|i| start + ((lo[0] + i as i64) as f64) * step)
        .collect();
    *array.access_mut() = ArrayBuffer::from_f64_vec(array.get_type(), &values)?;
    Ok(())
}

/// Collective N-dimensional packing of `src` into the dense `dst`.
///
/// `masks[d]` is the keep bitmap over source axis d and `masksums[d]` its
/// exclusive prefix sum; an element survives when every axis keeps its
/// index, and lands at the prefix-sum coordinates.
pub async fn pack<N: Collectives>(
    src: &DistributedArray,
    dst: &mut DistributedArray,
    masks: &[&DistributedArray],
    masksums: &[&DistributedArray],
    net: &N,
) -> Result<()> {
    let ndim = src.get_ndim();
    if dst.get_ndim() != ndim {
        return Err(PagodaError::ShapeMismatch(
            "pack: src and dst ranks differ".to_string(),
        ));
    }
    if masks.len() != ndim || masksums.len() != ndim {
        return Err(PagodaError::ShapeMismatch(
            "pack: one mask and prefix sum per axis required".to_string(),
        ));
    }

    let (lo, hi) = src.get_distribution();
    let owns = src.owns_data();

    // local slab of each axis mask, aligned to this rank's rectangle
    let mut local_masks: Vec<Vec<f64>> = Vec::with_capacity(ndim);
    for d in 0..ndim {
        let slab = if owns {
            masks[d].get(&[lo[d]], &[hi[d]], net).await?
        } else {
            masks[d].get(&[], &[], net).await?
        };
        local_masks.push(slab.to_f64_vec()?);
    }

    let mut counts = vec![0i64; ndim];
    let mut counts_product = i64::from(owns);
    for d in 0..ndim {
        counts[d] = local_masks[d].iter().filter(|m| **m != 0.0).count() as i64;
        counts_product *= counts[d];
    }

    // prefix heads at the rectangle's low corner give the destination corner
    let mut dst_lo = vec![0i64; ndim];
    for d in 0..ndim {
        let head = if owns {
            masksums[d].get(&[lo[d]], &[lo[d]], net).await?
        } else {
            masksums[d].get(&[], &[], net).await?
        };
        if owns {
            dst_lo[d] = head.get_f64(0)? as i64;
        }
    }

    if counts_product > 0 {
        let extents = rect_extents(&lo, &hi);
        let total = shape_size(&extents);
        trace!(
            "pack keeps {} of {} local elements on rank {}",
            counts_product,
            total,
            net.rank()
        );
        let mut idx = vec![0i64; ndim];
        let mut kept = Vec::with_capacity(counts_product as usize);
        for flat in 0..total {
            unravel(flat, &extents, &mut idx);
            let survives = (0..ndim).all(|d| local_masks[d][idx[d] as usize] != 0.0);
            if survives {
                kept.push(flat as usize);
            }
        }
        if kept.len() as i64 != counts_product {
            return Err(PagodaError::Internal(format!(
                "pack kept {} of an expected {}",
                kept.len(),
                counts_product
            )));
        }
        let buf = src.access().gather_flat(&kept);
        let dst_hi: Vec<i64> = (0..ndim).map(|d| dst_lo[d] + counts[d] - 1).collect();
        dst.put(&buf, &dst_lo, &dst_hi, net).await?;
    } else {
        dst.put(&ArrayBuffer::alloc(dst.get_type(), 0), &[], &[], net)
            .await?;
    }
    Ok(())
}

/// Collective. Pack `src` against per-axis masks into a freshly created
/// dense array whose shape is the per-axis kept counts. A zero count along
/// any axis yields the empty result without moving data.
pub async fn pack_into_new<N: Collectives>(
    src: &DistributedArray,
    masks: &[&DistributedArray],
    net: &N,
) -> Result<DistributedArray> {
    let ndim = src.get_ndim();
    if masks.len() != ndim {
        return Err(PagodaError::ShapeMismatch(
            "pack: one mask per axis required".to_string(),
        ));
    }
    let mut masksums = Vec::with_capacity(ndim);
    let mut kept = Vec::with_capacity(ndim);
    for mask in masks {
        let mut prefix = DistributedArray::create(DataType::I64, mask.get_shape().to_vec(), net);
        partial_sum(mask, &mut prefix, true, net).await?;
        let local: f64 = if mask.owns_data() {
            mask.access()
                .to_f64_vec()?
                .iter()
                .map(|m| if *m != 0.0 { 1.0 } else { 0.0 })
                .sum()
        } else {
            0.0
        };
        let total = net.gop_sum(vec![local], StreamId::Data).await?[0];
        kept.push(total as i64);
        masksums.push(prefix);
    }

    let mut dst = DistributedArray::create(src.get_type(), kept.clone(), net);
    if kept.iter().any(|k| *k == 0) {
        return Ok(dst);
    }
    let sum_refs: Vec<&DistributedArray> = masksums.iter().collect();
    pack(src, &mut dst, masks, &sum_refs, net).await?;
    Ok(dst)
}

/// Collective 1-D unpacking: stream the dense `src` back into the masked
/// positions of `dst` (which shares its distribution with `msk`).
pub async fn unpack1d<N: Collectives>(
    src: &DistributedArray,
    dst: &mut DistributedArray,
    msk: &DistributedArray,
    net: &N,
) -> Result<()> {
    if !dst.same_distribution(msk) {
        return Err(PagodaError::ShapeMismatch(
            "unpack1d: dst and msk distributions differ".to_string(),
        ));
    }
    if src.get_type() != dst.get_type() {
        return Err(PagodaError::DataType(
            "unpack1d: src and dst types differ".to_string(),
        ));
    }
    if src.get_ndim() != 1 || dst.get_ndim() != 1 {
        return Err(PagodaError::ShapeMismatch(
            "unpack1d supports 1-dim arrays only".to_string(),
        ));
    }

    let mask_values = if msk.owns_data() {
        msk.access().to_f64_vec()?
    } else {
        Vec::new()
    };
    let mine = mask_values.iter().filter(|m| **m != 0.0).count() as i64;
    let counts: Vec<i64> = net.allgather(&mine, StreamId::Data).await?;
    if counts.iter().sum::<i64>() != src.get_shape()[0] {
        return Err(PagodaError::ShapeMismatch(
            "unpack1d: mask count does not match source length".to_string(),
        ));
    }

    // where this rank's slice of the packed data starts
    let offset: i64 = counts[..net.rank() as usize].iter().sum();
    let data = if mine > 0 {
        src.get(&[offset], &[offset + mine - 1], net).await?
    } else {
        src.get(&[], &[], net).await?
    };

    if mine > 0 {
        let kept_pos: Vec<usize> = mask_values
            .iter()
            .enumerate()
            .filter(|(_, m)| **m != 0.0)
            .map(|(i, _)| i)
            .collect();
        dst.access_mut().scatter_flat(&kept_pos, &data)?;
    }
    Ok(())
}
