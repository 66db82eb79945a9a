use crate::array::DistributedArray;
use crate::buffer::ArrayBuffer;
use crate::shape::{ravel, rect_extents, shape_size, unravel};
use pagoda_net::{Collectives, StreamId};
use pagoda_types::{PagodaError, Result};

/// Per-record reduction operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReduceOp {
    Avg,
    SqrAvg,
    AvgSqr,
    Max,
    Min,
    Rms,
    RmsSdn,
    Sqrt,
    Ttl,
}

impl ReduceOp {
    pub fn parse(s: &str) -> Result<ReduceOp> {
        Ok(match s {
            "avg" => ReduceOp::Avg,
            "sqravg" => ReduceOp::SqrAvg,
            "avgsqr" => ReduceOp::AvgSqr,
            "max" => ReduceOp::Max,
            "min" => ReduceOp::Min,
            "rms" => ReduceOp::Rms,
            "rmssdn" => ReduceOp::RmsSdn,
            "sqrt" => ReduceOp::Sqrt,
            "ttl" => ReduceOp::Ttl,
            _ => {
                return Err(PagodaError::Command(format!(
                    "unrecognized reduction operator '{}'",
                    s
                )))
            }
        })
    }

    /// Whether the accumulator sums squared inputs.
    pub fn squares_input(self) -> bool {
        matches!(self, ReduceOp::AvgSqr | ReduceOp::Rms | ReduceOp::RmsSdn)
    }

    pub fn is_extremum(self) -> bool {
        matches!(self, ReduceOp::Max | ReduceOp::Min)
    }

    /// Collapse an accumulated sum and its tally into the final value.
    /// Extrema pass through unchanged.
    pub fn finalize(self, sum: f64, count: f64) -> f64 {
        match self {
            ReduceOp::Ttl | ReduceOp::Max | ReduceOp::Min => sum,
            ReduceOp::Avg => sum / count,
            ReduceOp::SqrAvg => {
                let a = sum / count;
                a * a
            }
            ReduceOp::AvgSqr => sum / count,
            ReduceOp::Rms => (sum / count).sqrt(),
            ReduceOp::RmsSdn => (sum / (count - 1.0)).sqrt(),
            ReduceOp::Sqrt => (sum / count).sqrt(),
        }
    }
}

/// Elementwise combiners for the binary dataset operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sbt,
    Mlt,
    Dvd,
}

impl BinaryOp {
    pub fn parse(s: &str) -> Result<BinaryOp> {
        Ok(match s {
            "+" | "add" => BinaryOp::Add,
            "-" | "sbt" => BinaryOp::Sbt,
            "*" | "mlt" => BinaryOp::Mlt,
            "/" | "dvd" => BinaryOp::Dvd,
            _ => {
                return Err(PagodaError::Command(format!(
                    "unrecognized binary operator '{}'",
                    s
                )))
            }
        })
    }

    pub fn apply(self, lhs: &mut DistributedArray, rhs: &DistributedArray) -> Result<()> {
        match self {
            BinaryOp::Add => lhs.iadd(rhs),
            BinaryOp::Sbt => lhs.isub(rhs),
            BinaryOp::Mlt => lhs.imul(rhs),
            BinaryOp::Dvd => lhs.idiv(rhs),
        }
    }
}

impl DistributedArray {
    fn elementwise(
        &mut self,
        other: &DistributedArray,
        f: impl Fn(f64, f64) -> f64 + Send + Sync,
    ) -> Result<()> {
        if self.get_shape() != other.get_shape() {
            return Err(PagodaError::ShapeMismatch(format!(
                "elementwise shapes differ: {:?} vs {:?}",
                self.get_shape(),
                other.get_shape()
            )));
        }
        if !self.get_type().is_numeric() || !other.get_type().is_numeric() {
            return Err(PagodaError::DataType(
                "elementwise ops need numeric operands".to_string(),
            ));
        }
        if !self.owns_data() {
            return Ok(());
        }
        let ty = self.get_type();
        let rhs = other.access().cast_to(ty)?;
        self.access_mut().zip_apply_f64(&rhs, f)
    }

    pub fn iadd(&mut self, other: &DistributedArray) -> Result<()> {
        self.elementwise(other, |a, b| a + b)
    }

    pub fn isub(&mut self, other: &DistributedArray) -> Result<()> {
        self.elementwise(other, |a, b| a - b)
    }

    pub fn imul(&mut self, other: &DistributedArray) -> Result<()> {
        self.elementwise(other, |a, b| a * b)
    }

    pub fn idiv(&mut self, other: &DistributedArray) -> Result<()> {
        self.elementwise(other, |a, b| a / b)
    }

    pub fn imax(&mut self, other: &DistributedArray) -> Result<()> {
        self.elementwise(other, |a, b| if b > a { b } else { a })
    }

    pub fn imin(&mut self, other: &DistributedArray) -> Result<()> {
        self.elementwise(other, |a, b| if b < a { b } else { a })
    }

    /// Raise every element to `exponent`, evaluated in double precision.
    pub fn ipow(&mut self, exponent: f64) -> Result<()> {
        if !self.get_type().is_numeric() {
            return Err(PagodaError::DataType(
                "ipow needs a numeric array".to_string(),
            ));
        }
        self.access_mut().map_apply_f64(|x| x.powf(exponent))
    }

    /// Fill-aware accumulation: combine right-hand elements into this array
    /// through `f`, skipping elements equal to `fill` and bumping `tally`
    /// where a contribution landed.
    pub fn combine_counted(
        &mut self,
        other: &DistributedArray,
        fill: f64,
        tally: &mut DistributedArray,
        f: impl Fn(f64, f64) -> f64,
    ) -> Result<()> {
        if self.get_shape() != other.get_shape() || self.get_shape() != tally.get_shape() {
            return Err(PagodaError::ShapeMismatch(
                "counted accumulation operands must share a shape".to_string(),
            ));
        }
        if !self.owns_data() {
            return Ok(());
        }
        let ty = self.get_type();
        let rhs = other.access().cast_to(ty)?;
        self.access_mut()
            .zip_apply_counted(&rhs, fill, tally.access_mut(), f)
    }

    pub fn iadd_counted(
        &mut self,
        other: &DistributedArray,
        fill: f64,
        tally: &mut DistributedArray,
    ) -> Result<()> {
        self.combine_counted(other, fill, tally, |a, b| a + b)
    }

    /// Collective. A new array with axes permuted by `axes`; `reverse[i]`
    /// walks destination axis i against the grain of its source axis.
    pub async fn transpose<N: Collectives>(
        &self,
        axes: &[usize],
        reverse: &[bool],
        net: &N,
    ) -> Result<DistributedArray> {
        let ndim = self.get_ndim();
        let mut seen = vec![false; ndim];
        if axes.len() != ndim || !reverse.is_empty() && reverse.len() != ndim {
            return Err(PagodaError::ShapeMismatch(
                "transpose axes do not match array rank".to_string(),
            ));
        }
        for &a in axes {
            if a >= ndim || seen[a] {
                return Err(PagodaError::Range(
                    "transpose axes must be a permutation".to_string(),
                ));
            }
            seen[a] = true;
        }
        let rev = |i: usize| !reverse.is_empty() && reverse[i];

        let shape = self.get_shape();
        let dst_shape: Vec<i64> = axes.iter().map(|&a| shape[a]).collect();
        let mut dst = DistributedArray::create(self.get_type(), dst_shape, net);

        // preimage of this rank's destination block is a source rectangle
        let query = if dst.owns_data() {
            let (dlo, dhi) = dst.get_distribution();
            let mut qlo = vec![0i64; ndim];
            let mut qhi = vec![0i64; ndim];
            for i in 0..ndim {
                let a = axes[i];
                if rev(i) {
                    qlo[a] = shape[a] - 1 - dhi[i];
                    qhi[a] = shape[a] - 1 - dlo[i];
                } else {
                    qlo[a] = dlo[i];
                    qhi[a] = dhi[i];
                }
            }
            Some((dlo, dhi, qlo, qhi))
        } else {
            None
        };

        let block = match &query {
            Some((_, _, qlo, qhi)) => self.get(qlo, qhi, net).await?,
            None => self.get(&[], &[], net).await?,
        };

        if let Some((dlo, dhi, qlo, qhi)) = query {
            let dst_extents = rect_extents(&dlo, &dhi);
            let q_extents = rect_extents(&qlo, &qhi);
            let total = shape_size(&dst_extents);
            let mut didx = vec![0i64; ndim];
            let mut sidx = vec![0i64; ndim];
            let mut picks = Vec::with_capacity(total as usize);
            for flat in 0..total {
                unravel(flat, &dst_extents, &mut didx);
                for i in 0..ndim {
                    let a = axes[i];
                    let g = dlo[i] + didx[i];
                    let s = if rev(i) { shape[a] - 1 - g } else { g };
                    sidx[a] = s - qlo[a];
                }
                picks.push(ravel(&sidx, &q_extents) as usize);
            }
            *dst.access_mut() = block.gather_flat(&picks);
        }
        Ok(dst)
    }
}

/// Collective. Sum `src` over the axes flagged with 0 in `dst_shape`
/// (`dst_shape` is the source shape with reduced axes zeroed). Optional
/// 1-D `mask` drops contributions and `weight` scales them along a matching
/// reduced axis; both broadcast across the other axes.
pub async fn reduce_sum<N: Collectives>(
    src: &DistributedArray,
    dst_shape: &[i64],
    mask: Option<&DistributedArray>,
    weight: Option<&DistributedArray>,
    net: &N,
) -> Result<DistributedArray> {
    let shape = src.get_shape();
    let ndim = shape.len();
    if dst_shape.len() != ndim {
        return Err(PagodaError::ShapeMismatch(
            "reduce_sum destination shape rank differs".to_string(),
        ));
    }
    let mut reduced = Vec::new();
    let mut out_axes = Vec::new();
    for d in 0..ndim {
        if dst_shape[d] == 0 {
            reduced.push(d);
        } else if dst_shape[d] == shape[d] {
            out_axes.push(d);
        } else {
            return Err(PagodaError::ShapeMismatch(format!(
                "reduce_sum axis {} must be 0 or {}",
                d, shape[d]
            )));
        }
    }
    if reduced.is_empty() {
        return Err(PagodaError::ShapeMismatch(
            "reduce_sum needs at least one reduced axis".to_string(),
        ));
    }

    let axis_for = |arr: &DistributedArray, what: &str| -> Result<usize> {
        let len = arr.get_shape()[0];
        reduced
            .iter()
            .copied()
            .find(|d| shape[*d] == len)
            .ok_or_else(|| {
                PagodaError::ShapeMismatch(format!(
                    "{} length {} matches no reduced axis",
                    what, len
                ))
            })
    };

    // both factors are small 1-D arrays; fetch them whole
    let mask_axis = match mask {
        Some(m) => Some((axis_for(m, "mask")?, {
            m.get(&[0], &[m.get_shape()[0] - 1], net).await?.to_f64_vec()?
        })),
        None => None,
    };
    let weight_axis = match weight {
        Some(w) => Some((axis_for(w, "weight")?, {
            w.get(&[0], &[w.get_shape()[0] - 1], net).await?.to_f64_vec()?
        })),
        None => None,
    };

    let out_shape: Vec<i64> = if out_axes.is_empty() {
        vec![1]
    } else {
        out_axes.iter().map(|&d| shape[d]).collect()
    };
    let out_size = shape_size(&out_shape) as usize;

    let mut partial = vec![0f64; out_size];
    if src.owns_data() {
        let (lo, hi) = src.get_distribution();
        let extents = rect_extents(&lo, &hi);
        let values = src.access().to_f64_vec()?;
        let mut idx = vec![0i64; ndim];
        let mut out_idx = vec![0i64; out_axes.len().max(1)];
        for (flat, value) in values.iter().enumerate() {
            unravel(flat as i64, &extents, &mut idx);
            for d in 0..ndim {
                idx[d] += lo[d];
            }
            let mut factor = 1.0;
            if let Some((axis, m)) = &mask_axis {
                if m[idx[*axis] as usize] == 0.0 {
                    continue;
                }
            }
            if let Some((axis, w)) = &weight_axis {
                factor *= w[idx[*axis] as usize];
            }
            if out_axes.is_empty() {
                out_idx[0] = 0;
            } else {
                for (k, &d) in out_axes.iter().enumerate() {
                    out_idx[k] = idx[d];
                }
            }
            partial[ravel(&out_idx, &out_shape) as usize] += value * factor;
        }
    }
    let total = net.gop_sum(partial, StreamId::Data).await?;

    let mut dst = DistributedArray::create(src.get_type(), out_shape.clone(), net);
    if dst.owns_data() {
        let (lo, _hi) = dst.get_distribution();
        let row: i64 = out_shape[1..].iter().product();
        let start = (lo[0] * row) as usize;
        let len = dst.get_local_size() as usize;
        *dst.access_mut() =
            ArrayBuffer::from_f64_vec(dst.get_type(), &total[start..start + len])?;
    }
    Ok(dst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pagoda_net::{LocalProcessGroup, ProcessGroup};
    use pagoda_types::DataType;

    const NPROCS: usize = 4;

    #[test]
    fn reduce_op_single_record_identities() {
        for op in [ReduceOp::Avg, ReduceOp::Ttl, ReduceOp::Max, ReduceOp::Min] {
            assert_eq!(op.finalize(7.5, 1.0), 7.5);
        }
        assert_eq!(ReduceOp::SqrAvg.finalize(3.0, 1.0), 9.0);
        assert_eq!(ReduceOp::Rms.finalize(9.0, 1.0), 3.0);
    }

    #[test]
    fn binary_op_forms() {
        assert_eq!(BinaryOp::parse("+").unwrap(), BinaryOp::Add);
        assert_eq!(BinaryOp::parse("sbt").unwrap(), BinaryOp::Sbt);
        assert!(BinaryOp::parse("%").is_err());
    }

    #[tokio::test]
    async fn iadd_casts_right_operand() {
        let group = LocalProcessGroup::new_local_group(NPROCS).await.unwrap();
        let results = group
            .simulate_group_round((), |net, _| async move {
                let mut a = DistributedArray::create(DataType::I32, vec![8], &net);
                let mut b = DistributedArray::create(DataType::F64, vec![8], &net);
                a.fill_value(10.0).unwrap();
                b.fill_value(2.5).unwrap();
                a.iadd(&b).unwrap();
                a.get(&[0], &[7], &net).await.unwrap()
            })
            .await;
        for buf in results {
            assert_eq!(buf, crate::buffer::ArrayBuffer::I32(vec![12; 8]));
        }
    }

    #[tokio::test]
    async fn shape_mismatch_is_refused() {
        let group = LocalProcessGroup::new_local_group(NPROCS).await.unwrap();
        let results = group
            .simulate_group_round((), |net, _| async move {
                let mut a = DistributedArray::create(DataType::F32, vec![8], &net);
                let b = DistributedArray::create(DataType::F32, vec![9], &net);
                a.iadd(&b).is_err()
            })
            .await;
        assert!(results.into_iter().all(|failed| failed));
    }

    #[tokio::test]
    async fn transpose_with_reversal() {
        let group = LocalProcessGroup::new_local_group(NPROCS).await.unwrap();
        let results = group
            .simulate_group_round((), |net, _| async move {
                let mut a = DistributedArray::create(DataType::I64, vec![4, 3], &net);
                if net.is_root() {
                    a.put(
                        &crate::buffer::ArrayBuffer::I64((0..12).collect()),
                        &[0, 0],
                        &[3, 2],
                        &net,
                    )
                    .await
                    .unwrap();
                } else {
                    a.put(
                        &crate::buffer::ArrayBuffer::alloc(DataType::I64, 0),
                        &[],
                        &[],
                        &net,
                    )
                    .await
                    .unwrap();
                }
                let t = a.transpose(&[1, 0], &[], &net).await.unwrap();
                let r = a.transpose(&[0, 1], &[true, false], &net).await.unwrap();
                (
                    t.get(&[0, 0], &[2, 3], &net).await.unwrap(),
                    r.get(&[0, 0], &[3, 2], &net).await.unwrap(),
                )
            })
            .await;
        for (t, r) in results {
            assert_eq!(
                t,
                crate::buffer::ArrayBuffer::I64(vec![0, 3, 6, 9, 1, 4, 7, 10, 2, 5, 8, 11])
            );
            // axis 0 reversed: rows in reverse order
            assert_eq!(
                r,
                crate::buffer::ArrayBuffer::I64(vec![9, 10, 11, 6, 7, 8, 3, 4, 5, 0, 1, 2])
            );
        }
    }

    #[tokio::test]
    async fn reduce_sum_with_mask_and_weight() {
        let group = LocalProcessGroup::new_local_group(NPROCS).await.unwrap();
        let results = group
            .simulate_group_round((), |net, _| async move {
                let mut a = DistributedArray::create(DataType::F64, vec![4, 2], &net);
                if net.is_root() {
                    a.put(
                        &crate::buffer::ArrayBuffer::F64(vec![
                            1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0,
                        ]),
                        &[0, 0],
                        &[3, 1],
                        &net,
                    )
                    .await
                    .unwrap();
                } else {
                    a.put(
                        &crate::buffer::ArrayBuffer::alloc(DataType::F64, 0),
                        &[],
                        &[],
                        &net,
                    )
                    .await
                    .unwrap();
                }
                // drop row 1, double row 3
                let mut mask = DistributedArray::create(DataType::I32, vec![4], &net);
                mask.fill_value(1.0).unwrap();
                let drop_row = crate::buffer::ArrayBuffer::I32(vec![0]);
                mask.scatter(&drop_row, &[1], &net).await.unwrap();
                let mut weight = DistributedArray::create(DataType::F64, vec![4], &net);
                weight.fill_value(1.0).unwrap();
                weight
                    .scatter(&crate::buffer::ArrayBuffer::F64(vec![2.0]), &[3], &net)
                    .await
                    .unwrap();
                let reduced = reduce_sum(&a, &[0, 2], Some(&mask), Some(&weight), &net)
                    .await
                    .unwrap();
                reduced.get(&[0], &[1], &net).await.unwrap()
            })
            .await;
        for buf in results {
            // col0: 1 + 5 + 2*7 = 20, col1: 2 + 6 + 2*8 = 24
            assert_eq!(buf, crate::buffer::ArrayBuffer::F64(vec![20.0, 24.0]));
        }
    }
}
