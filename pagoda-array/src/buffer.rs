use pagoda_types::{DataType, PagodaError, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// A concrete element of the closed numeric type set.
pub trait Element: Copy + PartialEq + PartialOrd + Send + Sync + 'static {
    const TYPE: DataType;
    fn from_f64(v: f64) -> Self;
    fn to_f64(self) -> f64;
}

macro_rules! impl_element {
    ($t:ty, $tag:expr) => {
        impl Element for $t {
            const TYPE: DataType = $tag;
            fn from_f64(v: f64) -> Self {
                v as $t
            }
            fn to_f64(self) -> f64 {
                self as f64
            }
        }
    };
}

impl_element!(i8, DataType::I8);
impl_element!(i16, DataType::I16);
impl_element!(i32, DataType::I32);
impl_element!(i64, DataType::I64);
impl_element!(u8, DataType::U8);
impl_element!(u16, DataType::U16);
impl_element!(u32, DataType::U32);
impl_element!(u64, DataType::U64);
impl_element!(f32, DataType::F32);
impl_element!(f64, DataType::F64);

/// A typed, homogeneous value sequence: one variant per storage type.
///
/// `F80` metadata is stored in the `F64` variant; `Char` keeps raw bytes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ArrayBuffer {
    I8(Vec<i8>),
    I16(Vec<i16>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    U8(Vec<u8>),
    U16(Vec<u16>),
    U32(Vec<u32>),
    U64(Vec<u64>),
    F32(Vec<f32>),
    F64(Vec<f64>),
    Char(Vec<u8>),
    Str(Vec<String>),
}

/// Run `$body` with `$v` bound to the variant's vector, whatever the type.
macro_rules! each_variant {
    ($buf:expr, |$v:ident| $body:expr) => {
        match $buf {
            ArrayBuffer::I8($v) => $body,
            ArrayBuffer::I16($v) => $body,
            ArrayBuffer::I32($v) => $body,
            ArrayBuffer::I64($v) => $body,
            ArrayBuffer::U8($v) => $body,
            ArrayBuffer::U16($v) => $body,
            ArrayBuffer::U32($v) => $body,
            ArrayBuffer::U64($v) => $body,
            ArrayBuffer::F32($v) => $body,
            ArrayBuffer::F64($v) => $body,
            ArrayBuffer::Char($v) => $body,
            ArrayBuffer::Str($v) => $body,
        }
    };
}

/// Like `each_variant!`, but rebuilds the same variant from `$body`.
macro_rules! map_variant {
    ($buf:expr, |$v:ident| $body:expr) => {
        match $buf {
            ArrayBuffer::I8($v) => ArrayBuffer::I8($body),
            ArrayBuffer::I16($v) => ArrayBuffer::I16($body),
            ArrayBuffer::I32($v) => ArrayBuffer::I32($body),
            ArrayBuffer::I64($v) => ArrayBuffer::I64($body),
            ArrayBuffer::U8($v) => ArrayBuffer::U8($body),
            ArrayBuffer::U16($v) => ArrayBuffer::U16($body),
            ArrayBuffer::U32($v) => ArrayBuffer::U32($body),
            ArrayBuffer::U64($v) => ArrayBuffer::U64($body),
            ArrayBuffer::F32($v) => ArrayBuffer::F32($body),
            ArrayBuffer::F64($v) => ArrayBuffer::F64($body),
            ArrayBuffer::Char($v) => ArrayBuffer::Char($body),
            ArrayBuffer::Str($v) => ArrayBuffer::Str($body),
        }
    };
}

/// Run `$body` over a pair of same-variant vectors; mixed variants error.
macro_rules! zip_variant {
    ($a:expr, $b:expr, |$x:ident, $y:ident| $body:expr) => {
        match ($a, $b) {
            (ArrayBuffer::I8($x), ArrayBuffer::I8($y)) => $body,
            (ArrayBuffer::I16($x), ArrayBuffer::I16($y)) => $body,
            (ArrayBuffer::I32($x), ArrayBuffer::I32($y)) => $body,
            (ArrayBuffer::I64($x), ArrayBuffer::I64($y)) => $body,
            (ArrayBuffer::U8($x), ArrayBuffer::U8($y)) => $body,
            (ArrayBuffer::U16($x), ArrayBuffer::U16($y)) => $body,
            (ArrayBuffer::U32($x), ArrayBuffer::U32($y)) => $body,
            (ArrayBuffer::U64($x), ArrayBuffer::U64($y)) => $body,
            (ArrayBuffer::F32($x), ArrayBuffer::F32($y)) => $body,
            (ArrayBuffer::F64($x), ArrayBuffer::F64($y)) => $body,
            (ArrayBuffer::Char($x), ArrayBuffer::Char($y)) => $body,
            (ArrayBuffer::Str($x), ArrayBuffer::Str($y)) => $body,
            _ => {
                return Err(PagodaError::DataType(
                    "buffer variants differ".to_string(),
                ))
            }
        }
    };
}

/// Numeric single-buffer dispatch; char/string buffers error out.
macro_rules! each_numeric {
    ($buf:expr, |$v:ident| $body:expr) => {
        match $buf {
            ArrayBuffer::I8($v) => $body,
            ArrayBuffer::I16($v) => $body,
            ArrayBuffer::I32($v) => $body,
            ArrayBuffer::I64($v) => $body,
            ArrayBuffer::U8($v) => $body,
            ArrayBuffer::U16($v) => $body,
            ArrayBuffer::U32($v) => $body,
            ArrayBuffer::U64($v) => $body,
            ArrayBuffer::F32($v) => $body,
            ArrayBuffer::F64($v) => $body,
            _ => {
                return Err(PagodaError::DataType(
                    "numeric buffer required".to_string(),
                ))
            }
        }
    };
}

/// Numeric pair dispatch; char/string operands error out.
macro_rules! zip_numeric {
    ($a:expr, $b:expr, |$x:ident, $y:ident| $body:expr) => {
        match ($a, $b) {
            (ArrayBuffer::I8($x), ArrayBuffer::I8($y)) => $body,
            (ArrayBuffer::I16($x), ArrayBuffer::I16($y)) => $body,
            (ArrayBuffer::I32($x), ArrayBuffer::I32($y)) => $body,
            (ArrayBuffer::I64($x), ArrayBuffer::I64($y)) => $body,
            (ArrayBuffer::U8($x), ArrayBuffer::U8($y)) => $body,
            (ArrayBuffer::U16($x), ArrayBuffer::U16($y)) => $body,
            (ArrayBuffer::U32($x), ArrayBuffer::U32($y)) => $body,
            (ArrayBuffer::U64($x), ArrayBuffer::U64($y)) => $body,
            (ArrayBuffer::F32($x), ArrayBuffer::F32($y)) => $body,
            (ArrayBuffer::F64($x), ArrayBuffer::F64($y)) => $body,
            _ => {
                return Err(PagodaError::DataType(
                    "elementwise op needs matching numeric operands".to_string(),
                ))
            }
        }
    };
}

/// Storage type backing a tag (`F80` accumulators live in f64).
pub fn storage_type(ty: DataType) -> DataType {
    if ty == DataType::F80 {
        DataType::F64
    } else {
        ty
    }
}

impl ArrayBuffer {
    /// A zero-filled buffer of `n` elements.
    pub fn alloc(ty: DataType, n: usize) -> ArrayBuffer {
        match storage_type(ty) {
            DataType::I8 => ArrayBuffer::I8(vec![0; n]),
            DataType::I16 => ArrayBuffer::I16(vec![0; n]),
            DataType::I32 => ArrayBuffer::I32(vec![0; n]),
            DataType::I64 => ArrayBuffer::I64(vec![0; n]),
            DataType::U8 => ArrayBuffer::U8(vec![0; n]),
            DataType::U16 => ArrayBuffer::U16(vec![0; n]),
            DataType::U32 => ArrayBuffer::U32(vec![0; n]),
            DataType::U64 => ArrayBuffer::U64(vec![0; n]),
            DataType::F32 => ArrayBuffer::F32(vec![0.0; n]),
            DataType::F64 | DataType::F80 => ArrayBuffer::F64(vec![0.0; n]),
            DataType::Char => ArrayBuffer::Char(vec![0; n]),
            DataType::Str => ArrayBuffer::Str(vec![String::new(); n]),
        }
    }

    pub fn datatype(&self) -> DataType {
        match self {
            ArrayBuffer::I8(_) => DataType::I8,
            ArrayBuffer::I16(_) => DataType::I16,
            ArrayBuffer::I32(_) => DataType::I32,
            ArrayBuffer::I64(_) => DataType::I64,
            ArrayBuffer::U8(_) => DataType::U8,
            ArrayBuffer::U16(_) => DataType::U16,
            ArrayBuffer::U32(_) => DataType::U32,
            ArrayBuffer::U64(_) => DataType::U64,
            ArrayBuffer::F32(_) => DataType::F32,
            ArrayBuffer::F64(_) => DataType::F64,
            ArrayBuffer::Char(_) => DataType::Char,
            ArrayBuffer::Str(_) => DataType::Str,
        }
    }

    pub fn len(&self) -> usize {
        each_variant!(self, |v| v.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn resize(&mut self, n: usize) {
        each_variant!(self, |v| v.resize(n, Default::default()))
    }

    /// Contiguous sub-sequence `[start, start+len)`.
    pub fn slice(&self, start: usize, len: usize) -> ArrayBuffer {
        map_variant!(self, |v| v[start..start + len].to_vec())
    }

    /// Elements at the given flat offsets, in order.
    pub fn gather_flat(&self, idx: &[usize]) -> ArrayBuffer {
        map_variant!(self, |v| idx.iter().map(|&i| v[i].clone()).collect())
    }

    /// Store `src[k]` at flat offset `idx[k]`; variants must match.
    pub fn scatter_flat(&mut self, idx: &[usize], src: &ArrayBuffer) -> Result<()> {
        zip_variant!(self, src, |dst, vals| {
            for (&i, val) in idx.iter().zip(vals.iter()) {
                dst[i] = val.clone();
            }
        });
        Ok(())
    }

    /// Overwrite the contiguous range starting at `start` with `src`.
    pub fn write_slice(&mut self, start: usize, src: &ArrayBuffer) -> Result<()> {
        zip_variant!(self, src, |dst, vals| {
            dst[start..start + vals.len()].clone_from_slice(vals);
        });
        Ok(())
    }

    pub fn get_f64(&self, i: usize) -> Result<f64> {
        each_numeric!(self, |v| Ok(v[i].to_f64()))
    }

    pub fn set_f64(&mut self, i: usize, value: f64) -> Result<()> {
        each_numeric!(self, |v| {
            v[i] = Element::from_f64(value);
        });
        Ok(())
    }

    pub fn fill_f64(&mut self, value: f64) -> Result<()> {
        self.map_apply_f64(|_| value)
    }

    pub fn to_f64_vec(&self) -> Result<Vec<f64>> {
        each_numeric!(self, |v| Ok(v.iter().map(|x| x.to_f64()).collect()))
    }

    pub fn from_f64_vec(ty: DataType, values: &[f64]) -> Result<ArrayBuffer> {
        let mut out = ArrayBuffer::alloc(ty, values.len());
        each_numeric!(&mut out, |v| {
            for (dst, &src) in v.iter_mut().zip(values.iter()) {
                *dst = Element::from_f64(src);
            }
        });
        Ok(out)
    }

    /// Elementwise cast. Char↔numeric and string crosses are errors.
    pub fn cast_to(&self, ty: DataType) -> Result<ArrayBuffer> {
        let target = storage_type(ty);
        if self.datatype() == target {
            return Ok(self.clone());
        }
        if !self.datatype().is_numeric() || !target.is_numeric() {
            return Err(PagodaError::DataType(format!(
                "cannot convert {} to {}",
                self.datatype(),
                target
            )));
        }
        ArrayBuffer::from_f64_vec(target, &self.to_f64_vec()?)
    }

    /// In-place `lhs[i] = f(lhs[i], rhs[i])` over a same-variant numeric pair.
    pub fn zip_apply_f64(
        &mut self,
        rhs: &ArrayBuffer,
        f: impl Fn(f64, f64) -> f64 + Sync + Send,
    ) -> Result<()> {
        if self.len() != rhs.len() {
            return Err(PagodaError::ShapeMismatch(
                "operand lengths differ".to_string(),
            ));
        }
        zip_numeric!(self, rhs, |a, b| {
            a.par_iter_mut().zip(b.par_iter()).for_each(|(x, y)| {
                *x = Element::from_f64(f(x.to_f64(), y.to_f64()));
            });
        });
        Ok(())
    }

    /// Like `zip_apply_f64`, but skips right-hand elements equal to `fill`
    /// and bumps the tally wherever a contribution landed.
    pub fn zip_apply_counted(
        &mut self,
        rhs: &ArrayBuffer,
        fill: f64,
        tally: &mut ArrayBuffer,
        f: impl Fn(f64, f64) -> f64,
    ) -> Result<()> {
        if self.len() != rhs.len() || self.len() != tally.len() {
            return Err(PagodaError::ShapeMismatch(
                "operand lengths differ".to_string(),
            ));
        }
        for i in 0..self.len() {
            let y = rhs.get_f64(i)?;
            if y == fill {
                continue;
            }
            let x = self.get_f64(i)?;
            self.set_f64(i, f(x, y))?;
            tally.set_f64(i, tally.get_f64(i)? + 1.0)?;
        }
        Ok(())
    }

    /// In-place `v[i] = f(v[i])` over a numeric buffer.
    pub fn map_apply_f64(&mut self, f: impl Fn(f64) -> f64 + Sync + Send) -> Result<()> {
        each_numeric!(self, |v| {
            v.par_iter_mut().for_each(|x| {
                *x = Element::from_f64(f(x.to_f64()));
            });
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cast_round_trip_when_target_holds_source() {
        let src = ArrayBuffer::I16(vec![-3, 0, 1200, i16::MAX]);
        let wide = src.cast_to(DataType::I64).unwrap();
        let back = wide.cast_to(DataType::I16).unwrap();
        assert_eq!(src, back);
    }

    #[test]
    fn char_numeric_cross_is_an_error() {
        let chars = ArrayBuffer::Char(b"time".to_vec());
        assert!(chars.cast_to(DataType::I32).is_err());
        let ints = ArrayBuffer::I32(vec![1]);
        assert!(ints.cast_to(DataType::Char).is_err());
    }

    #[test]
    fn gather_and_scatter_flat() {
        let src = ArrayBuffer::F32(vec![0.0, 1.0, 2.0, 3.0, 4.0]);
        let picked = src.gather_flat(&[4, 0, 2]);
        assert_eq!(picked, ArrayBuffer::F32(vec![4.0, 0.0, 2.0]));

        let mut dst = ArrayBuffer::F32(vec![0.0; 5]);
        dst.scatter_flat(&[1, 3], &ArrayBuffer::F32(vec![9.0, 8.0]))
            .unwrap();
        assert_eq!(dst, ArrayBuffer::F32(vec![0.0, 9.0, 0.0, 8.0, 0.0]));
    }

    #[test]
    fn counted_accumulate_skips_fill() {
        let mut acc = ArrayBuffer::F64(vec![0.0, 0.0]);
        let mut tally = ArrayBuffer::I32(vec![0, 0]);
        acc.zip_apply_counted(
            &ArrayBuffer::F64(vec![4.0, 2.0]),
            4.0,
            &mut tally,
            |a, b| a + b,
        )
        .unwrap();
        assert_eq!(acc, ArrayBuffer::F64(vec![0.0, 2.0]));
        assert_eq!(tally, ArrayBuffer::I32(vec![0, 1]));
    }
}
