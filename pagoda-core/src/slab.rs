//! User-facing selections: strided index slabs, coordinate slabs, and
//! latitude/longitude boxes.

use pagoda_types::{PagodaError, Result};

fn parse_field<T: std::str::FromStr>(field: &str) -> Result<T> {
    field
        .parse()
        .map_err(|_| PagodaError::Range("invalid dimension string".to_string()))
}

/// A strided index selection over one named dimension.
///
/// Grammar: `name[,min[,max[,stride]]]`; empty positions keep their
/// defaults. The two-field form selects a single index.
#[derive(Clone, Debug, PartialEq)]
pub struct IndexHyperslab {
    pub name: String,
    pub min: Option<i64>,
    pub max: Option<i64>,
    pub stride: Option<i64>,
}

impl IndexHyperslab {
    pub fn single(name: impl Into<String>, index: i64) -> IndexHyperslab {
        IndexHyperslab {
            name: name.into(),
            min: Some(index),
            max: Some(index),
            stride: None,
        }
    }

    pub fn range(name: impl Into<String>, min: i64, max: i64) -> IndexHyperslab {
        IndexHyperslab {
            name: name.into(),
            min: Some(min),
            max: Some(max),
            stride: None,
        }
    }

    pub fn strided(name: impl Into<String>, min: i64, max: i64, stride: i64) -> IndexHyperslab {
        IndexHyperslab {
            name: name.into(),
            min: Some(min),
            max: Some(max),
            stride: Some(stride),
        }
    }

    pub fn parse(arg: &str) -> Result<IndexHyperslab> {
        let parts: Vec<&str> = arg.split(',').collect();
        if parts.len() < 2 || parts.len() > 4 || parts[0].is_empty() {
            return Err(PagodaError::Range("invalid dimension string".to_string()));
        }
        if parts[1..].iter().all(|p| p.is_empty()) {
            return Err(PagodaError::Range("invalid dimension string".to_string()));
        }
        let mut slab = IndexHyperslab {
            name: parts[0].to_string(),
            min: None,
            max: None,
            stride: None,
        };
        if !parts[1].is_empty() {
            slab.min = Some(parse_field(parts[1])?);
        }
        if parts.len() == 2 {
            // single-index form
            slab.max = slab.min;
            return Ok(slab);
        }
        if !parts[2].is_empty() {
            slab.max = Some(parse_field(parts[2])?);
        }
        if parts.len() == 4 && !parts[3].is_empty() {
            slab.stride = Some(parse_field(parts[3])?);
        }
        Ok(slab)
    }

    /// Resolve against a dimension of `size` elements into an inclusive
    /// `(min, max, step)` triple. Negative indices wrap once; a zero or
    /// direction-inconsistent step is an error.
    pub fn resolve(&self, size: i64) -> Result<(i64, i64, i64)> {
        let step = self.stride.unwrap_or(1);
        if step == 0 {
            return Err(PagodaError::Range(format!(
                "zero stride for dimension '{}'",
                self.name
            )));
        }
        let wrap = |v: i64| if v < 0 { v + size } else { v };
        let min = self.min.map(wrap).unwrap_or(0);
        let mut max = self.max.map(wrap).unwrap_or(size - 1);
        if max == size {
            // an exclusive-style upper bound names the whole range
            max = size - 1;
        }
        if min < 0 || min >= size || max < 0 || max >= size {
            return Err(PagodaError::Range(format!(
                "index out of range for dimension '{}' of size {}",
                self.name, size
            )));
        }
        if (min > max && step > 0) || (min < max && step < 0) {
            return Err(PagodaError::Range(format!(
                "inconsistent range for dimension '{}'",
                self.name
            )));
        }
        Ok((min, max, step))
    }

    /// Whether global index `g` survives the resolved slab.
    pub fn keeps(resolved: (i64, i64, i64), g: i64) -> bool {
        let (min, max, step) = resolved;
        if step > 0 {
            g >= min && g <= max && (g - min) % step == 0
        } else {
            g <= min && g >= max && (min - g) % (-step) == 0
        }
    }
}

/// A coordinate-value selection over one named dimension, resolved against
/// that dimension's coordinate variable.
#[derive(Clone, Debug, PartialEq)]
pub struct CoordHyperslab {
    pub name: String,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl CoordHyperslab {
    pub fn range(name: impl Into<String>, min: f64, max: f64) -> CoordHyperslab {
        CoordHyperslab {
            name: name.into(),
            min: Some(min),
            max: Some(max),
        }
    }

    pub fn parse(arg: &str) -> Result<CoordHyperslab> {
        let parts: Vec<&str> = arg.split(',').collect();
        if parts.len() < 2 || parts.len() > 3 || parts[0].is_empty() {
            return Err(PagodaError::Range("invalid dimension string".to_string()));
        }
        if parts[1..].iter().all(|p| p.is_empty()) {
            return Err(PagodaError::Range("invalid dimension string".to_string()));
        }
        let mut slab = CoordHyperslab {
            name: parts[0].to_string(),
            min: None,
            max: None,
        };
        if !parts[1].is_empty() {
            slab.min = Some(parse_field(parts[1])?);
        }
        if parts.len() == 2 {
            slab.max = slab.min;
        } else if !parts[2].is_empty() {
            slab.max = Some(parse_field(parts[2])?);
        }
        Ok(slab)
    }

    /// Whether a coordinate value falls inside the requested span.
    pub fn accepts(&self, value: f64) -> bool {
        self.min.map_or(true, |m| value >= m) && self.max.map_or(true, |m| value <= m)
    }
}

/// Either selection form; `-d` arguments containing a '.' are coordinate
/// slabs, all others are index slabs.
#[derive(Clone, Debug, PartialEq)]
pub enum Slab {
    Index(IndexHyperslab),
    Coord(CoordHyperslab),
}

pub fn parse_slab(arg: &str) -> Result<Slab> {
    let numeric = arg.split_once(',').map(|(_, rest)| rest).unwrap_or("");
    if numeric.contains('.') {
        Ok(Slab::Coord(CoordHyperslab::parse(arg)?))
    } else {
        Ok(Slab::Index(IndexHyperslab::parse(arg)?))
    }
}

/// A closed latitude/longitude box.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LatLonBox {
    pub n: f64,
    pub s: f64,
    pub e: f64,
    pub w: f64,
}

impl LatLonBox {
    pub const GLOBAL: LatLonBox = LatLonBox {
        n: 90.0,
        s: -90.0,
        e: 180.0,
        w: -180.0,
    };

    pub fn new(north: f64, south: f64, east: f64, west: f64) -> Result<LatLonBox> {
        let this = LatLonBox {
            n: north,
            s: south,
            e: east,
            w: west,
        };
        this.check()?;
        Ok(this)
    }

    /// Parse `n,s,e,w`, or `w,s,e,n` when `aux_order` is set.
    pub fn parse(arg: &str, aux_order: bool) -> Result<LatLonBox> {
        let parts: Vec<&str> = arg.split(',').collect();
        if parts.len() != 4 {
            return Err(PagodaError::Range("invalid box string".to_string()));
        }
        let field = |i: usize| -> Result<f64> {
            parts[i]
                .parse()
                .map_err(|_| PagodaError::Range("invalid box string".to_string()))
        };
        if aux_order {
            LatLonBox::new(field(3)?, field(1)?, field(2)?, field(0)?)
        } else {
            LatLonBox::new(field(0)?, field(1)?, field(2)?, field(3)?)
        }
    }

    fn check(&self) -> Result<()> {
        if self.n > 90.0
            || self.s < -90.0
            || self.e > 180.0
            || self.w < -180.0
            || self.s > self.n
            || self.w > self.e
        {
            return Err(PagodaError::Range(format!(
                "invalid box {},{},{},{}",
                self.n, self.s, self.e, self.w
            )));
        }
        Ok(())
    }

    pub fn is_global(&self) -> bool {
        *self == LatLonBox::GLOBAL
    }

    /// Closed containment on all four edges.
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        self.s <= lat && lat <= self.n && self.w <= lon && lon <= self.e
    }

    /// The smallest box containing both operands.
    pub fn enclose(first: &LatLonBox, second: &LatLonBox) -> LatLonBox {
        LatLonBox {
            n: first.n.max(second.n),
            s: first.s.min(second.s),
            e: first.e.max(second.e),
            w: first.w.min(second.w),
        }
    }
}
