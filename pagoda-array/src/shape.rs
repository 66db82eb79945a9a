//! Index arithmetic over row-major rectangles.

/// Number of elements in a shape; the empty shape holds one element.
pub fn shape_size(shape: &[i64]) -> i64 {
    shape.iter().product()
}

/// Unravel a flat row-major offset into an N-dimensional index.
///
/// x and dims of [a,b,c,d] --> [x/dcb % a, x/dc % b, x/d % c, x/1 % d]
pub fn unravel(x: i64, dims: &[i64], result: &mut [i64]) {
    let ndim = dims.len();
    let mut x = x;
    result[ndim - 1] = x % dims[ndim - 1];
    for i in (0..ndim - 1).rev() {
        x /= dims[i + 1];
        result[i] = x % dims[i];
    }
}

/// Flatten an N-dimensional index into a row-major offset.
pub fn ravel(idx: &[i64], dims: &[i64]) -> i64 {
    let mut flat = 0;
    for (i, d) in idx.iter().zip(dims.iter()) {
        flat = flat * d + i;
    }
    flat
}

/// Per-axis extents of an inclusive rectangle.
pub fn rect_extents(lo: &[i64], hi: &[i64]) -> Vec<i64> {
    lo.iter().zip(hi.iter()).map(|(l, h)| h - l + 1).collect()
}

pub fn rect_size(lo: &[i64], hi: &[i64]) -> i64 {
    lo.iter().zip(hi.iter()).map(|(l, h)| h - l + 1).product()
}

/// Intersection of two inclusive rectangles, if non-empty.
pub fn rect_intersect(
    alo: &[i64],
    ahi: &[i64],
    blo: &[i64],
    bhi: &[i64],
) -> Option<(Vec<i64>, Vec<i64>)> {
    let mut lo = Vec::with_capacity(alo.len());
    let mut hi = Vec::with_capacity(alo.len());
    for d in 0..alo.len() {
        let l = alo[d].max(blo[d]);
        let h = ahi[d].min(bhi[d]);
        if l > h {
            return None;
        }
        lo.push(l);
        hi.push(h);
    }
    Some((lo, hi))
}

/// Row-major flat offsets, within the outer rectangle's local buffer, of
/// every element of the inner rectangle. The inner rectangle must be
/// contained in the outer one.
pub fn flat_indices_of_rect(
    outer_lo: &[i64],
    outer_hi: &[i64],
    inner_lo: &[i64],
    inner_hi: &[i64],
) -> Vec<usize> {
    let ndim = outer_lo.len();
    let outer_extents = rect_extents(outer_lo, outer_hi);
    let inner_extents = rect_extents(inner_lo, inner_hi);
    let count = shape_size(&inner_extents);
    let mut out = Vec::with_capacity(count as usize);
    let mut idx = vec![0i64; ndim];
    for flat in 0..count {
        unravel(flat, &inner_extents, &mut idx);
        let mut offset = 0i64;
        for d in 0..ndim {
            offset = offset * outer_extents[d] + (inner_lo[d] - outer_lo[d] + idx[d]);
        }
        out.push(offset as usize);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unravel_round_trips() {
        let dims = [3, 4, 5];
        let mut idx = [0i64; 3];
        for flat in 0..shape_size(&dims) {
            unravel(flat, &dims, &mut idx);
            assert_eq!(ravel(&idx, &dims), flat);
        }
    }

    #[test]
    fn intersect_empty_and_full() {
        assert_eq!(
            rect_intersect(&[0, 0], &[3, 3], &[2, 1], &[5, 2]),
            Some((vec![2, 1], vec![3, 2]))
        );
        assert_eq!(rect_intersect(&[0], &[3], &[4], &[9]), None);
    }

    #[test]
    fn inner_rect_offsets() {
        // outer 2x4 rectangle, inner is its second column pair
        let idx = flat_indices_of_rect(&[0, 0], &[1, 3], &[0, 1], &[1, 2]);
        assert_eq!(idx, vec![1, 2, 5, 6]);
    }
}
