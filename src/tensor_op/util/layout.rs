//! Shape and stride helpers shared by the inference rules.

use itertools::Itertools;

use crate::error::Result;

/// Packed strides with the last dimension moving fastest.
pub fn row_major_strides(dims: &[usize]) -> Vec<usize> {
    let order: Vec<usize> = (0..dims.len()).rev().collect();
    strides_from_order(dims, &order)
}

/// Packed channels-last strides for an `{N, C, ...spatial}` shape: C moves
/// fastest, then the spatial axes from last to first, then N.
pub fn nhwc_strides(dims: &[usize]) -> Vec<usize> {
    let rank = dims.len();
    if rank < 3 {
        return row_major_strides(dims);
    }
    let mut order = vec![0; rank];
    order[0] = rank - 1;
    for (axis, slot) in order.iter_mut().enumerate().skip(2) {
        *slot = rank - axis;
    }
    strides_from_order(dims, &order)
}

/// Rank of every dimension by stride, `0` being the fastest-moving one.
///
/// Equal strides (size-1 dimensions) resolve in favour of the later dimension,
/// so a fully broadcast `{1, 1, 1, 1}` tensor reads as row-major.
pub fn stride_order(strides: &[usize]) -> Vec<usize> {
    let by_speed = (0..strides.len())
        .sorted_by(|&a, &b| strides[a].cmp(&strides[b]).then(b.cmp(&a)))
        .collect::<Vec<usize>>();
    let mut order = vec![0; strides.len()];
    for (rank, index) in by_speed.into_iter().enumerate() {
        order[index] = rank;
    }
    order
}

/// Packed strides for `dims` laid out in the given stride order.
pub fn strides_from_order(dims: &[usize], order: &[usize]) -> Vec<usize> {
    let mut strides = vec![0; dims.len()];
    let mut running = 1;
    for index in (0..dims.len()).sorted_by_key(|&i| order[i]) {
        strides[index] = running;
        running *= dims[index].max(1);
    }
    strides
}

/// Numpy-style broadcast of equal-rank shapes.
pub fn broadcast_dims(shapes: &[&[usize]]) -> Result<Vec<usize>> {
    let rank = shapes.iter().map(|shape| shape.len()).max().unwrap_or(0);
    let mut output = vec![1; rank];
    for shape in shapes {
        ensure!(
            shape.len() == rank,
            GraphNotSupported,
            "Cannot broadcast shapes of different rank: {:?}",
            shapes
        );
        for (out, &dim) in output.iter_mut().zip(shape.iter()) {
            if *out == 1 {
                *out = dim;
            } else {
                ensure!(
                    dim == 1 || dim == *out,
                    GraphNotSupported,
                    "Shapes {:?} are not broadcast compatible",
                    shapes
                );
            }
        }
    }
    Ok(output)
}

pub fn round_up(value: usize, granularity: usize) -> usize {
    (value + granularity - 1) / granularity * granularity
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn row_major() {
        assert_eq!(row_major_strides(&[2, 4, 128, 64]), vec![32768, 8192, 64, 1]);
        assert_eq!(row_major_strides(&[1, 1, 1, 1]), vec![1, 1, 1, 1]);
    }

    #[test]
    fn channels_last() {
        assert_eq!(nhwc_strides(&[2, 3, 4, 5]), vec![60, 1, 15, 3]);
        assert_eq!(nhwc_strides(&[4, 32, 1, 1]), vec![32, 1, 32, 32]);
        assert_eq!(nhwc_strides(&[2, 3, 4, 5, 6]), vec![360, 1, 90, 18, 3]);
    }

    #[test]
    fn stride_order_round_trips_layout() {
        // b, s, h, d layout viewed as b, h, s, d
        let strides = vec![4 * 128 * 64, 64, 4 * 64, 1];
        let order = stride_order(&strides);
        assert_eq!(order, vec![3, 1, 2, 0]);
        assert_eq!(strides_from_order(&[2, 4, 128, 64], &order), strides);
    }

    #[test]
    fn scalar_reads_as_row_major() {
        assert_eq!(stride_order(&[1, 1, 1, 1]), vec![3, 2, 1, 0]);
    }

    #[test]
    fn broadcast() {
        assert_eq!(
            broadcast_dims(&[&[2, 4, 8, 8], &[1, 1, 1, 1], &[2, 1, 1, 1]]).unwrap(),
            vec![2, 4, 8, 8]
        );
        assert!(broadcast_dims(&[&[2, 4, 8, 8], &[2, 4, 8, 4]]).is_err());
        assert!(broadcast_dims(&[&[2, 4, 8, 8], &[8, 8]]).is_err());
    }

    #[test]
    fn rounding() {
        assert_eq!(round_up(1, 64), 64);
        assert_eq!(round_up(64, 64), 64);
        assert_eq!(round_up(65, 64), 128);
    }
}
