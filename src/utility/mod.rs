use ndarray::Array1;
use num_traits::Float;

/// Per-head slopes of the ALiBi positional bias.
///
/// The first `2^floor(log2(heads))` heads take successive powers of
/// `2^(-8/n)`; any remaining heads interleave the odd powers of `2^(-4/n)`.
pub fn alibi_slopes(heads: usize) -> Array1<f32> {
    let mut slopes = Array1::zeros(heads);
    if heads == 0 {
        return slopes;
    }
    let closest = 1usize << (usize::BITS - 1 - heads.leading_zeros());
    let base = 2.0_f32.powf(-8.0 / closest as f32);
    for i in 0..closest {
        slopes[i] = base.powi(i as i32 + 1);
    }
    let extra = 2.0_f32.powf(-4.0 / closest as f32);
    for i in 0..heads - closest {
        slopes[closest + i] = extra.powi(2 * i as i32 + 1);
    }
    slopes
}

/// Most negative finite value, used to mask out attention scores.
pub fn negative_infinity<T: Float>() -> T {
    T::min_value()
}

/// Native-endian bytes of a host buffer, ready for a host-to-device copy.
pub fn host_bytes(values: &Array1<f32>) -> Vec<u8> {
    values.iter().flat_map(|value| value.to_ne_bytes()).collect()
}
