//! SIMD kernels for distance computation using the `wide` crate.
//!
//! Callers are responsible for checking that both slices have the same
//! length; the kernels only debug-assert it.

use wide::f32x8;

#[inline]
fn load(values: &[f32], start: usize) -> f32x8 {
    f32x8::new([
        values[start],
        values[start + 1],
        values[start + 2],
        values[start + 3],
        values[start + 4],
        values[start + 5],
        values[start + 6],
        values[start + 7],
    ])
}

/// SIMD-optimized dot product.
pub fn dot_product_simd(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());

    let mut sum = f32x8::splat(0.0);
    let chunks = a.len() / 8;

    for i in 0..chunks {
        let start = i * 8;
        sum += load(a, start) * load(b, start);
    }

    let mut result = sum.to_array().iter().sum::<f32>();
    for i in (chunks * 8)..a.len() {
        result += a[i] * b[i];
    }

    result
}

/// SIMD-optimized squared Euclidean distance.
pub fn squared_euclidean_simd(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());

    let mut sum = f32x8::splat(0.0);
    let chunks = a.len() / 8;

    for i in 0..chunks {
        let start = i * 8;
        let diff = load(a, start) - load(b, start);
        sum += diff * diff;
    }

    let mut result = sum.to_array().iter().sum::<f32>();
    for i in (chunks * 8)..a.len() {
        let diff = a[i] - b[i];
        result += diff * diff;
    }

    result
}

/// SIMD-optimized L2 magnitude.
pub fn magnitude_simd(vector: &[f32]) -> f32 {
    dot_product_simd(vector, vector).sqrt()
}
