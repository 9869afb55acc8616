//! Scalar, hardware-agnostic kernel implementations.
//!
//! Baseline routines guaranteed to work on any architecture; they double as
//! the reference implementations for the SIMD variants.

use half::f16;

/// Dot product of two f32 rows.
pub(crate) fn dot_f32(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(&x, &y)| x * y).sum()
}

/// Dot product of an f32 row with a BF16 row stored as raw `u16` bits.
pub(crate) fn dot_bf16(a: &[f32], b: &[u16]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(&x, &y)| x * f32::from_bits((y as u32) << 16))
        .sum()
}

/// Dot product of an f32 row with an FP16 row stored as raw `u16` bits.
pub(crate) fn dot_f16(a: &[f32], b: &[u16]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(&x, &y)| x * f16::from_bits(y).to_f32())
        .sum()
}

/// Dot product of an f32 row with a quantized u8 row, without the
/// scale/zero-point correction (applied by the caller).
pub(crate) fn dot_u8(a: &[f32], b: &[u8]) -> f32 {
    a.iter().zip(b.iter()).map(|(&x, &q)| x * q as f32).sum()
}

/// `acc += w * v` over an f32 row.
pub(crate) fn axpy_f32(acc: &mut [f32], v: &[f32], w: f32) {
    for (a, &x) in acc.iter_mut().zip(v.iter()) {
        *a += w * x;
    }
}

/// `acc += w * v` over a BF16 row stored as raw `u16` bits.
pub(crate) fn axpy_bf16(acc: &mut [f32], v: &[u16], w: f32) {
    for (a, &x) in acc.iter_mut().zip(v.iter()) {
        *a += w * f32::from_bits((x as u32) << 16);
    }
}

/// `acc += w * v` over an FP16 row stored as raw `u16` bits.
pub(crate) fn axpy_f16(acc: &mut [f32], v: &[u16], w: f32) {
    for (a, &x) in acc.iter_mut().zip(v.iter()) {
        *a += w * f16::from_bits(x).to_f32();
    }
}

/// `acc += w_scale * q - w_scale_zp` over a quantized u8 row.
///
/// With `w_scale = w * scale` and `w_scale_zp = w * scale * zp` this
/// accumulates `w * dequant(q)` without materializing the dequantized row.
pub(crate) fn axpy_u8(acc: &mut [f32], v: &[u8], w_scale: f32, w_scale_zp: f32) {
    for (a, &q) in acc.iter_mut().zip(v.iter()) {
        *a += w_scale * q as f32 - w_scale_zp;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use half::bf16;

    #[test]
    fn test_dot_bf16_matches_f32() {
        let a = [0.5f32, -1.0, 2.0];
        let b_f32 = [1.0f32, 2.0, 4.0];
        let b_bits: Vec<u16> = b_f32.iter().map(|&x| bf16::from_f32(x).to_bits()).collect();

        assert_eq!(dot_bf16(&a, &b_bits), dot_f32(&a, &b_f32));
    }

    #[test]
    fn test_axpy_u8_folds_zero_point() {
        let mut acc = [0.0f32; 2];
        let q = [10u8, 30];
        let (w, scale, zp) = (0.5f32, 0.1f32, 20.0f32);

        axpy_u8(&mut acc, &q, w * scale, w * scale * zp);

        assert!((acc[0] - w * scale * (10.0 - zp)).abs() < 1e-6);
        assert!((acc[1] - w * scale * (30.0 - zp)).abs() < 1e-6);
    }
}
