//! Safe entry points over the architecture-specific kernel zone.
//!
//! Every routine here picks the best implementation available at runtime
//! (AVX2/FMA on x86-64, NEON on aarch64, scalar otherwise) in the same way
//! for every call site, so the numeric behavior of a run is fixed by the
//! machine, not by the caller.

pub(crate) mod quant;
pub(crate) mod scalar;
pub(crate) mod softmax;

#[cfg(target_arch = "x86_64")]
pub(crate) mod x86;

#[cfg(target_arch = "aarch64")]
pub(crate) mod aarch64;

use crate::tensor::{AttnElem, ElemType};

/// Whether the AVX2/FMA kernel zone is usable on this machine.
#[cfg(target_arch = "x86_64")]
#[inline]
pub(crate) fn has_avx2_fma() -> bool {
    is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma")
}

/// Whether BF16 attention can run with SIMD support on this machine.
pub fn bf16_supported() -> bool {
    #[cfg(target_arch = "x86_64")]
    {
        has_avx2_fma()
    }
    #[cfg(target_arch = "aarch64")]
    {
        std::arch::is_aarch64_feature_detected!("neon")
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        false
    }
}

/// Dot product of two f32 rows.
#[inline]
pub(crate) fn dot_f32(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    #[cfg(target_arch = "x86_64")]
    if has_avx2_fma() {
        return unsafe { x86::f32::dot_f32(a, b) };
    }
    #[cfg(target_arch = "aarch64")]
    if std::arch::is_aarch64_feature_detected!("neon") {
        return unsafe { aarch64::f32::dot_f32(a, b) };
    }
    scalar::dot_f32(a, b)
}

/// Dot product of an f32 row with a BF16 row given as raw bits.
#[inline]
pub(crate) fn dot_bf16(a: &[f32], b: &[u16]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    #[cfg(target_arch = "x86_64")]
    if has_avx2_fma() {
        return unsafe { x86::bf16::dot_bf16(a, b) };
    }
    #[cfg(target_arch = "aarch64")]
    if std::arch::is_aarch64_feature_detected!("neon") {
        return unsafe { aarch64::bf16::dot_bf16(a, b) };
    }
    scalar::dot_bf16(a, b)
}

/// `acc += w * v` over an f32 row.
#[inline]
pub(crate) fn axpy_f32(acc: &mut [f32], v: &[f32], w: f32) {
    debug_assert_eq!(acc.len(), v.len());
    #[cfg(target_arch = "x86_64")]
    if has_avx2_fma() {
        return unsafe { x86::f32::axpy_f32(acc, v, w) };
    }
    #[cfg(target_arch = "aarch64")]
    if std::arch::is_aarch64_feature_detected!("neon") {
        return unsafe { aarch64::f32::axpy_f32(acc, v, w) };
    }
    scalar::axpy_f32(acc, v, w)
}

/// `acc += w * v` over a BF16 row given as raw bits.
#[inline]
pub(crate) fn axpy_bf16(acc: &mut [f32], v: &[u16], w: f32) {
    debug_assert_eq!(acc.len(), v.len());
    #[cfg(target_arch = "x86_64")]
    if has_avx2_fma() {
        return unsafe { x86::bf16::axpy_bf16(acc, v, w) };
    }
    #[cfg(target_arch = "aarch64")]
    if std::arch::is_aarch64_feature_detected!("neon") {
        return unsafe { aarch64::bf16::axpy_bf16(acc, v, w) };
    }
    scalar::axpy_bf16(acc, v, w)
}

/// Dot product of an f32 row with a typed row.
#[inline]
pub(crate) fn dot<T: AttnElem>(a_f32: &[f32], b: &[T]) -> f32 {
    match T::DTYPE {
        ElemType::F32 => dot_f32(a_f32, bytemuck::cast_slice(b)),
        ElemType::Bf16 => dot_bf16(a_f32, bytemuck::cast_slice(b)),
        ElemType::F16 => scalar::dot_f16(a_f32, bytemuck::cast_slice(b)),
        ElemType::U8 => unreachable!("u8 rows go through the quantized path"),
    }
}

/// `acc += w * v` over a typed row.
#[inline]
pub(crate) fn axpy<T: AttnElem>(acc: &mut [f32], v: &[T], w: f32) {
    match T::DTYPE {
        ElemType::F32 => axpy_f32(acc, bytemuck::cast_slice(v), w),
        ElemType::Bf16 => axpy_bf16(acc, bytemuck::cast_slice(v), w),
        ElemType::F16 => scalar::axpy_f16(acc, bytemuck::cast_slice(v), w),
        ElemType::U8 => unreachable!("u8 rows go through the quantized path"),
    }
}

/// Widen a typed row to f32.
#[inline]
pub(crate) fn to_f32_row<T: AttnElem>(src: &[T], dst: &mut [f32]) {
    for (d, &s) in dst.iter_mut().zip(src.iter()) {
        *d = s.to_f32();
    }
}

/// Narrow an f32 row to the typed output.
#[inline]
pub(crate) fn from_f32_row<T: AttnElem>(src: &[f32], dst: &mut [T]) {
    for (d, &s) in dst.iter_mut().zip(src.iter()) {
        *d = T::from_f32(s);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use half::bf16;

    #[test]
    fn test_dispatched_dot_matches_scalar() {
        let a: Vec<f32> = (0..67).map(|i| i as f32 * 0.25 - 4.0).collect();
        let b: Vec<f32> = (0..67).map(|i| 1.0 - i as f32 * 0.125).collect();

        let simd = dot_f32(&a, &b);
        let reference = scalar::dot_f32(&a, &b);
        assert!((simd - reference).abs() < 1e-3, "{simd} vs {reference}");
    }

    #[test]
    fn test_generic_dot_bf16() {
        let a = vec![1.0f32; 16];
        let b = vec![bf16::from_f32(2.0); 16];
        assert_eq!(dot::<bf16>(&a, &b), 32.0);
    }

    #[test]
    fn test_dispatched_axpy_matches_scalar() {
        let v: Vec<f32> = (0..19).map(|i| i as f32).collect();
        let mut acc_a = vec![1.0f32; 19];
        let mut acc_b = acc_a.clone();

        axpy_f32(&mut acc_a, &v, 0.5);
        scalar::axpy_f32(&mut acc_b, &v, 0.5);
        assert_eq!(acc_a, acc_b);
    }
}
