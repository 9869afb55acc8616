//! AVX2/FMA accelerated kernels for BF16 rows.
//!
//! This module is part of the `unsafe` kernel zone. The functions within are
//! designed to be called from the safe dispatchers in `kernels::mod`.

#![allow(unsafe_code)]
use super::common::hsum_ps_avx;
use std::arch::x86_64::*;

#[inline(always)]
unsafe fn bf16x8_to_f32x8(bits: __m128i) -> __m256 {
    unsafe {
        let expanded = _mm256_cvtepu16_epi32(bits);
        _mm256_castsi256_ps(_mm256_slli_epi32(expanded, 16))
    }
}

/// Dot product of an F32 row with a BF16 row (raw `u16` bits) using AVX2/FMA.
///
/// # Safety
///
/// The caller must ensure AVX2 and FMA are present and `a.len() == b.len()`.
#[target_feature(enable = "avx2", enable = "fma")]
pub(crate) unsafe fn dot_bf16(a: &[f32], b: &[u16]) -> f32 {
    unsafe {
        let k = a.len();
        let mut a_ptr = a.as_ptr();
        let mut b_ptr = b.as_ptr();

        let mut sum0 = _mm256_setzero_ps();
        let mut sum1 = _mm256_setzero_ps();

        let mut n = k;
        while n >= 16 {
            let a0 = _mm256_loadu_ps(a_ptr);
            let a1 = _mm256_loadu_ps(a_ptr.add(8));

            let b0 = bf16x8_to_f32x8(_mm_loadu_si128(b_ptr as *const __m128i));
            let b1 = bf16x8_to_f32x8(_mm_loadu_si128(b_ptr.add(8) as *const __m128i));

            sum0 = _mm256_fmadd_ps(a0, b0, sum0);
            sum1 = _mm256_fmadd_ps(a1, b1, sum1);

            a_ptr = a_ptr.add(16);
            b_ptr = b_ptr.add(16);
            n -= 16;
        }

        let mut sum = hsum_ps_avx(_mm256_add_ps(sum0, sum1));

        while n > 0 {
            sum += *a_ptr * f32::from_bits((*b_ptr as u32) << 16);
            a_ptr = a_ptr.add(1);
            b_ptr = b_ptr.add(1);
            n -= 1;
        }
        sum
    }
}

/// `acc += w * v` over a BF16 row (raw `u16` bits) using AVX2/FMA.
///
/// # Safety
///
/// The caller must ensure AVX2 and FMA are present and `acc.len() == v.len()`.
#[target_feature(enable = "avx2", enable = "fma")]
pub(crate) unsafe fn axpy_bf16(acc: &mut [f32], v: &[u16], w: f32) {
    unsafe {
        let k = acc.len();
        let wv = _mm256_set1_ps(w);
        let mut acc_ptr = acc.as_mut_ptr();
        let mut v_ptr = v.as_ptr();

        let mut n = k;
        while n >= 8 {
            let a = _mm256_loadu_ps(acc_ptr);
            let x = bf16x8_to_f32x8(_mm_loadu_si128(v_ptr as *const __m128i));
            _mm256_storeu_ps(acc_ptr, _mm256_fmadd_ps(wv, x, a));
            acc_ptr = acc_ptr.add(8);
            v_ptr = v_ptr.add(8);
            n -= 8;
        }
        while n > 0 {
            *acc_ptr += w * f32::from_bits((*v_ptr as u32) << 16);
            acc_ptr = acc_ptr.add(1);
            v_ptr = v_ptr.add(1);
            n -= 1;
        }
    }
}
