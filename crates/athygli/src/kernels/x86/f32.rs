//! AVX2/FMA accelerated kernels for F32 rows.
//!
//! This module is part of the `unsafe` kernel zone. The functions within are
//! designed to be called from the safe dispatchers in `kernels::mod`.

#![allow(unsafe_code)]
use super::common::hsum_ps_avx;
use std::arch::x86_64::*;

/// Dot product of two equally sized F32 rows using AVX2/FMA.
///
/// # Safety
///
/// The caller must ensure AVX2 and FMA are present and `a.len() == b.len()`.
#[target_feature(enable = "avx2", enable = "fma")]
pub(crate) unsafe fn dot_f32(a: &[f32], b: &[f32]) -> f32 {
    unsafe {
        let k = a.len();
        let mut a_ptr = a.as_ptr();
        let mut b_ptr = b.as_ptr();

        let mut sum0 = _mm256_setzero_ps();
        let mut sum1 = _mm256_setzero_ps();
        let mut sum2 = _mm256_setzero_ps();
        let mut sum3 = _mm256_setzero_ps();

        let mut n = k;
        while n >= 32 {
            let a0 = _mm256_loadu_ps(a_ptr);
            let a1 = _mm256_loadu_ps(a_ptr.add(8));
            let a2 = _mm256_loadu_ps(a_ptr.add(16));
            let a3 = _mm256_loadu_ps(a_ptr.add(24));

            let b0 = _mm256_loadu_ps(b_ptr);
            let b1 = _mm256_loadu_ps(b_ptr.add(8));
            let b2 = _mm256_loadu_ps(b_ptr.add(16));
            let b3 = _mm256_loadu_ps(b_ptr.add(24));

            sum0 = _mm256_fmadd_ps(a0, b0, sum0);
            sum1 = _mm256_fmadd_ps(a1, b1, sum1);
            sum2 = _mm256_fmadd_ps(a2, b2, sum2);
            sum3 = _mm256_fmadd_ps(a3, b3, sum3);

            a_ptr = a_ptr.add(32);
            b_ptr = b_ptr.add(32);
            n -= 32;
        }

        sum0 = _mm256_add_ps(_mm256_add_ps(sum0, sum1), _mm256_add_ps(sum2, sum3));
        let mut sum = hsum_ps_avx(sum0);

        while n > 0 {
            sum += *a_ptr * *b_ptr;
            a_ptr = a_ptr.add(1);
            b_ptr = b_ptr.add(1);
            n -= 1;
        }
        sum
    }
}

/// `acc += w * v` over an F32 row using AVX2/FMA.
///
/// # Safety
///
/// The caller must ensure AVX2 and FMA are present and `acc.len() == v.len()`.
#[target_feature(enable = "avx2", enable = "fma")]
pub(crate) unsafe fn axpy_f32(acc: &mut [f32], v: &[f32], w: f32) {
    unsafe {
        let k = acc.len();
        let wv = _mm256_set1_ps(w);
        let mut acc_ptr = acc.as_mut_ptr();
        let mut v_ptr = v.as_ptr();

        let mut n = k;
        while n >= 8 {
            let a = _mm256_loadu_ps(acc_ptr);
            let x = _mm256_loadu_ps(v_ptr);
            _mm256_storeu_ps(acc_ptr, _mm256_fmadd_ps(wv, x, a));
            acc_ptr = acc_ptr.add(8);
            v_ptr = v_ptr.add(8);
            n -= 8;
        }
        while n > 0 {
            *acc_ptr += w * *v_ptr;
            acc_ptr = acc_ptr.add(1);
            v_ptr = v_ptr.add(1);
            n -= 1;
        }
    }
}
