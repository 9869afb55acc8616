//! Matmul primitives behind a uniform `C = alpha * op(A) * op(B) + beta * C`
//! surface.
//!
//! Three entry points serve the attention kernels: a general batched matmul
//! over `[B, H, ., .]` views (score and output products of the full-matmul
//! path), a packed-B panel kernel whose layout stays opaque behind
//! [`PackedGemm::pack_b`], and a thin f32 [`sgemm`]. Scores always accumulate
//! in f32 regardless of the input precision.

use ndarray::{s, ArrayView2, ArrayView4, Axis};
use rayon::prelude::*;

use crate::common::error::{precondition, AttentionError, Result};
use crate::kernels;
use crate::tensor::{AttnElem, ElemType};

/// Structural identity of a prepared batched-matmul descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct MatmulKey {
    pub dtype: ElemType,
    pub a_dims: [usize; 4],
    pub b_dims: [usize; 4],
    pub a_strides: [isize; 4],
    pub b_strides: [isize; 4],
    pub b_transposed: bool,
}

impl MatmulKey {
    pub(crate) fn of<T: AttnElem>(
        a: &ArrayView4<'_, T>,
        b: &ArrayView4<'_, T>,
        b_transposed: bool,
    ) -> Self {
        let mut a_strides = [0isize; 4];
        let mut b_strides = [0isize; 4];
        a_strides.copy_from_slice(a.strides());
        b_strides.copy_from_slice(b.strides());
        Self {
            dtype: T::DTYPE,
            a_dims: [a.dim().0, a.dim().1, a.dim().2, a.dim().3],
            b_dims: [b.dim().0, b.dim().1, b.dim().2, b.dim().3],
            a_strides,
            b_strides,
            b_transposed,
        }
    }
}

/// Prepared descriptor for the general batched matmul.
///
/// Preparation validates the shape/stride combination once; the descriptor is
/// kept by the prefill kernel and rebuilt only when the key changes.
pub(crate) struct MatmulPrim {
    key: MatmulKey,
}

impl MatmulPrim {
    pub(crate) fn prepare(key: MatmulKey) -> Result<Self> {
        let [.., ak] = key.a_dims;
        precondition!(
            key.a_dims.iter().all(|&d| d > 0) && key.b_dims.iter().all(|&d| d > 0),
            "matmul with a zero-sized dimension: A {:?}, B {:?}",
            key.a_dims,
            key.b_dims
        );
        if key.b_transposed {
            precondition!(
                key.b_dims[3] == ak,
                "matmul reduction mismatch: A has K={}, B^T has K={}",
                ak,
                key.b_dims[3]
            );
        } else {
            precondition!(
                key.b_dims[2] == ak,
                "matmul reduction mismatch: A has K={}, B has K={}",
                ak,
                key.b_dims[2]
            );
        }
        Ok(Self { key })
    }

    pub(crate) fn matches(&self, key: &MatmulKey) -> bool {
        self.key == *key
    }

    /// `scores[b,h] = A[b,h] * B[b,h]^T` in f32, parallel over `(B, H)`.
    ///
    /// `scores` is a contiguous `[B, H, M, N]` buffer.
    pub(crate) fn execute_qk<T: AttnElem>(
        &self,
        a: &ArrayView4<'_, T>,
        b: &ArrayView4<'_, T>,
        scores: &mut [f32],
    ) {
        debug_assert!(self.key.b_transposed);
        let (_, heads, m_len, k_len) = a.dim();
        let n_len = b.dim().2;

        scores
            .par_chunks_mut(m_len * n_len)
            .enumerate()
            .for_each_init(
                || vec![0.0f32; m_len * k_len],
                |a_f32, (bh, chunk)| {
                    let (bi, hi) = (bh / heads, bh % heads);
                    widen_block(&a.slice(s![bi, hi, .., ..]), a_f32);
                    for mi in 0..m_len {
                        let a_row = &a_f32[mi * k_len..][..k_len];
                        let c_row = &mut chunk[mi * n_len..][..n_len];
                        for (ni, c) in c_row.iter_mut().enumerate() {
                            let b_row = b.slice(s![bi, hi, ni, ..]);
                            *c = match b_row.as_slice() {
                                Some(row) => kernels::dot::<T>(a_row, row),
                                None => b_row
                                    .iter()
                                    .zip(a_row.iter())
                                    .map(|(&bv, &av)| av * bv.to_f32())
                                    .sum(),
                            };
                        }
                    }
                },
            );
    }

    /// `out[b,h] = W[b,h] * V[b,h]` in f32, parallel over `(B, H)`.
    ///
    /// `w` is a contiguous `[B, H, M, N]` weight buffer, `out` a contiguous
    /// `[B, H, M, S]` buffer.
    pub(crate) fn execute_wv<T: AttnElem>(
        &self,
        w: &[T],
        v: &ArrayView4<'_, T>,
        out: &mut [f32],
    ) {
        debug_assert!(!self.key.b_transposed);
        let (_, heads, n_len, s_len) = v.dim();
        let m_len = self.key.a_dims[2];

        out.par_chunks_mut(m_len * s_len)
            .enumerate()
            .for_each(|(bh, chunk)| {
                let (bi, hi) = (bh / heads, bh % heads);
                let w_block = &w[bh * m_len * n_len..][..m_len * n_len];
                chunk.fill(0.0);
                for mi in 0..m_len {
                    let acc = &mut chunk[mi * s_len..][..s_len];
                    for ni in 0..n_len {
                        let weight = w_block[mi * n_len + ni].to_f32();
                        if weight == 0.0 {
                            continue;
                        }
                        let v_row = v.slice(s![bi, hi, ni, ..]);
                        match v_row.as_slice() {
                            Some(row) => kernels::axpy::<T>(acc, row, weight),
                            None => {
                                for (a, &x) in acc.iter_mut().zip(v_row.iter()) {
                                    *a += weight * x.to_f32();
                                }
                            }
                        }
                    }
                }
            });
    }
}

/// Structural identity of a packed-panel gemm kernel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct GemmKey {
    pub dtype: ElemType,
    pub m: usize,
    pub n: usize,
    pub k: usize,
    pub lda: usize,
    pub ldb: usize,
    pub ldc: usize,
    pub b_transposed: bool,
}

/// Block-panel gemm with an opaque packed right-hand side.
///
/// The packed layout is N-major rows of length K, produced only by
/// [`PackedGemm::pack_b`]; callers size destination buffers through
/// [`PackedGemm::scratch_b_elems`]. The A tile is widened to f32 through
/// [`PackedGemm::pack_a`] (the `scratch_a` of the kernel). Tail M-tiles are
/// simply executed with `m_cnt` below the block size.
pub(crate) struct PackedGemm {
    key: GemmKey,
    m_block_size: usize,
}

/// Natural query-tile height of the packed kernels.
const M_BLOCK_SIZE: usize = 32;

impl PackedGemm {
    pub(crate) fn new(key: GemmKey) -> Result<Self> {
        if !matches!(key.dtype, ElemType::F32 | ElemType::Bf16) {
            return Err(AttentionError::BackendUnavailable {
                requested: key.dtype,
                detail: "packed-panel gemm supports f32 and bf16 operands".into(),
            });
        }
        precondition!(
            key.m > 0 && key.n > 0 && key.k > 0,
            "packed gemm with empty dims: m={} n={} k={}",
            key.m,
            key.n,
            key.k
        );
        let m_block_size = M_BLOCK_SIZE.min(key.m);
        Ok(Self { key, m_block_size })
    }

    pub(crate) fn m_block_size(&self) -> usize {
        self.m_block_size
    }

    /// Elements needed for one packed B panel.
    pub(crate) fn scratch_b_elems(&self) -> usize {
        self.key.n * self.key.k
    }

    /// Elements needed for the widened A tile of one M block.
    pub(crate) fn scratch_a_elems(&self) -> usize {
        self.m_block_size * self.key.k
    }

    /// Pack `src` into the opaque panel layout.
    ///
    /// With `b_transposed` the source is `[N, K]` and rows are copied; without
    /// it the source is `[K, N]` and the pack transposes.
    pub(crate) fn pack_b<T: AttnElem>(&self, src: &ArrayView2<'_, T>, dst: &mut [T]) {
        let k = self.key.k;
        if self.key.b_transposed {
            for (ni, row) in src.outer_iter().enumerate() {
                let panel_row = &mut dst[ni * k..][..k];
                match row.as_slice() {
                    Some(r) => panel_row.copy_from_slice(r),
                    None => {
                        for (d, &x) in panel_row.iter_mut().zip(row.iter()) {
                            *d = x;
                        }
                    }
                }
            }
        } else {
            for (ni, col) in src.axis_iter(Axis(1)).enumerate() {
                let panel_row = &mut dst[ni * k..][..k];
                for (d, &x) in panel_row.iter_mut().zip(col.iter()) {
                    *d = x;
                }
            }
        }
    }

    /// Widen an A tile (`m_cnt` rows) into the f32 scratch.
    pub(crate) fn pack_a<T: AttnElem>(&self, src: &ArrayView2<'_, T>, dst: &mut [f32]) {
        widen_block(src, dst);
    }

    /// `c[..m_cnt] = a_f32 * packed_b^T` with f32 accumulation.
    ///
    /// `a_f32` holds `m_cnt` contiguous rows of length K (from [`pack_a`]);
    /// `c` rows are addressed through the descriptor's `ldc`.
    ///
    /// [`pack_a`]: PackedGemm::pack_a
    pub(crate) fn execute<T: AttnElem>(
        &self,
        m_cnt: usize,
        a_f32: &[f32],
        packed_b: &[T],
        c: &mut [f32],
    ) {
        debug_assert!(m_cnt <= self.m_block_size);
        let (k, n, ldc) = (self.key.k, self.key.n, self.key.ldc);
        for mi in 0..m_cnt {
            let a_row = &a_f32[mi * k..][..k];
            let c_row = &mut c[mi * ldc..][..n];
            for (ni, cv) in c_row.iter_mut().enumerate() {
                *cv = kernels::dot::<T>(a_row, &packed_b[ni * k..][..k]);
            }
        }
    }
}

/// Thin sgemm-style call: `C = alpha * A * op(B) + beta * C` with f32 A/C
/// and a typed, possibly strided B view.
///
/// `a` holds `m` rows addressed through `lda`; `b` is `[N, K]` when
/// `b_transposed` and `[K, N]` otherwise; `c` rows are addressed through
/// `ldc`.
#[allow(clippy::too_many_arguments)]
pub(crate) fn sgemm<T: AttnElem>(
    b_transposed: bool,
    m: usize,
    n: usize,
    k: usize,
    alpha: f32,
    a: &[f32],
    lda: usize,
    b: &ArrayView2<'_, T>,
    beta: f32,
    c: &mut [f32],
    ldc: usize,
) {
    for mi in 0..m {
        let a_row = &a[mi * lda..][..k];
        let c_row = &mut c[mi * ldc..][..n];
        if beta == 0.0 {
            c_row.fill(0.0);
        } else if beta != 1.0 {
            for v in c_row.iter_mut() {
                *v *= beta;
            }
        }
        if b_transposed {
            for (ni, cv) in c_row.iter_mut().enumerate() {
                let b_row = b.row(ni);
                let d = match b_row.as_slice() {
                    Some(row) => kernels::dot::<T>(a_row, row),
                    None => b_row
                        .iter()
                        .zip(a_row.iter())
                        .map(|(&bv, &av)| av * bv.to_f32())
                        .sum(),
                };
                *cv += alpha * d;
            }
        } else {
            for (ki, &av) in a_row.iter().enumerate() {
                let weight = alpha * av;
                if weight == 0.0 {
                    continue;
                }
                let b_row = b.row(ki);
                match b_row.as_slice() {
                    Some(row) => kernels::axpy::<T>(c_row, row, weight),
                    None => {
                        for (cv, &bv) in c_row.iter_mut().zip(b_row.iter()) {
                            *cv += weight * bv.to_f32();
                        }
                    }
                }
            }
        }
    }
}

/// Widen a `[M, K]` block into a contiguous f32 buffer.
pub(crate) fn widen_block<T: AttnElem>(src: &ArrayView2<'_, T>, dst: &mut [f32]) {
    let k = src.dim().1;
    for (mi, row) in src.outer_iter().enumerate() {
        let dst_row = &mut dst[mi * k..][..k];
        for (d, &x) in dst_row.iter_mut().zip(row.iter()) {
            *d = x.to_f32();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, Array4};

    fn naive_qk(a: &Array4<f32>, b: &Array4<f32>) -> Vec<f32> {
        let (bs, h, m, k) = a.dim();
        let n = b.dim().2;
        let mut out = vec![0.0; bs * h * m * n];
        for bi in 0..bs {
            for hi in 0..h {
                for mi in 0..m {
                    for ni in 0..n {
                        let mut acc = 0.0;
                        for ki in 0..k {
                            acc += a[[bi, hi, mi, ki]] * b[[bi, hi, ni, ki]];
                        }
                        out[((bi * h + hi) * m + mi) * n + ni] = acc;
                    }
                }
            }
        }
        out
    }

    #[test]
    fn test_batched_qk_matches_naive() {
        let a = Array4::from_shape_fn((2, 2, 3, 5), |(b, h, m, k)| {
            (b + 2 * h + 3 * m + k) as f32 * 0.1
        });
        let b = Array4::from_shape_fn((2, 2, 4, 5), |(bi, h, n, k)| {
            (bi + h + n) as f32 * 0.2 - k as f32 * 0.05
        });

        let key = MatmulKey::of(&a.view(), &b.view(), true);
        let prim = MatmulPrim::prepare(key).unwrap();
        let mut scores = vec![0.0f32; 2 * 2 * 3 * 4];
        prim.execute_qk(&a.view(), &b.view(), &mut scores);

        let reference = naive_qk(&a, &b);
        for (x, y) in scores.iter().zip(reference.iter()) {
            assert!((x - y).abs() < 1e-4, "{x} vs {y}");
        }
    }

    #[test]
    fn test_packed_gemm_transposed_matches_naive() {
        let (m, n, k) = (5, 7, 9);
        let a = Array2::from_shape_fn((m, k), |(i, j)| (i * 3 + j) as f32 * 0.1);
        let b = Array2::from_shape_fn((n, k), |(i, j)| (i + j * 2) as f32 * 0.05);

        let gemm = PackedGemm::new(GemmKey {
            dtype: ElemType::F32,
            m,
            n,
            k,
            lda: k,
            ldb: k,
            ldc: n,
            b_transposed: true,
        })
        .unwrap();

        let mut panel = vec![0.0f32; gemm.scratch_b_elems()];
        gemm.pack_b(&b.view(), &mut panel);

        let mut a_f32 = vec![0.0f32; gemm.scratch_a_elems()];
        gemm.pack_a(&a.view(), &mut a_f32);

        let mut c = vec![0.0f32; m * n];
        gemm.execute::<f32>(m, &a_f32, &panel, &mut c);

        for mi in 0..m {
            for ni in 0..n {
                let expect: f32 = (0..k).map(|ki| a[[mi, ki]] * b[[ni, ki]]).sum();
                assert!((c[mi * n + ni] - expect).abs() < 1e-4);
            }
        }
    }

    #[test]
    fn test_packed_gemm_plain_packs_transpose() {
        let (m, n, k) = (2, 3, 4);
        let a = Array2::from_shape_fn((m, k), |(i, j)| (i + j) as f32);
        let b = Array2::from_shape_fn((k, n), |(i, j)| (i * n + j) as f32);

        let gemm = PackedGemm::new(GemmKey {
            dtype: ElemType::F32,
            m,
            n,
            k,
            lda: k,
            ldb: n,
            ldc: n,
            b_transposed: false,
        })
        .unwrap();

        let mut panel = vec![0.0f32; gemm.scratch_b_elems()];
        gemm.pack_b(&b.view(), &mut panel);

        let mut a_f32 = vec![0.0f32; gemm.scratch_a_elems()];
        gemm.pack_a(&a.view(), &mut a_f32);

        let mut c = vec![0.0f32; m * n];
        gemm.execute::<f32>(m, &a_f32, &panel, &mut c);

        for mi in 0..m {
            for ni in 0..n {
                let expect: f32 = (0..k).map(|ki| a[[mi, ki]] * b[[ki, ni]]).sum();
                assert!((c[mi * n + ni] - expect).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_sgemm_both_orientations() {
        let (m, n, k) = (3, 4, 6);
        let a: Vec<f32> = (0..m * k).map(|i| i as f32 * 0.1).collect();
        let b_t = Array2::from_shape_fn((n, k), |(i, j)| (i + j) as f32 * 0.2);
        let b_n = b_t.t().to_owned();

        let mut c1 = vec![0.0f32; m * n];
        let mut c2 = vec![0.0f32; m * n];
        sgemm(true, m, n, k, 1.0, &a, k, &b_t.view(), 0.0, &mut c1, n);
        sgemm(false, m, n, k, 1.0, &a, k, &b_n.view(), 0.0, &mut c2, n);

        for (x, y) in c1.iter().zip(c2.iter()) {
            assert!((x - y).abs() < 1e-4);
        }
    }

    #[test]
    fn test_packed_gemm_rejects_u8() {
        let err = PackedGemm::new(GemmKey {
            dtype: ElemType::U8,
            m: 1,
            n: 1,
            k: 1,
            lda: 1,
            ldb: 1,
            ldc: 1,
            b_transposed: true,
        });
        assert!(matches!(
            err,
            Err(AttentionError::BackendUnavailable { .. })
        ));
    }
}
