//! First-token attention over many query rows.
//!
//! Three strategies share one shape: scores into an f32 scratch, fused
//! mask+softmax per row, weighted-value product into an f32 staging buffer,
//! one vectorized cast into the caller's output. Full-matmul serves standard
//! multi-head, block-panel gemms with packed K/V panels serve grouped-query
//! BF16, and the f32 fallback runs tiled sgemm with per-thread score rows.

use std::sync::Arc;

use log::trace;
use ndarray::{s, ArrayView2, ArrayView4};
use rayon::prelude::*;

use crate::common::error::Result;
use crate::common::params::ParamsCache;
use crate::kernels::softmax::{attn_softmax, attn_softmax_inplace};
use crate::ops::matmul::{sgemm, widen_block, GemmKey, MatmulKey, MatmulPrim, PackedGemm};
use crate::tensor::{AttnElem, TensorViewMut4};

use super::{KernelStrategy, MaskSet};

/// Query-tile height of the f32 sgemm fallback.
const SGEMM_M_BLOCK: usize = 4;

pub(crate) struct PrefillArgs<'a, 'm, T: AttnElem> {
    pub query: ArrayView4<'a, T>,
    pub key: ArrayView4<'a, T>,
    pub value: ArrayView4<'a, T>,
    pub masks: &'m MaskSet<'a, 'm>,
    pub d_scale: f32,
    pub auto_causal: bool,
    pub has_out_transpose: bool,
}

pub(crate) struct MhaPrefill<T: AttnElem> {
    gemm_cache: Arc<ParamsCache<GemmKey, PackedGemm>>,
    qk_prim: Option<MatmulPrim>,
    wv_prim: Option<MatmulPrim>,
    score_buf: Vec<f32>,
    weight_buf: Vec<T>,
    fp32_out: Vec<f32>,
    qk_scratch_b: Vec<T>,
    wv_scratch_b: Vec<T>,
}

impl<T: AttnElem> MhaPrefill<T> {
    pub(crate) fn new(gemm_cache: Arc<ParamsCache<GemmKey, PackedGemm>>) -> Self {
        Self {
            gemm_cache,
            qk_prim: None,
            wv_prim: None,
            score_buf: Vec::new(),
            weight_buf: Vec::new(),
            fp32_out: Vec::new(),
            qk_scratch_b: Vec::new(),
            wv_scratch_b: Vec::new(),
        }
    }

    pub(crate) fn execute(
        &mut self,
        strategy: KernelStrategy,
        args: &PrefillArgs<'_, '_, T>,
        out: &mut TensorViewMut4<'_>,
    ) -> Result<()> {
        match strategy {
            KernelStrategy::FullMatmul => self.run_full_matmul(args, out),
            KernelStrategy::BlockPanel => self.run_block_panel(args, out),
            KernelStrategy::Sgemm => self.run_sgemm(args, out),
            KernelStrategy::Incremental => {
                unreachable!("incremental calls never reach the prefill kernel")
            }
        }
    }

    /// Standard multi-head path: one batched Q*K^T, per-row softmax into the
    /// typed weight buffer, one batched W*V.
    fn run_full_matmul(
        &mut self,
        args: &PrefillArgs<'_, '_, T>,
        out: &mut TensorViewMut4<'_>,
    ) -> Result<()> {
        let (b, h, q_len, s_dim) = args.query.dim();
        let kv_len = args.key.dim().2;

        let qk_key = MatmulKey::of(&args.query, &args.key, true);
        if !self.qk_prim.as_ref().is_some_and(|p| p.matches(&qk_key)) {
            trace!("prefill qk matmul prepared for A {:?}", qk_key.a_dims);
            self.qk_prim = Some(MatmulPrim::prepare(qk_key)?);
        }

        self.score_buf.resize(b * h * q_len * kv_len, 0.0);
        self.weight_buf.resize(b * h * q_len * kv_len, T::from_f32(0.0));
        self.fp32_out.resize(b * h * q_len * s_dim, 0.0);

        self.qk_prim
            .as_ref()
            .expect("prepared above")
            .execute_qk(&args.query, &args.key, &mut self.score_buf);

        softmax_stage(
            &mut self.score_buf,
            &mut self.weight_buf,
            args,
            h,
            q_len,
            kv_len,
        );

        let w_view =
            ArrayView4::from_shape((b, h, q_len, kv_len), &self.weight_buf[..b * h * q_len * kv_len])
                .expect("weight buffer matches score shape");
        let wv_key = MatmulKey::of(&w_view, &args.value, false);
        if !self.wv_prim.as_ref().is_some_and(|p| p.matches(&wv_key)) {
            trace!("prefill wv matmul prepared for A {:?}", wv_key.a_dims);
            self.wv_prim = Some(MatmulPrim::prepare(wv_key)?);
        }
        self.wv_prim
            .as_ref()
            .expect("prepared above")
            .execute_wv(&self.weight_buf, &args.value, &mut self.fp32_out);

        cast_output(
            &self.fp32_out,
            (b, h, q_len, s_dim),
            args.has_out_transpose,
            out,
        );
        Ok(())
    }

    /// Grouped-query BF16 path: pack K/V panels once per `(B, H_kv)`, then
    /// tile the query axis and run packed gemms per tile.
    fn run_block_panel(
        &mut self,
        args: &PrefillArgs<'_, '_, T>,
        out: &mut TensorViewMut4<'_>,
    ) -> Result<()> {
        let (b, h, q_len, s_dim) = args.query.dim();
        let (_, hk, kv_len, _) = args.key.dim();
        let h_group = h / hk;

        let qk_key = GemmKey {
            dtype: T::DTYPE,
            m: q_len,
            n: kv_len,
            k: s_dim,
            lda: args.query.strides()[2].unsigned_abs(),
            ldb: args.key.strides()[2].unsigned_abs(),
            ldc: kv_len,
            b_transposed: true,
        };
        let qk_gemm = self
            .gemm_cache
            .get_or_create(&qk_key, || PackedGemm::new(qk_key.clone()))?;
        let wv_key = GemmKey {
            dtype: T::DTYPE,
            m: q_len,
            n: s_dim,
            k: kv_len,
            lda: kv_len,
            ldb: args.value.strides()[2].unsigned_abs(),
            ldc: s_dim,
            b_transposed: false,
        };
        let wv_gemm = self
            .gemm_cache
            .get_or_create(&wv_key, || PackedGemm::new(wv_key.clone()))?;

        self.score_buf.resize(b * h * q_len * kv_len, 0.0);
        self.weight_buf.resize(b * h * q_len * kv_len, T::from_f32(0.0));
        self.fp32_out.resize(b * h * q_len * s_dim, 0.0);
        let qk_panel = qk_gemm.scratch_b_elems();
        let wv_panel = wv_gemm.scratch_b_elems();
        self.qk_scratch_b.resize(b * hk * qk_panel, T::from_f32(0.0));
        self.wv_scratch_b.resize(b * hk * wv_panel, T::from_f32(0.0));

        // Pack K and V once per (batch, kv-head); every query head of the
        // group reads the same panels.
        let key = &args.key;
        let value = &args.value;
        self.qk_scratch_b
            .par_chunks_mut(qk_panel)
            .zip(self.wv_scratch_b.par_chunks_mut(wv_panel))
            .enumerate()
            .for_each(|(bh, (k_dst, v_dst))| {
                let (bi, hki) = (bh / hk, bh % hk);
                qk_gemm.pack_b(&key.slice(s![bi, hki, .., ..]), k_dst);
                wv_gemm.pack_b(&value.slice(s![bi, hki, .., ..]), v_dst);
            });

        let m_block = qk_gemm.m_block_size();
        let scratch_a = qk_gemm.scratch_a_elems().max(wv_gemm.scratch_a_elems());
        let qk_panels: &[T] = &self.qk_scratch_b;
        let wv_panels: &[T] = &self.wv_scratch_b;
        let query = &args.query;

        self.score_buf
            .par_chunks_mut(q_len * kv_len)
            .zip(self.weight_buf.par_chunks_mut(q_len * kv_len))
            .zip(self.fp32_out.par_chunks_mut(q_len * s_dim))
            .enumerate()
            .for_each(|(bh, ((s_chunk, w_chunk), o_chunk))| {
                let (bi, hi) = (bh / h, bh % h);
                let hki = hi / h_group;
                let k_panel = &qk_panels[(bi * hk + hki) * qk_panel..][..qk_panel];
                let v_panel = &wv_panels[(bi * hk + hki) * wv_panel..][..wv_panel];

                s_chunk
                    .par_chunks_mut(m_block * kv_len)
                    .zip(w_chunk.par_chunks_mut(m_block * kv_len))
                    .zip(o_chunk.par_chunks_mut(m_block * s_dim))
                    .enumerate()
                    .for_each_init(
                        || vec![0.0f32; scratch_a],
                        |a_f32, (m_blk, ((st, wt), ot))| {
                            let m_start = m_blk * m_block;
                            let m_cnt = m_block.min(q_len - m_start);

                            qk_gemm.pack_a(
                                &query.slice(s![bi, hi, m_start..m_start + m_cnt, ..]),
                                a_f32,
                            );
                            qk_gemm.execute::<T>(m_cnt, a_f32, k_panel, st);

                            for mi in 0..m_cnt {
                                let m = m_start + mi;
                                let ncausal = if args.auto_causal {
                                    kv_len - q_len + m + 1
                                } else {
                                    kv_len
                                };
                                attn_softmax(
                                    &mut st[mi * kv_len..][..kv_len],
                                    &mut wt[mi * kv_len..][..kv_len],
                                    args.d_scale,
                                    args.masks.alibi_row(bi, hi, m),
                                    args.masks.attn_row(bi, hi, m),
                                    args.masks.causal_row(bi, hi, m),
                                    args.masks.select_nfltmax_at_0,
                                    ncausal,
                                );
                            }

                            let w_tile =
                                ArrayView2::from_shape((m_cnt, kv_len), &wt[..m_cnt * kv_len])
                                    .expect("weight tile is contiguous");
                            wv_gemm.pack_a(&w_tile, a_f32);
                            wv_gemm.execute::<T>(m_cnt, a_f32, v_panel, ot);
                        },
                    );
            });

        cast_output(
            &self.fp32_out,
            (b, h, q_len, s_dim),
            args.has_out_transpose,
            out,
        );
        Ok(())
    }

    /// FP32 fallback: tiled sgemm with a per-thread, cache-line padded score
    /// block.
    fn run_sgemm(&mut self, args: &PrefillArgs<'_, '_, T>, out: &mut TensorViewMut4<'_>) -> Result<()> {
        let (b, h, q_len, s_dim) = args.query.dim();
        let (_, hk, kv_len, _) = args.key.dim();
        let h_group = h / hk;
        let kv_pad = (kv_len * 4).div_ceil(64) * 64 / 4;

        self.fp32_out.resize(b * h * q_len * s_dim, 0.0);
        let query = &args.query;
        let key = &args.key;
        let value = &args.value;

        self.fp32_out
            .par_chunks_mut(q_len * s_dim)
            .enumerate()
            .for_each(|(bh, o_chunk)| {
                let (bi, hi) = (bh / h, bh % h);
                let hki = hi / h_group;
                let k_block = key.slice(s![bi, hki, .., ..]);
                let v_block = value.slice(s![bi, hki, .., ..]);

                o_chunk
                    .par_chunks_mut(SGEMM_M_BLOCK * s_dim)
                    .enumerate()
                    .for_each_init(
                        || {
                            (
                                vec![0.0f32; SGEMM_M_BLOCK * kv_pad],
                                vec![0.0f32; SGEMM_M_BLOCK * s_dim],
                            )
                        },
                        |(qk_buf, a_buf), (m_blk, ot)| {
                            let m_start = m_blk * SGEMM_M_BLOCK;
                            let m_cnt = SGEMM_M_BLOCK.min(q_len - m_start);

                            widen_block(
                                &query.slice(s![bi, hi, m_start..m_start + m_cnt, ..]),
                                a_buf,
                            );
                            sgemm(
                                true, m_cnt, kv_len, s_dim, 1.0, a_buf, s_dim, &k_block, 0.0,
                                qk_buf, kv_pad,
                            );

                            for mi in 0..m_cnt {
                                let m = m_start + mi;
                                let ncausal = if args.auto_causal {
                                    kv_len - q_len + m + 1
                                } else {
                                    kv_len
                                };
                                attn_softmax_inplace(
                                    &mut qk_buf[mi * kv_pad..][..kv_len],
                                    args.d_scale,
                                    args.masks.alibi_row(bi, hi, m),
                                    args.masks.attn_row(bi, hi, m),
                                    args.masks.causal_row(bi, hi, m),
                                    args.masks.select_nfltmax_at_0,
                                    ncausal,
                                );
                            }

                            sgemm(
                                false, m_cnt, s_dim, kv_len, 1.0, qk_buf, kv_pad, &v_block, 0.0,
                                ot, s_dim,
                            );
                        },
                    );
            });

        cast_output(
            &self.fp32_out,
            (b, h, q_len, s_dim),
            args.has_out_transpose,
            out,
        );
        Ok(())
    }
}

/// Mask + softmax over every `(b, h, m)` score row, down-casting into the
/// typed weight buffer.
fn softmax_stage<T: AttnElem>(
    score: &mut [f32],
    weight: &mut [T],
    args: &PrefillArgs<'_, '_, T>,
    h: usize,
    q_len: usize,
    kv_len: usize,
) {
    score
        .par_chunks_mut(kv_len)
        .zip(weight.par_chunks_mut(kv_len))
        .enumerate()
        .for_each(|(idx, (s_row, w_row))| {
            let m = idx % q_len;
            let hi = (idx / q_len) % h;
            let bi = idx / (q_len * h);
            let ncausal = if args.auto_causal {
                kv_len - q_len + m + 1
            } else {
                kv_len
            };
            attn_softmax(
                s_row,
                w_row,
                args.d_scale,
                args.masks.alibi_row(bi, hi, m),
                args.masks.attn_row(bi, hi, m),
                args.masks.causal_row(bi, hi, m),
                args.masks.select_nfltmax_at_0,
                ncausal,
            );
        });
}

/// Cast the f32 staging buffer into the caller's output view, permuting to
/// `[B, q_len, H, S]` when the transposed layout was requested.
fn cast_output(
    fp32: &[f32],
    dims: (usize, usize, usize, usize),
    has_out_transpose: bool,
    out: &mut TensorViewMut4<'_>,
) {
    let (b, h, q_len, s_dim) = dims;
    let staged = ArrayView4::from_shape((b, h, q_len, s_dim), &fp32[..b * h * q_len * s_dim])
        .expect("staging buffer matches output shape");
    let staged = if has_out_transpose {
        staged.permuted_axes([0, 2, 1, 3])
    } else {
        staged
    };
    out.assign_from_f32(staged);
}
