//! Second-token attention: dot-product accumulator over a growing history.
//!
//! Block gemms are wasted at M = 1; a per-head dot product with f32
//! intermediates is faster, skips the repack bf16/int8 would need, and
//! adapts naturally to indirect KV reads through the beam table.

use half::{bf16, f16};
use ndarray::{s, ArrayView2, ArrayView4};
use rayon::prelude::*;

use crate::cache::{CacheView, KvCacheState};
use crate::common::error::{precondition, Result};
use crate::kernels::{self, scalar, softmax::attn_softmax_inplace};
use crate::tensor::{AttnElem, TensorViewMut4};

use super::MaskSet;

/// Where the incremental kernel reads K/V from.
pub(crate) enum KvSource<'a, T: AttnElem> {
    /// Caller-provided tensors, no indirection.
    Direct {
        key: ArrayView4<'a, T>,
        value: ArrayView4<'a, T>,
    },
    /// The fused KV-cache: any cache precision, reads routed through the
    /// beam table.
    Cached(&'a KvCacheState),
}

impl<'a, T: AttnElem> KvSource<'a, T> {
    pub(crate) fn kv_len(&self) -> usize {
        match self {
            KvSource::Direct { key, .. } => key.dim().2,
            KvSource::Cached(cache) => cache.len(),
        }
    }

    pub(crate) fn kv_heads(&self) -> usize {
        match self {
            KvSource::Direct { key, .. } => key.dim().1,
            KvSource::Cached(cache) => cache.kv_heads(),
        }
    }
}

/// One half (K or V) resolved to its storage for the hot loop.
enum HalfView<'a, T: AttnElem> {
    Input(ArrayView4<'a, T>),
    CacheF32(ArrayView4<'a, f32>),
    CacheF16(ArrayView4<'a, f16>),
    CacheBf16(ArrayView4<'a, bf16>),
    CacheU8 {
        data: ArrayView4<'a, u8>,
        scale_zp: ArrayView4<'a, f32>,
    },
}

impl<'a, T: AttnElem> HalfView<'a, T> {
    fn from_cache(view: CacheView<'a>) -> Self {
        match view {
            CacheView::F32(v) => HalfView::CacheF32(v),
            CacheView::F16(v) => HalfView::CacheF16(v),
            CacheView::Bf16(v) => HalfView::CacheBf16(v),
            CacheView::U8 { data, scale_zp } => HalfView::CacheU8 { data, scale_zp },
        }
    }

    /// `dot(q, row(bt, hk, t))`, dequantizing u8 rows through
    /// `scale * (dot_q - zp * q_sum)`.
    fn score(&self, q: &[f32], q_sum: f32, bt: usize, hk: usize, t: usize) -> f32 {
        match self {
            HalfView::Input(k) => {
                let row = k.slice(s![bt, hk, t, ..]);
                match row.to_slice() {
                    Some(r) => kernels::dot::<T>(q, r),
                    None => row
                        .iter()
                        .zip(q.iter())
                        .map(|(&kv, &qv)| qv * kv.to_f32())
                        .sum(),
                }
            }
            HalfView::CacheF32(k) => {
                let row = k.slice(s![bt, hk, t, ..]);
                kernels::dot_f32(q, row.to_slice().expect("cache rows are contiguous"))
            }
            HalfView::CacheF16(k) => {
                let row = k.slice(s![bt, hk, t, ..]);
                kernels::dot::<f16>(q, row.to_slice().expect("cache rows are contiguous"))
            }
            HalfView::CacheBf16(k) => {
                let row = k.slice(s![bt, hk, t, ..]);
                kernels::dot::<bf16>(q, row.to_slice().expect("cache rows are contiguous"))
            }
            HalfView::CacheU8 { data, scale_zp } => {
                let row = data.slice(s![bt, hk, t, ..]);
                let scale = scale_zp[[bt, hk, t, 0]];
                let zp = scale_zp[[bt, hk, t, 1]];
                let raw =
                    scalar::dot_u8(q, row.to_slice().expect("cache rows are contiguous"));
                scale * (raw - zp * q_sum)
            }
        }
    }

    /// `acc += w * row(bt, hk, t)` with the same indirection and dequant.
    fn accumulate(&self, acc: &mut [f32], w: f32, bt: usize, hk: usize, t: usize) {
        match self {
            HalfView::Input(v) => {
                let row = v.slice(s![bt, hk, t, ..]);
                match row.to_slice() {
                    Some(r) => kernels::axpy::<T>(acc, r, w),
                    None => {
                        for (a, &x) in acc.iter_mut().zip(row.iter()) {
                            *a += w * x.to_f32();
                        }
                    }
                }
            }
            HalfView::CacheF32(v) => {
                let row = v.slice(s![bt, hk, t, ..]);
                kernels::axpy_f32(acc, row.to_slice().expect("cache rows are contiguous"), w);
            }
            HalfView::CacheF16(v) => {
                let row = v.slice(s![bt, hk, t, ..]);
                kernels::axpy::<f16>(acc, row.to_slice().expect("cache rows are contiguous"), w);
            }
            HalfView::CacheBf16(v) => {
                let row = v.slice(s![bt, hk, t, ..]);
                kernels::axpy::<bf16>(acc, row.to_slice().expect("cache rows are contiguous"), w);
            }
            HalfView::CacheU8 { data, scale_zp } => {
                let row = data.slice(s![bt, hk, t, ..]);
                let scale = scale_zp[[bt, hk, t, 0]];
                let zp = scale_zp[[bt, hk, t, 1]];
                scalar::axpy_u8(
                    acc,
                    row.to_slice().expect("cache rows are contiguous"),
                    w * scale,
                    w * scale * zp,
                );
            }
        }
    }
}

/// Incremental attention kernel, parallel over `(B, H_q)`.
pub(crate) struct MhaSingleToken {
    attn_w: Vec<f32>,
    out_f32: Vec<f32>,
}

impl MhaSingleToken {
    pub(crate) fn new() -> Self {
        Self {
            attn_w: Vec::new(),
            out_f32: Vec::new(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn execute<T: AttnElem>(
        &mut self,
        query: &ArrayView4<'_, T>,
        kv: &KvSource<'_, T>,
        masks: &MaskSet<'_, '_>,
        d_scale: f32,
        auto_causal: bool,
        has_out_transpose: bool,
        out: &mut TensorViewMut4<'_>,
    ) -> Result<()> {
        let (b, h, q_len, s) = query.dim();
        let kv_len = kv.kv_len();
        let hk = kv.kv_heads();
        precondition!(
            kv_len >= q_len,
            "kv_len {kv_len} shorter than q_len {q_len}"
        );
        let h_group = h / hk;

        self.attn_w.resize(b * h * q_len * kv_len, 0.0);
        self.out_f32.resize(b * h * q_len * s, 0.0);

        let beam: Option<ArrayView2<'_, i32>> = match kv {
            KvSource::Cached(cache) => Some(cache.beam_table()),
            KvSource::Direct { .. } => None,
        };
        let (k_half, v_half) = match kv {
            KvSource::Direct { key, value } => (
                HalfView::Input(key.clone()),
                HalfView::Input(value.clone()),
            ),
            KvSource::Cached(cache) => (
                HalfView::<T>::from_cache(cache.past_k().expect("cache populated by append")),
                HalfView::<T>::from_cache(cache.past_v().expect("cache populated by append")),
            ),
        };

        self.attn_w
            .par_chunks_mut(q_len * kv_len)
            .zip(self.out_f32.par_chunks_mut(q_len * s))
            .enumerate()
            .for_each_init(
                || vec![0.0f32; s],
                |q_f32, (bh, (w_chunk, o_chunk))| {
                    let (bi, hi) = (bh / h, bh % h);
                    let hki = hi / h_group;
                    for m in 0..q_len {
                        let q_row = query.slice(s![bi, hi, m, ..]);
                        match q_row.to_slice() {
                            Some(r) => kernels::to_f32_row(r, q_f32),
                            None => {
                                for (d, &x) in q_f32.iter_mut().zip(q_row.iter()) {
                                    *d = x.to_f32();
                                }
                            }
                        }
                        // Running query sum corrects the zero-point term of
                        // u8 rows without touching history twice.
                        let q_sum: f32 = q_f32.iter().sum();

                        let ncausal = if auto_causal {
                            kv_len - q_len + m + 1
                        } else {
                            kv_len
                        };
                        let w_row = &mut w_chunk[m * kv_len..][..kv_len];
                        for (t, w) in w_row[..ncausal].iter_mut().enumerate() {
                            let bt = beam
                                .as_ref()
                                .map(|bm| bm[[bi, t]] as usize)
                                .unwrap_or(bi);
                            *w = k_half.score(q_f32, q_sum, bt, hki, t);
                        }

                        attn_softmax_inplace(
                            w_row,
                            d_scale,
                            masks.alibi_row(bi, hi, m),
                            masks.attn_row(bi, hi, m),
                            masks.causal_row(bi, hi, m),
                            masks.select_nfltmax_at_0,
                            ncausal,
                        );

                        let acc = &mut o_chunk[m * s..][..s];
                        acc.fill(0.0);
                        for (t, &w) in w_row[..ncausal].iter().enumerate() {
                            if w == 0.0 {
                                continue;
                            }
                            let bt = beam
                                .as_ref()
                                .map(|bm| bm[[bi, t]] as usize)
                                .unwrap_or(bi);
                            v_half.accumulate(acc, w, bt, hki, t);
                        }
                    }
                },
            );

        let staged = ArrayView4::from_shape((b, h, q_len, s), &self.out_f32[..b * h * q_len * s])
            .expect("staging buffer matches output shape");
        let staged = if has_out_transpose {
            staged.permuted_axes([0, 2, 1, 3])
        } else {
            staged
        };
        out.assign_from_f32(staged);
        Ok(())
    }
}
