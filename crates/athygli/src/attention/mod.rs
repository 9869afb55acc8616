//! Scaled dot-product attention: configuration, dispatch, and the public
//! compute entry point.
//!
//! The dispatcher owns per-call orchestration: axis permutation, mask
//! preparation, fused KV-cache absorption, and kernel selection by runtime
//! shape and precision.

mod prefill;
mod single_token;

use half::bf16;
use log::debug;
use ndarray::{s, Array4, ArrayView1, ArrayView4, Zip};

use crate::cache::KvCacheState;
use crate::common::error::{precondition, AttentionError, Result};
use crate::common::params::ParamsCache;
use crate::kernels;
use crate::tensor::{ComputeElem, ElemType, TensorView4, TensorViewMut4};

use prefill::{MhaPrefill, PrefillArgs};
use single_token::{KvSource, MhaSingleToken};
use std::sync::Arc;

/// Closed set of execution strategies the dispatcher chooses from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelStrategy {
    /// Batched matmul pair for standard multi-head prefill.
    FullMatmul,
    /// Packed-panel gemms for grouped-query BF16 prefill.
    BlockPanel,
    /// Tiled f32 sgemm prefill.
    Sgemm,
    /// Dot-product accumulator for `q_len == 1` or fused decode.
    Incremental,
}

/// Engine configuration, fixed at construction.
#[derive(Debug, Clone)]
pub struct SdpaConfig {
    /// Emit `[B, q_len, H, S]` instead of `[B, H, q_len, S]`.
    pub output_blhxs: bool,
    /// The supplied attention mask doubles as the causal mask.
    pub fuse_causal_attn: bool,
    /// Implicit causal masking, no mask input.
    pub is_causal: bool,
    /// Append the current step to the KV-cache before attending.
    pub fuse_concat: bool,
    /// Logical-to-canonical axis permutation: canonical axis `i` reads input
    /// axis `permute_axes[i]`. Applied by stride permutation, never by copy.
    pub permute_axes: Option<[usize; 4]>,
    /// Storage precision of the fused KV-cache.
    pub kv_cache_precision: ElemType,
}

impl Default for SdpaConfig {
    fn default() -> Self {
        Self {
            output_blhxs: false,
            fuse_causal_attn: false,
            is_causal: false,
            fuse_concat: false,
            permute_axes: None,
            kv_cache_precision: ElemType::F32,
        }
    }
}

/// Attention mask input, interpreted per the engine contract.
pub enum AttnMask<'a> {
    /// Additive float mask broadcastable over `[B, H, q_len, kv_len]`.
    Additive(TensorView4<'a>),
    /// Boolean byte mask; non-zero admits the position, zero masks it.
    Boolean(ArrayView4<'a, u8>),
}

/// Inputs of one compute call, in canonical `[B, H, L, S]` order (before any
/// configured permutation).
pub struct AttentionInputs<'a> {
    pub query: TensorView4<'a>,
    pub key: TensorView4<'a>,
    pub value: TensorView4<'a>,
    pub attn_mask: Option<AttnMask<'a>>,
    /// Additive position-dependent bias, broadcastable like the mask.
    pub alibi: Option<ArrayView4<'a, f32>>,
    /// Score scale; `1/sqrt(S)` when omitted.
    pub scale: Option<f32>,
    /// Beam-lane selection for fused cache appends.
    pub beam_idx: Option<ArrayView1<'a, i32>>,
}

impl<'a> AttentionInputs<'a> {
    pub fn new(query: TensorView4<'a>, key: TensorView4<'a>, value: TensorView4<'a>) -> Self {
        Self {
            query,
            key,
            value,
            attn_mask: None,
            alibi: None,
            scale: None,
            beam_idx: None,
        }
    }
}

/// Per-row mask views resolved for the kernels.
pub(crate) struct MaskSet<'a, 'b> {
    pub(crate) alibi: Option<ArrayView4<'a, f32>>,
    pub(crate) attn: Option<ArrayView4<'b, f32>>,
    pub(crate) causal: Option<ArrayView4<'b, u8>>,
    pub(crate) select_nfltmax_at_0: bool,
}

impl<'a, 'b> MaskSet<'a, 'b> {
    pub(crate) fn alibi_row(&self, b: usize, h: usize, m: usize) -> Option<&'a [f32]> {
        self.alibi.as_ref().map(|v| broadcast_row(v, b, h, m))
    }

    pub(crate) fn attn_row(&self, b: usize, h: usize, m: usize) -> Option<&'b [f32]> {
        self.attn.as_ref().map(|v| broadcast_row(v, b, h, m))
    }

    pub(crate) fn causal_row(&self, b: usize, h: usize, m: usize) -> Option<&'b [u8]> {
        self.causal.as_ref().map(|v| broadcast_row(v, b, h, m))
    }
}

/// Fetch row `[b, h, m, ..]` honoring extent-1 broadcast axes.
fn broadcast_row<'a, E>(view: &ArrayView4<'a, E>, b: usize, h: usize, m: usize) -> &'a [E] {
    let (db, dh, dm, _) = view.dim();
    let row = view.clone().slice_move(s![
        if db == 1 { 0 } else { b },
        if dh == 1 { 0 } else { h },
        if dm == 1 { 0 } else { m },
        ..
    ]);
    row.to_slice().expect("mask rows are contiguous")
}

/// The attention engine for one layer; holds kernels, their scratch, and the
/// packed-kernel cache for the lifetime of the model instance.
pub struct Sdpa {
    config: SdpaConfig,
    executor: ExecutorImpl,
}

enum ExecutorImpl {
    F32(AttentionExecutor<f32>),
    Bf16(AttentionExecutor<bf16>),
}

impl Sdpa {
    /// Build an engine for the given runtime precision.
    pub fn new(precision: ElemType, config: SdpaConfig) -> Result<Self> {
        if let Some(order) = config.permute_axes {
            let mut seen = [false; 4];
            for &axis in &order {
                precondition!(axis < 4, "permute_axes entry {axis} out of range");
                seen[axis] = true;
            }
            precondition!(
                seen.iter().all(|&s| s),
                "permute_axes {order:?} is not a permutation"
            );
        }

        let executor = match precision {
            ElemType::F32 => ExecutorImpl::F32(AttentionExecutor::new()),
            ElemType::Bf16 => {
                precondition!(
                    kernels::bf16_supported(),
                    "bf16 attention requested on a CPU without bf16 kernel support"
                );
                ExecutorImpl::Bf16(AttentionExecutor::new())
            }
            other => {
                return Err(AttentionError::Precondition(format!(
                    "unsupported runtime precision {other:?} (expected F32 or Bf16)"
                )))
            }
        };
        Ok(Self { config, executor })
    }

    pub fn config(&self) -> &SdpaConfig {
        &self.config
    }

    /// Install an explicit boolean causal mask with its polarity bit: with
    /// `select_nfltmax_at_0` a zero byte masks the position, otherwise a
    /// non-zero byte does.
    pub fn set_causal_mask(&mut self, mask: Array4<u8>, select_nfltmax_at_0: bool) {
        match &mut self.executor {
            ExecutorImpl::F32(e) => e.set_causal_mask(mask, select_nfltmax_at_0),
            ExecutorImpl::Bf16(e) => e.set_causal_mask(mask, select_nfltmax_at_0),
        }
    }

    /// Run one attention call.
    ///
    /// `cache` must be supplied when the engine was configured with
    /// `fuse_concat`; the current step is appended (honoring `beam_idx`)
    /// before the kernels read it.
    pub fn execute<'a>(
        &mut self,
        inputs: &AttentionInputs<'a>,
        cache: Option<&'a mut KvCacheState>,
        output: &mut TensorViewMut4<'_>,
    ) -> Result<()> {
        match &mut self.executor {
            ExecutorImpl::F32(e) => e.execute(&self.config, inputs, cache, output),
            ExecutorImpl::Bf16(e) => e.execute(&self.config, inputs, cache, output),
        }
    }
}

/// Typed executor: one per runtime precision.
struct AttentionExecutor<T: ComputeElem> {
    prefill: MhaPrefill<T>,
    single_token: MhaSingleToken,
    mask_scratch: Vec<f32>,
    causal_mask: Option<Array4<u8>>,
    select_nfltmax_at_0: bool,
}

impl<T: ComputeElem> AttentionExecutor<T> {
    fn new() -> Self {
        let gemm_cache = Arc::new(ParamsCache::new());
        Self {
            prefill: MhaPrefill::new(gemm_cache),
            single_token: MhaSingleToken::new(),
            mask_scratch: Vec::new(),
            causal_mask: None,
            select_nfltmax_at_0: false,
        }
    }

    fn set_causal_mask(&mut self, mask: Array4<u8>, select_nfltmax_at_0: bool) {
        self.causal_mask = Some(mask);
        self.select_nfltmax_at_0 = select_nfltmax_at_0;
    }

    fn execute<'a>(
        &mut self,
        config: &SdpaConfig,
        inputs: &AttentionInputs<'a>,
        cache: Option<&'a mut KvCacheState>,
        output: &mut TensorViewMut4<'_>,
    ) -> Result<()> {
        let mut q = T::from_view(&inputs.query).ok_or_else(|| {
            AttentionError::Precondition(format!(
                "query precision {:?} does not match engine precision {:?}",
                inputs.query.elem_type(),
                T::DTYPE
            ))
        })?;
        let mut k = T::from_view(&inputs.key).ok_or_else(|| {
            AttentionError::Precondition("key precision does not match engine precision".into())
        })?;
        let mut v = T::from_view(&inputs.value).ok_or_else(|| {
            AttentionError::Precondition("value precision does not match engine precision".into())
        })?;
        precondition!(
            output.elem_type() == T::DTYPE,
            "output precision {:?} does not match engine precision {:?}",
            output.elem_type(),
            T::DTYPE
        );

        if let Some(order) = config.permute_axes {
            q = q.permuted_axes(order);
            k = k.permuted_axes(order);
            v = v.permuted_axes(order);
        }

        let (b, h, q_len, s_dim) = q.dim();
        let (bk, hk, kv_cur, sk) = k.dim();
        precondition!(
            v.dim() == k.dim(),
            "key {:?} and value {:?} shapes differ",
            k.dim(),
            v.dim()
        );
        precondition!(bk == b, "query batch {b} does not match key batch {bk}");
        precondition!(sk == s_dim, "query head size {s_dim} does not match key head size {sk}");
        precondition!(
            hk > 0 && h % hk == 0,
            "query heads {h} must be a multiple of kv heads {hk}"
        );

        if q_len == 0 {
            return Ok(());
        }

        // Fused concat: absorb the current step before attending.
        let cache_ref: Option<&KvCacheState> = if config.fuse_concat {
            let state = cache.ok_or_else(|| {
                AttentionError::Precondition("fuse_concat requires a KV-cache state".into())
            })?;
            precondition!(
                state.precision() == config.kv_cache_precision,
                "cache precision {:?} does not match configured {:?}",
                state.precision(),
                config.kv_cache_precision
            );
            state.append(
                &T::as_view(k.clone()),
                &T::as_view(v.clone()),
                inputs.beam_idx.as_ref(),
            )?;
            Some(&*state)
        } else {
            None
        };

        let (kv_len, l0) = match cache_ref {
            Some(state) => (state.len(), state.len() - kv_cur),
            None => (kv_cur, kv_cur.saturating_sub(q_len)),
        };

        let (auto_causal, use_attn_mask) = if config.fuse_causal_attn {
            precondition!(
                inputs.attn_mask.is_some(),
                "fuse_causal_attn requires an attention mask"
            );
            (true, true)
        } else if config.is_causal {
            (true, false)
        } else {
            (false, inputs.attn_mask.is_some())
        };
        if auto_causal {
            precondition!(
                kv_len >= q_len,
                "causal attention needs kv_len {kv_len} >= q_len {q_len}"
            );
        }

        // Boolean and non-f32 additive masks are materialized into a
        // persistent f32 scratch; f32 masks are borrowed as-is.
        let mut mask_store: Option<Array4<f32>> = None;
        let mut mask_borrow: Option<ArrayView4<'_, f32>> = None;
        if use_attn_mask {
            match inputs.attn_mask.as_ref().expect("checked above") {
                AttnMask::Additive(TensorView4::F32(view)) => {
                    validate_mask_dims(view.dim(), view.strides(), b, h, q_len, kv_len, "mask")?;
                    mask_borrow = Some(view.clone());
                }
                AttnMask::Additive(TensorView4::Bf16(view)) => {
                    validate_mask_dims(view.dim(), view.strides(), b, h, q_len, kv_len, "mask")?;
                    let mut buf = std::mem::take(&mut self.mask_scratch);
                    buf.resize(view.len(), 0.0);
                    let mut arr = Array4::from_shape_vec(view.raw_dim(), buf)
                        .expect("scratch sized to the mask");
                    Zip::from(&mut arr).and(view).for_each(|d, &x| *d = x.to_f32());
                    mask_store = Some(arr);
                }
                AttnMask::Boolean(view) => {
                    validate_mask_dims(view.dim(), view.strides(), b, h, q_len, kv_len, "mask")?;
                    let mut buf = std::mem::take(&mut self.mask_scratch);
                    buf.resize(view.len(), 0.0);
                    let mut arr = Array4::from_shape_vec(view.raw_dim(), buf)
                        .expect("scratch sized to the mask");
                    Zip::from(&mut arr).and(view).for_each(|d, &x| {
                        *d = if x != 0 { 0.0 } else { f32::NEG_INFINITY }
                    });
                    mask_store = Some(arr);
                }
            }
        }
        if let Some(alibi) = &inputs.alibi {
            validate_mask_dims(alibi.dim(), alibi.strides(), b, h, q_len, kv_len, "alibi")?;
        }
        if let Some(causal) = &self.causal_mask {
            validate_mask_dims(causal.dim(), causal.strides(), b, h, q_len, kv_len, "causal mask")?;
        }

        let masks = MaskSet {
            alibi: inputs.alibi.clone(),
            attn: mask_store.as_ref().map(|a| a.view()).or(mask_borrow.map(|v| v.reborrow())),
            causal: self.causal_mask.as_ref().map(|a| a.view()),
            select_nfltmax_at_0: self.select_nfltmax_at_0,
        };

        let scale = inputs.scale.unwrap_or(0.0);
        let d_scale = if scale == 0.0 {
            1.0 / (s_dim as f32).sqrt()
        } else {
            scale
        };

        let expected_out = if config.output_blhxs {
            (b, q_len, h, s_dim)
        } else {
            (b, h, q_len, s_dim)
        };
        precondition!(
            output.dim() == expected_out,
            "output shape {:?} does not match {:?}",
            output.dim(),
            expected_out
        );

        // Second token, or first token with an already-populated fused cache.
        let use_one_token = q_len == 1 || (config.fuse_concat && l0 > 0);
        let result = {
            if use_one_token {
                let kv_src = match cache_ref {
                    Some(state) => KvSource::Cached(state),
                    None => KvSource::Direct { key: k, value: v },
                };
                self.single_token.execute(
                    &q,
                    &kv_src,
                    &masks,
                    d_scale,
                    auto_causal,
                    config.output_blhxs,
                    output,
                )
            } else {
                let strategy = select_strategy::<T>(h, hk);
                debug!(
                    "prefill strategy {strategy:?} (B={b} H={h} H_kv={hk} q_len={q_len} kv_len={kv_len})"
                );
                let args = PrefillArgs {
                    query: q,
                    key: k,
                    value: v,
                    masks: &masks,
                    d_scale,
                    auto_causal,
                    has_out_transpose: config.output_blhxs,
                };
                self.prefill.execute(strategy, &args, output)
            }
        };

        if let Some(arr) = mask_store {
            self.mask_scratch = arr.into_raw_vec_and_offset().0;
        }
        result
    }
}

/// Kernel choice for the prefill regime, per runtime precision and head
/// grouping.
fn select_strategy<T: ComputeElem>(h: usize, hk: usize) -> KernelStrategy {
    match T::DTYPE {
        ElemType::F32 => KernelStrategy::Sgemm,
        ElemType::Bf16 => {
            if h == hk {
                KernelStrategy::FullMatmul
            } else {
                KernelStrategy::BlockPanel
            }
        }
        _ => unreachable!("compute precision is F32 or Bf16"),
    }
}

fn validate_mask_dims(
    dims: (usize, usize, usize, usize),
    strides: &[isize],
    b: usize,
    h: usize,
    q_len: usize,
    kv_len: usize,
    what: &str,
) -> Result<()> {
    let (db, dh, dm, dk) = dims;
    precondition!(
        dk == kv_len,
        "{what} last axis {dk} must equal kv_len {kv_len}"
    );
    precondition!(
        db == 1 || db == b,
        "{what} batch axis {db} not broadcastable to {b}"
    );
    precondition!(
        dh == 1 || dh == h,
        "{what} head axis {dh} not broadcastable to {h}"
    );
    precondition!(
        dm == 1 || dm == q_len,
        "{what} query axis {dm} not broadcastable to {q_len}"
    );
    precondition!(
        dk == 1 || strides[3] == 1,
        "{what} rows must be contiguous along kv_len"
    );
    Ok(())
}

#[cfg(test)]
mod tests;
