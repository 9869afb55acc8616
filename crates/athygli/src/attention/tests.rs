use anyhow::Result;
use approx::assert_abs_diff_eq;
use half::bf16;
use ndarray::{s, Array1, Array4};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::SeedableRng;

use super::*;
use crate::cache::KvCacheState;
use crate::kernels::bf16_supported;
use crate::tensor::{TensorView4, TensorViewMut4};

fn pseudo(shape: (usize, usize, usize, usize), seed: f32) -> Array4<f32> {
    Array4::from_shape_fn(shape, |(a, b, c, d)| {
        ((a * 131 + b * 37 + c * 17 + d) as f32 * 0.618 + seed).sin()
    })
}

/// Naive `softmax(Q*K^T * scale + mask) * V` with GQA broadcast and optional
/// implicit causal truncation.
fn reference_attention(
    q: &Array4<f32>,
    k: &Array4<f32>,
    v: &Array4<f32>,
    mask: Option<&Array4<f32>>,
    scale: f32,
    causal: bool,
) -> Array4<f32> {
    let (b, h, q_len, s) = q.dim();
    let (_, hk, kv_len, _) = k.dim();
    let g = h / hk;
    let mut out = Array4::zeros((b, h, q_len, s));

    for bi in 0..b {
        for hi in 0..h {
            for m in 0..q_len {
                let ncausal = if causal { kv_len - q_len + m + 1 } else { kv_len };
                let mut scores = vec![f32::NEG_INFINITY; kv_len];
                for (t, score) in scores[..ncausal].iter_mut().enumerate() {
                    let mut x = 0.0;
                    for si in 0..s {
                        x += q[[bi, hi, m, si]] * k[[bi, hi / g, t, si]];
                    }
                    x *= scale;
                    if let Some(msk) = mask {
                        let (db, dh, dm, _) = msk.dim();
                        x += msk[[
                            if db == 1 { 0 } else { bi },
                            if dh == 1 { 0 } else { hi },
                            if dm == 1 { 0 } else { m },
                            t,
                        ]];
                    }
                    *score = x;
                }

                let max = scores[..ncausal]
                    .iter()
                    .cloned()
                    .fold(f32::NEG_INFINITY, f32::max);
                let mut weights = vec![0.0f32; kv_len];
                if max.is_finite() {
                    let mut sum = 0.0;
                    for t in 0..ncausal {
                        weights[t] = (scores[t] - max).exp();
                        sum += weights[t];
                    }
                    for w in &mut weights {
                        *w /= sum;
                    }
                }
                for (t, &w) in weights[..ncausal].iter().enumerate() {
                    for si in 0..s {
                        out[[bi, hi, m, si]] += w * v[[bi, hi / g, t, si]];
                    }
                }
            }
        }
    }
    out
}

fn run_f32<'a>(
    engine: &mut Sdpa,
    q: &'a Array4<f32>,
    k: &'a Array4<f32>,
    v: &'a Array4<f32>,
    mask: Option<AttnMask<'a>>,
    cache: Option<&'a mut KvCacheState>,
    out_shape: (usize, usize, usize, usize),
) -> Result<Array4<f32>> {
    let mut inputs = AttentionInputs::new(
        TensorView4::from(q.view()),
        TensorView4::from(k.view()),
        TensorView4::from(v.view()),
    );
    inputs.attn_mask = mask;
    let mut out = Array4::<f32>::zeros(out_shape);
    let mut out_view = TensorViewMut4::from(out.view_mut());
    engine.execute(&inputs, cache, &mut out_view)?;
    Ok(out)
}

fn max_abs_diff(a: &Array4<f32>, b: &Array4<f32>) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(&x, &y)| (x - y).abs())
        .fold(0.0, f32::max)
}

fn cosine(a: &Array4<f32>, b: &Array4<f32>) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(&x, &y)| x * y).sum();
    let na: f32 = a.iter().map(|&x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|&x| x * x).sum::<f32>().sqrt();
    dot / (na * nb)
}

#[test]
fn test_prefill_matches_reference() -> Result<()> {
    let mut rng = StdRng::seed_from_u64(42);
    let q = Array4::random_using((2, 2, 5, 16), Uniform::new(-1.0f32, 1.0), &mut rng);
    let k = Array4::random_using((2, 2, 7, 16), Uniform::new(-1.0f32, 1.0), &mut rng);
    let v = Array4::random_using((2, 2, 7, 16), Uniform::new(-1.0f32, 1.0), &mut rng);

    let mut engine = Sdpa::new(ElemType::F32, SdpaConfig::default())?;
    let out = run_f32(&mut engine, &q, &k, &v, None, None, (2, 2, 5, 16))?;

    let reference = reference_attention(&q, &k, &v, None, 1.0 / 4.0, false);
    assert!(max_abs_diff(&out, &reference) < 1e-4);
    Ok(())
}

#[test]
fn test_additive_mask_matches_reference() -> Result<()> {
    let q = pseudo((1, 2, 3, 8), 0.1);
    let k = pseudo((1, 2, 6, 8), 0.2);
    let v = pseudo((1, 2, 6, 8), 0.3);
    let mask = Array4::from_shape_fn((1, 1, 3, 6), |(_, _, m, t)| {
        if t > m + 2 {
            f32::NEG_INFINITY
        } else {
            0.1 * t as f32
        }
    });

    let mut engine = Sdpa::new(ElemType::F32, SdpaConfig::default())?;
    let out = run_f32(
        &mut engine,
        &q,
        &k,
        &v,
        Some(AttnMask::Additive(TensorView4::from(mask.view()))),
        None,
        (1, 2, 3, 8),
    )?;

    let reference = reference_attention(&q, &k, &v, Some(&mask), 1.0 / (8.0f32).sqrt(), false);
    assert!(max_abs_diff(&out, &reference) < 1e-5);
    Ok(())
}

#[test]
fn test_is_causal_equals_explicit_neg_inf_mask() -> Result<()> {
    let q = pseudo((2, 2, 4, 8), 0.4);
    let k = pseudo((2, 2, 4, 8), 0.5);
    let v = pseudo((2, 2, 4, 8), 0.6);

    let mut causal_engine = Sdpa::new(
        ElemType::F32,
        SdpaConfig {
            is_causal: true,
            ..Default::default()
        },
    )?;
    let causal_out = run_f32(&mut causal_engine, &q, &k, &v, None, None, (2, 2, 4, 8))?;

    let tri = Array4::from_shape_fn((1, 1, 4, 4), |(_, _, m, t)| {
        if t > m {
            f32::NEG_INFINITY
        } else {
            0.0
        }
    });
    let mut masked_engine = Sdpa::new(ElemType::F32, SdpaConfig::default())?;
    let masked_out = run_f32(
        &mut masked_engine,
        &q,
        &k,
        &v,
        Some(AttnMask::Additive(TensorView4::from(tri.view()))),
        None,
        (2, 2, 4, 8),
    )?;

    assert_eq!(causal_out, masked_out);
    Ok(())
}

#[test]
fn test_boolean_mask_matches_additive_neg_inf() -> Result<()> {
    let q = pseudo((1, 2, 3, 8), 0.7);
    let k = pseudo((1, 2, 6, 8), 0.8);
    let v = pseudo((1, 2, 6, 8), 0.9);

    // Mask out the second half of kv positions.
    let boolean = Array4::from_shape_fn((1, 1, 1, 6), |(_, _, _, t)| u8::from(t < 3));
    let additive = Array4::from_shape_fn((1, 1, 1, 6), |(_, _, _, t)| {
        if t < 3 {
            0.0
        } else {
            f32::NEG_INFINITY
        }
    });

    let mut engine = Sdpa::new(ElemType::F32, SdpaConfig::default())?;
    let out_bool = run_f32(
        &mut engine,
        &q,
        &k,
        &v,
        Some(AttnMask::Boolean(boolean.view())),
        None,
        (1, 2, 3, 8),
    )?;
    let out_add = run_f32(
        &mut engine,
        &q,
        &k,
        &v,
        Some(AttnMask::Additive(TensorView4::from(additive.view()))),
        None,
        (1, 2, 3, 8),
    )?;

    assert_eq!(out_bool, out_add);
    Ok(())
}

#[test]
fn test_explicit_causal_mask_polarity_flip() -> Result<()> {
    let q = pseudo((1, 1, 4, 8), 1.1);
    let k = pseudo((1, 1, 4, 8), 1.2);
    let v = pseudo((1, 1, 4, 8), 1.3);

    let mask = Array4::from_shape_fn((1, 1, 4, 4), |(_, _, m, t)| u8::from(t <= m));
    let flipped = mask.mapv(|x| x ^ 1);

    let mut e1 = Sdpa::new(ElemType::F32, SdpaConfig::default())?;
    e1.set_causal_mask(mask, true);
    let out1 = run_f32(&mut e1, &q, &k, &v, None, None, (1, 1, 4, 8))?;

    let mut e2 = Sdpa::new(ElemType::F32, SdpaConfig::default())?;
    e2.set_causal_mask(flipped, false);
    let out2 = run_f32(&mut e2, &q, &k, &v, None, None, (1, 1, 4, 8))?;

    assert_eq!(out1, out2);
    Ok(())
}

#[test]
fn test_two_token_causal_scenario() -> Result<()> {
    // Q=[[1],[2]], K=[[1],[1]], V=[[1],[3]]: row 0 sees only t=0, row 1
    // weighs both equally, so O = [[1], [2]].
    let q = Array4::from_shape_vec((1, 1, 2, 1), vec![1.0, 2.0])?;
    let k = Array4::from_shape_vec((1, 1, 2, 1), vec![1.0, 1.0])?;
    let v = Array4::from_shape_vec((1, 1, 2, 1), vec![1.0, 3.0])?;

    let mut engine = Sdpa::new(
        ElemType::F32,
        SdpaConfig {
            is_causal: true,
            ..Default::default()
        },
    )?;
    let out = run_f32(&mut engine, &q, &k, &v, None, None, (1, 1, 2, 1))?;

    assert_abs_diff_eq!(out[[0, 0, 0, 0]], 1.0, epsilon = 1e-6);
    assert_abs_diff_eq!(out[[0, 0, 1, 0]], 2.0, epsilon = 1e-6);
    Ok(())
}

#[test]
fn test_grouped_query_matches_broadcast_reference() -> Result<()> {
    let mut rng = StdRng::seed_from_u64(7);
    let q = Array4::random_using((2, 2, 1, 4), Uniform::new(-1.0f32, 1.0), &mut rng);
    let k = Array4::random_using((2, 1, 4, 4), Uniform::new(-1.0f32, 1.0), &mut rng);
    let v = Array4::random_using((2, 1, 4, 4), Uniform::new(-1.0f32, 1.0), &mut rng);

    let mut engine = Sdpa::new(ElemType::F32, SdpaConfig::default())?;
    let out = run_f32(&mut engine, &q, &k, &v, None, None, (2, 2, 1, 4))?;

    let reference = reference_attention(&q, &k, &v, None, 0.5, false);
    assert!(max_abs_diff(&out, &reference) < 1e-5);
    Ok(())
}

#[test]
fn test_grouped_query_prefill() -> Result<()> {
    let q = pseudo((1, 4, 6, 8), 2.1);
    let k = pseudo((1, 2, 6, 8), 2.2);
    let v = pseudo((1, 2, 6, 8), 2.3);

    let mut engine = Sdpa::new(
        ElemType::F32,
        SdpaConfig {
            is_causal: true,
            ..Default::default()
        },
    )?;
    let out = run_f32(&mut engine, &q, &k, &v, None, None, (1, 4, 6, 8))?;

    let reference = reference_attention(&q, &k, &v, None, 1.0 / (8.0f32).sqrt(), true);
    assert!(max_abs_diff(&out, &reference) < 1e-5);
    Ok(())
}

#[test]
fn test_permutation_invariance() -> Result<()> {
    let q = pseudo((2, 3, 4, 8), 3.1);
    let k = pseudo((2, 3, 4, 8), 3.2);
    let v = pseudo((2, 3, 4, 8), 3.3);

    let mut canonical = Sdpa::new(
        ElemType::F32,
        SdpaConfig {
            is_causal: true,
            ..Default::default()
        },
    )?;
    let expected = run_f32(&mut canonical, &q, &k, &v, None, None, (2, 3, 4, 8))?;

    // Same tensors stored [B, L, H, S]; the engine undoes the layout by
    // stride permutation.
    let q_l = q.view().permuted_axes([0, 2, 1, 3]).to_owned();
    let k_l = k.view().permuted_axes([0, 2, 1, 3]).to_owned();
    let v_l = v.view().permuted_axes([0, 2, 1, 3]).to_owned();

    let mut permuted = Sdpa::new(
        ElemType::F32,
        SdpaConfig {
            is_causal: true,
            permute_axes: Some([0, 2, 1, 3]),
            ..Default::default()
        },
    )?;
    let out = run_f32(&mut permuted, &q_l, &k_l, &v_l, None, None, (2, 3, 4, 8))?;

    assert_eq!(out, expected);
    Ok(())
}

#[test]
fn test_transposed_output_layout() -> Result<()> {
    let q = pseudo((2, 3, 4, 8), 4.1);
    let k = pseudo((2, 3, 4, 8), 4.2);
    let v = pseudo((2, 3, 4, 8), 4.3);

    let mut plain = Sdpa::new(ElemType::F32, SdpaConfig::default())?;
    let out = run_f32(&mut plain, &q, &k, &v, None, None, (2, 3, 4, 8))?;

    let mut transposed = Sdpa::new(
        ElemType::F32,
        SdpaConfig {
            output_blhxs: true,
            ..Default::default()
        },
    )?;
    let out_t = run_f32(&mut transposed, &q, &k, &v, None, None, (2, 4, 3, 8))?;

    assert_eq!(out_t, out.view().permuted_axes([0, 2, 1, 3]).to_owned());
    Ok(())
}

#[test]
fn test_empty_query_returns_unchanged_output() -> Result<()> {
    let q = Array4::<f32>::zeros((1, 1, 0, 4));
    let k = Array4::<f32>::zeros((1, 1, 0, 4));
    let v = Array4::<f32>::zeros((1, 1, 0, 4));

    let mut engine = Sdpa::new(ElemType::F32, SdpaConfig::default())?;
    let mut out = Array4::<f32>::from_elem((1, 1, 2, 4), 7.5);
    let inputs = AttentionInputs::new(
        TensorView4::from(q.view()),
        TensorView4::from(k.view()),
        TensorView4::from(v.view()),
    );
    let mut out_view = TensorViewMut4::from(out.view_mut());
    engine.execute(&inputs, None, &mut out_view)?;

    assert!(out.iter().all(|&x| x == 7.5));
    Ok(())
}

#[test]
fn test_kv_len_one_reduces_to_value() -> Result<()> {
    let q = pseudo((2, 2, 1, 8), 5.1);
    let k = pseudo((2, 2, 1, 8), 5.2);
    let v = pseudo((2, 2, 1, 8), 5.3);

    let mut engine = Sdpa::new(ElemType::F32, SdpaConfig::default())?;
    let out = run_f32(&mut engine, &q, &k, &v, None, None, (2, 2, 1, 8))?;

    assert!(max_abs_diff(&out, &v) < 1e-6);
    Ok(())
}

#[test]
fn test_incremental_generation_matches_prefill() -> Result<()> {
    let (b, h, s, n) = (2, 2, 8, 16);
    let q_all = pseudo((b, h, n, s), 6.1);
    let k_all = pseudo((b, h, n, s), 6.2);
    let v_all = pseudo((b, h, n, s), 6.3);

    let mut prefill = Sdpa::new(
        ElemType::F32,
        SdpaConfig {
            is_causal: true,
            ..Default::default()
        },
    )?;
    let expected = run_f32(&mut prefill, &q_all, &k_all, &v_all, None, None, (b, h, n, s))?;

    let mut decode = Sdpa::new(
        ElemType::F32,
        SdpaConfig {
            is_causal: true,
            fuse_concat: true,
            ..Default::default()
        },
    )?;
    let mut cache = KvCacheState::new(ElemType::F32);

    for t in 0..n {
        let q = q_all.slice(s![.., .., t..t + 1, ..]).to_owned();
        let k = k_all.slice(s![.., .., t..t + 1, ..]).to_owned();
        let v = v_all.slice(s![.., .., t..t + 1, ..]).to_owned();

        let out = run_f32(
            &mut decode,
            &q,
            &k,
            &v,
            None,
            Some(&mut cache),
            (b, h, 1, s),
        )?;

        let step_expected = expected.slice(s![.., .., t..t + 1, ..]).to_owned();
        assert!(
            max_abs_diff(&out, &step_expected) < 1e-4,
            "token {t} diverged"
        );
    }
    assert_eq!(cache.len(), n);
    Ok(())
}

#[test]
fn test_beam_expansion_and_reorder() -> Result<()> {
    let (h, s) = (2, 4);
    let prompt_q = pseudo((1, h, 3, s), 7.1);
    let prompt_k = pseudo((1, h, 3, s), 7.2);
    let prompt_v = pseudo((1, h, 3, s), 7.3);

    let mut engine = Sdpa::new(
        ElemType::F32,
        SdpaConfig {
            is_causal: true,
            fuse_concat: true,
            ..Default::default()
        },
    )?;
    let mut cache = KvCacheState::new(ElemType::F32);
    run_f32(
        &mut engine,
        &prompt_q,
        &prompt_k,
        &prompt_v,
        None,
        Some(&mut cache),
        (1, h, 3, s),
    )?;

    // Expand to four beams, every lane inheriting the single prompt lane.
    let step1_q = pseudo((4, h, 1, s), 8.1);
    let step1_k = pseudo((4, h, 1, s), 8.2);
    let step1_v = pseudo((4, h, 1, s), 8.3);
    let expand = Array1::from_vec(vec![0i32, 0, 0, 0]);
    {
        let mut inputs = AttentionInputs::new(
            TensorView4::from(step1_q.view()),
            TensorView4::from(step1_k.view()),
            TensorView4::from(step1_v.view()),
        );
        inputs.beam_idx = Some(expand.view());
        let mut out = Array4::<f32>::zeros((4, h, 1, s));
        let mut out_view = TensorViewMut4::from(out.view_mut());
        engine.execute(&inputs, Some(&mut cache), &mut out_view)?;
    }

    // Reorder with pi = [3, 2, 1, 0] while appending a second step.
    let step2_q = pseudo((4, h, 1, s), 9.1);
    let step2_k = pseudo((4, h, 1, s), 9.2);
    let step2_v = pseudo((4, h, 1, s), 9.3);
    let pi = Array1::from_vec(vec![3i32, 2, 1, 0]);
    let mut out = Array4::<f32>::zeros((4, h, 1, s));
    {
        let mut inputs = AttentionInputs::new(
            TensorView4::from(step2_q.view()),
            TensorView4::from(step2_k.view()),
            TensorView4::from(step2_v.view()),
        );
        inputs.beam_idx = Some(pi.view());
        let mut out_view = TensorViewMut4::from(out.view_mut());
        engine.execute(&inputs, Some(&mut cache), &mut out_view)?;
    }

    // Reference: lane b attends over prompt + step1 token of lane 3-b + its
    // own step2 token.
    for lane in 0..4usize {
        let src = 3 - lane;
        let mut k_hist = Array4::zeros((1, h, 5, s));
        let mut v_hist = Array4::zeros((1, h, 5, s));
        for hi in 0..h {
            for t in 0..3 {
                for si in 0..s {
                    k_hist[[0, hi, t, si]] = prompt_k[[0, hi, t, si]];
                    v_hist[[0, hi, t, si]] = prompt_v[[0, hi, t, si]];
                }
            }
            for si in 0..s {
                k_hist[[0, hi, 3, si]] = step1_k[[src, hi, 0, si]];
                v_hist[[0, hi, 3, si]] = step1_v[[src, hi, 0, si]];
                k_hist[[0, hi, 4, si]] = step2_k[[lane, hi, 0, si]];
                v_hist[[0, hi, 4, si]] = step2_v[[lane, hi, 0, si]];
            }
        }
        let q_lane = step2_q.slice(s![lane..lane + 1, .., .., ..]).to_owned();
        let expected =
            reference_attention(&q_lane, &k_hist, &v_hist, None, 0.5, true);
        let got = out.slice(s![lane..lane + 1, .., .., ..]).to_owned();
        assert!(
            max_abs_diff(&got, &expected) < 1e-5,
            "lane {lane} read the wrong history"
        );
    }
    Ok(())
}

#[test]
fn test_u8_cache_tracks_f32_reference() -> Result<()> {
    let (b, h, s) = (1, 2, 16);
    let make_engine = |precision| {
        Sdpa::new(
            ElemType::F32,
            SdpaConfig {
                is_causal: true,
                fuse_concat: true,
                kv_cache_precision: precision,
                ..Default::default()
            },
        )
    };

    let mut quantized = make_engine(ElemType::U8)?;
    let mut exact = make_engine(ElemType::F32)?;
    let mut q_cache = KvCacheState::new(ElemType::U8);
    let mut f_cache = KvCacheState::new(ElemType::F32);

    // 64-token prefill, then 16 incremental tokens.
    let q0 = pseudo((b, h, 64, s), 10.1);
    let k0 = pseudo((b, h, 64, s), 10.2);
    let v0 = pseudo((b, h, 64, s), 10.3);
    run_f32(&mut quantized, &q0, &k0, &v0, None, Some(&mut q_cache), (b, h, 64, s))?;
    run_f32(&mut exact, &q0, &k0, &v0, None, Some(&mut f_cache), (b, h, 64, s))?;

    let mut steps = Vec::new();
    for t in 0..16 {
        let q = pseudo((b, h, 1, s), 11.0 + t as f32);
        let k = pseudo((b, h, 1, s), 12.0 + t as f32);
        let v = pseudo((b, h, 1, s), 13.0 + t as f32);
        let out_q = run_f32(&mut quantized, &q, &k, &v, None, Some(&mut q_cache), (b, h, 1, s))?;
        let out_f = run_f32(&mut exact, &q, &k, &v, None, Some(&mut f_cache), (b, h, 1, s))?;
        steps.push((out_q, out_f));
    }

    for (out_q, out_f) in &steps {
        assert!(cosine(out_q, out_f) >= 0.999);
    }
    Ok(())
}

#[test]
fn test_alibi_bias_matches_additive_mask() -> Result<()> {
    let q = pseudo((1, 2, 3, 8), 14.1);
    let k = pseudo((1, 2, 6, 8), 14.2);
    let v = pseudo((1, 2, 6, 8), 14.3);
    let bias = Array4::from_shape_fn((1, 2, 1, 6), |(_, hi, _, t)| {
        -((t + 1) as f32) * 0.1 * (hi + 1) as f32
    });

    let mut engine = Sdpa::new(ElemType::F32, SdpaConfig::default())?;
    let mut inputs = AttentionInputs::new(
        TensorView4::from(q.view()),
        TensorView4::from(k.view()),
        TensorView4::from(v.view()),
    );
    inputs.alibi = Some(bias.view());
    let mut out = Array4::<f32>::zeros((1, 2, 3, 8));
    let mut out_view = TensorViewMut4::from(out.view_mut());
    engine.execute(&inputs, None, &mut out_view)?;

    let reference = reference_attention(&q, &k, &v, Some(&bias), 1.0 / (8.0f32).sqrt(), false);
    assert!(max_abs_diff(&out, &reference) < 1e-5);
    Ok(())
}

#[test]
fn test_bf16_prefill_tracks_f32_reference() -> Result<()> {
    if !bf16_supported() {
        return Ok(());
    }
    let q = pseudo((1, 2, 6, 16), 15.1);
    let k = pseudo((1, 2, 6, 16), 15.2);
    let v = pseudo((1, 2, 6, 16), 15.3);
    let to_bf = |a: &Array4<f32>| a.mapv(bf16::from_f32);
    let (qb, kb, vb) = (to_bf(&q), to_bf(&k), to_bf(&v));

    let mut engine = Sdpa::new(
        ElemType::Bf16,
        SdpaConfig {
            is_causal: true,
            ..Default::default()
        },
    )?;
    let mut inputs = AttentionInputs::new(
        TensorView4::from(qb.view()),
        TensorView4::from(kb.view()),
        TensorView4::from(vb.view()),
    );
    inputs.scale = Some(0.25);
    let mut out = Array4::<bf16>::zeros((1, 2, 6, 16));
    let mut out_view = TensorViewMut4::from(out.view_mut());
    engine.execute(&inputs, None, &mut out_view)?;

    let reference = reference_attention(&q, &k, &v, None, 0.25, true);
    let out_f32 = out.mapv(|x| x.to_f32());
    assert!(max_abs_diff(&out_f32, &reference) < 2e-2);
    Ok(())
}

#[test]
fn test_bf16_grouped_query_uses_block_panel() -> Result<()> {
    if !bf16_supported() {
        return Ok(());
    }
    let q = pseudo((1, 4, 40, 16), 16.1);
    let k = pseudo((1, 2, 40, 16), 16.2);
    let v = pseudo((1, 2, 40, 16), 16.3);
    let to_bf = |a: &Array4<f32>| a.mapv(bf16::from_f32);
    let (qb, kb, vb) = (to_bf(&q), to_bf(&k), to_bf(&v));

    let mut engine = Sdpa::new(
        ElemType::Bf16,
        SdpaConfig {
            is_causal: true,
            ..Default::default()
        },
    )?;
    let inputs = AttentionInputs::new(
        TensorView4::from(qb.view()),
        TensorView4::from(kb.view()),
        TensorView4::from(vb.view()),
    );
    let mut out = Array4::<bf16>::zeros((1, 4, 40, 16));
    let mut out_view = TensorViewMut4::from(out.view_mut());
    engine.execute(&inputs, None, &mut out_view)?;

    let reference = reference_attention(&q, &k, &v, None, 0.25, true);
    let out_f32 = out.mapv(|x| x.to_f32());
    assert!(max_abs_diff(&out_f32, &reference) < 2e-2);
    Ok(())
}

#[test]
fn test_precision_mismatch_rejected() -> Result<()> {
    let q = pseudo((1, 1, 2, 4), 17.1);
    let mut engine = Sdpa::new(ElemType::F32, SdpaConfig::default())?;

    let qb = q.mapv(bf16::from_f32);
    let inputs = AttentionInputs::new(
        TensorView4::from(qb.view()),
        TensorView4::from(qb.view()),
        TensorView4::from(qb.view()),
    );
    let mut out = Array4::<f32>::zeros((1, 1, 2, 4));
    let mut out_view = TensorViewMut4::from(out.view_mut());
    let err = engine.execute(&inputs, None, &mut out_view);
    assert!(matches!(err, Err(AttentionError::Precondition(_))));
    Ok(())
}

#[test]
fn test_fuse_concat_without_cache_rejected() -> Result<()> {
    let q = pseudo((1, 1, 2, 4), 18.1);
    let mut engine = Sdpa::new(
        ElemType::F32,
        SdpaConfig {
            fuse_concat: true,
            ..Default::default()
        },
    )?;
    let inputs = AttentionInputs::new(
        TensorView4::from(q.view()),
        TensorView4::from(q.view()),
        TensorView4::from(q.view()),
    );
    let mut out = Array4::<f32>::zeros((1, 1, 2, 4));
    let mut out_view = TensorViewMut4::from(out.view_mut());
    let err = engine.execute(&inputs, None, &mut out_view);
    assert!(matches!(err, Err(AttentionError::Precondition(_))));
    Ok(())
}

#[test]
fn test_ragged_heads_rejected() -> Result<()> {
    let q = pseudo((1, 3, 2, 4), 19.1);
    let k = pseudo((1, 2, 2, 4), 19.2);
    let mut engine = Sdpa::new(ElemType::F32, SdpaConfig::default())?;
    let inputs = AttentionInputs::new(
        TensorView4::from(q.view()),
        TensorView4::from(k.view()),
        TensorView4::from(k.view()),
    );
    let mut out = Array4::<f32>::zeros((1, 3, 2, 4));
    let mut out_view = TensorViewMut4::from(out.view_mut());
    let err = engine.execute(&inputs, None, &mut out_view);
    assert!(matches!(err, Err(AttentionError::Precondition(_))));
    Ok(())
}

#[test]
fn test_f16_runtime_precision_rejected() {
    let err = Sdpa::new(ElemType::F16, SdpaConfig::default());
    assert!(matches!(err, Err(AttentionError::Precondition(_))));
}
