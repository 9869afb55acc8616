//! Fused scale + mask + softmax over one attention-score row.

use crate::tensor::AttnElem;

use super::from_f32_row;

/// Scale, bias, mask, and normalize one score row in place, then down-cast
/// the weights into `out`.
///
/// Only `[0, ncausal)` participates; positions at and beyond `ncausal` are
/// forced to zero weight. `causal_mask` bytes select `-inf` according to
/// `select_nfltmax_at_0`: when true a zero byte masks, otherwise a non-zero
/// byte does.
#[allow(clippy::too_many_arguments)]
pub(crate) fn attn_softmax<T: AttnElem>(
    scores: &mut [f32],
    out: &mut [T],
    d_scale: f32,
    alibi: Option<&[f32]>,
    attn_mask: Option<&[f32]>,
    causal_mask: Option<&[u8]>,
    select_nfltmax_at_0: bool,
    ncausal: usize,
) {
    softmax_row(
        scores,
        d_scale,
        alibi,
        attn_mask,
        causal_mask,
        select_nfltmax_at_0,
        ncausal,
    );
    from_f32_row(scores, out);
}

/// In-place f32 variant used when the weight buffer is the score buffer.
#[allow(clippy::too_many_arguments)]
pub(crate) fn attn_softmax_inplace(
    scores: &mut [f32],
    d_scale: f32,
    alibi: Option<&[f32]>,
    attn_mask: Option<&[f32]>,
    causal_mask: Option<&[u8]>,
    select_nfltmax_at_0: bool,
    ncausal: usize,
) {
    softmax_row(
        scores,
        d_scale,
        alibi,
        attn_mask,
        causal_mask,
        select_nfltmax_at_0,
        ncausal,
    );
}

fn softmax_row(
    scores: &mut [f32],
    d_scale: f32,
    alibi: Option<&[f32]>,
    attn_mask: Option<&[f32]>,
    causal_mask: Option<&[u8]>,
    select_nfltmax_at_0: bool,
    ncausal: usize,
) {
    let kv_len = scores.len();
    let n = ncausal.min(kv_len);

    for (i, s) in scores[..n].iter_mut().enumerate() {
        let mut x = *s * d_scale;
        if let Some(bias) = alibi {
            x += bias[i];
        }
        if let Some(mask) = attn_mask {
            x += mask[i];
        }
        if let Some(mask) = causal_mask {
            if (mask[i] == 0) == select_nfltmax_at_0 {
                x = f32::NEG_INFINITY;
            }
        }
        *s = x;
    }
    // Padding beyond the causal horizon neither contributes nor affects the sum.
    scores[n..].fill(0.0);

    let prefix = &mut scores[..n];
    let max = prefix.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    if !max.is_finite() {
        // Every admissible position is masked out; the row attends to nothing.
        prefix.fill(0.0);
        return;
    }

    let mut sum = 0.0f32;
    for v in prefix.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    let scale = 1.0 / sum;
    for v in prefix.iter_mut() {
        *v *= scale;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use half::bf16;

    #[test]
    fn test_uniform_scores() {
        let mut scores = [2.0f32; 4];
        let mut out = [0.0f32; 4];
        attn_softmax(&mut scores, &mut out, 1.0, None, None, None, false, 4);
        for &w in &out {
            assert!((w - 0.25).abs() < 1e-6);
        }
    }

    #[test]
    fn test_causal_truncation_zeroes_tail() {
        let mut scores = [1.0f32, 1.0, 9.0, 9.0];
        let mut out = [0.0f32; 4];
        attn_softmax(&mut scores, &mut out, 1.0, None, None, None, false, 2);
        assert!((out[0] - 0.5).abs() < 1e-6);
        assert!((out[1] - 0.5).abs() < 1e-6);
        assert_eq!(out[2], 0.0);
        assert_eq!(out[3], 0.0);
    }

    #[test]
    fn test_fully_masked_row_is_zero_not_nan() {
        let mut scores = [1.0f32, 2.0];
        let mut out = [9.0f32; 2];
        attn_softmax(&mut scores, &mut out, 1.0, None, None, None, false, 0);
        assert_eq!(out, [0.0, 0.0]);

        let mut scores = [1.0f32, 2.0];
        let mask = [0u8, 0];
        attn_softmax(&mut scores, &mut out, 1.0, None, None, Some(&mask), true, 2);
        assert_eq!(out, [0.0, 0.0]);
    }

    #[test]
    fn test_boolean_mask_polarity_flip() {
        let base = [0.3f32, -1.0, 0.7, 2.0];
        let mask = [1u8, 0, 1, 0];
        let flipped: Vec<u8> = mask.iter().map(|&m| m ^ 1).collect();

        let mut s1 = base;
        let mut o1 = [0.0f32; 4];
        attn_softmax(&mut s1, &mut o1, 0.5, None, None, Some(&mask), true, 4);

        let mut s2 = base;
        let mut o2 = [0.0f32; 4];
        attn_softmax(&mut s2, &mut o2, 0.5, None, None, Some(&flipped), false, 4);

        assert_eq!(o1, o2);
    }

    #[test]
    fn test_additive_mask_matches_boolean() {
        let base = [1.0f32, 2.0, 3.0];
        let boolean = [1u8, 0, 1];
        let additive = [0.0f32, f32::NEG_INFINITY, 0.0];

        let mut s1 = base;
        let mut o1 = [0.0f32; 3];
        attn_softmax(&mut s1, &mut o1, 1.0, None, None, Some(&boolean), true, 3);

        let mut s2 = base;
        let mut o2 = [0.0f32; 3];
        attn_softmax(&mut s2, &mut o2, 1.0, None, Some(&additive), None, false, 3);

        assert_eq!(o1, o2);
    }

    #[test]
    fn test_downcast_to_bf16() {
        let mut scores = [0.0f32, 0.0];
        let mut out = [bf16::ZERO; 2];
        attn_softmax(&mut scores, &mut out, 1.0, None, None, None, false, 2);
        assert_eq!(out[0], bf16::from_f32(0.5));
    }
}
