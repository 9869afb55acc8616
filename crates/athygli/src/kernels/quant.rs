//! Per-row u8 quantization of KV-cache slabs.
//!
//! One `(scale, zero_point)` pair per cached time step of each head; the
//! incremental kernel dequantizes on the fly through the same pair.

use crate::tensor::AttnElem;

/// Quantize one `[S]` row to u8, returning its `(scale, zero_point)`.
///
/// `scale = (max - min) / 255`, `zp = -min / scale`. A constant row stores
/// `scale = 1` so dequantization reproduces it exactly.
pub(crate) fn quant_row_u8<T: AttnElem>(src: &[T], dst: &mut [u8]) -> (f32, f32) {
    let mut min = f32::INFINITY;
    let mut max = f32::NEG_INFINITY;
    for &x in src {
        let v = x.to_f32();
        min = min.min(v);
        max = max.max(v);
    }

    let range = max - min;
    let scale = if range == 0.0 { 1.0 } else { range / 255.0 };
    let zp = -min / scale;

    for (d, &x) in dst.iter_mut().zip(src.iter()) {
        *d = (x.to_f32() / scale + zp).round().clamp(0.0, 255.0) as u8;
    }
    (scale, zp)
}

/// Reverse of [`quant_row_u8`] for one row.
pub(crate) fn dequant_row_u8(src: &[u8], dst: &mut [f32], scale: f32, zp: f32) {
    for (d, &q) in dst.iter_mut().zip(src.iter()) {
        *d = (q as f32 - zp) * scale;
    }
}
