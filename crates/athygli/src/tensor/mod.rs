//! Element types and dtype-erased tensor views.
//!
//! The engine never owns its inputs: callers hand in `ndarray` views over
//! externally owned memory and the engine reads them through strides. A
//! [`TensorView4`] erases the element type so one dispatcher can serve both
//! compute precisions.

use half::{bf16, f16};
use ndarray::{ArrayView4, ArrayViewMut4, Zip};

/// Element type of a tensor or KV-cache slab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElemType {
    F32,
    F16,
    Bf16,
    U8,
}

impl ElemType {
    pub fn size_of(self) -> usize {
        match self {
            ElemType::F32 => 4,
            ElemType::F16 | ElemType::Bf16 => 2,
            ElemType::U8 => 1,
        }
    }
}

/// A scalar the attention kernels can read and write.
///
/// `f32` is the accumulator type everywhere; the half precisions convert on
/// load and store.
pub trait AttnElem: Copy + Send + Sync + bytemuck::Pod + 'static {
    const DTYPE: ElemType;

    fn to_f32(self) -> f32;
    fn from_f32(v: f32) -> Self;
}

/// A scalar usable as the runtime compute precision (`f16` is cache-only).
pub trait ComputeElem: AttnElem {
    fn from_view<'a>(view: &TensorView4<'a>) -> Option<ArrayView4<'a, Self>>;
    fn as_view(view: ArrayView4<'_, Self>) -> TensorView4<'_>;
}

impl AttnElem for f32 {
    const DTYPE: ElemType = ElemType::F32;

    #[inline(always)]
    fn to_f32(self) -> f32 {
        self
    }

    #[inline(always)]
    fn from_f32(v: f32) -> Self {
        v
    }
}

impl ComputeElem for f32 {
    fn from_view<'a>(view: &TensorView4<'a>) -> Option<ArrayView4<'a, Self>> {
        match view {
            TensorView4::F32(v) => Some(v.clone()),
            _ => None,
        }
    }

    fn as_view(view: ArrayView4<'_, Self>) -> TensorView4<'_> {
        TensorView4::F32(view)
    }
}

impl AttnElem for bf16 {
    const DTYPE: ElemType = ElemType::Bf16;

    #[inline(always)]
    fn to_f32(self) -> f32 {
        self.to_f32()
    }

    #[inline(always)]
    fn from_f32(v: f32) -> Self {
        bf16::from_f32(v)
    }
}

impl ComputeElem for bf16 {
    fn from_view<'a>(view: &TensorView4<'a>) -> Option<ArrayView4<'a, Self>> {
        match view {
            TensorView4::Bf16(v) => Some(v.clone()),
            _ => None,
        }
    }

    fn as_view(view: ArrayView4<'_, Self>) -> TensorView4<'_> {
        TensorView4::Bf16(view)
    }
}

impl AttnElem for f16 {
    const DTYPE: ElemType = ElemType::F16;

    #[inline(always)]
    fn to_f32(self) -> f32 {
        self.to_f32()
    }

    #[inline(always)]
    fn from_f32(v: f32) -> Self {
        f16::from_f32(v)
    }
}

/// Borrowed rank-4 input tensor in one of the compute precisions.
#[derive(Clone)]
pub enum TensorView4<'a> {
    F32(ArrayView4<'a, f32>),
    Bf16(ArrayView4<'a, bf16>),
}

impl<'a> TensorView4<'a> {
    pub fn elem_type(&self) -> ElemType {
        match self {
            TensorView4::F32(_) => ElemType::F32,
            TensorView4::Bf16(_) => ElemType::Bf16,
        }
    }

    pub fn dim(&self) -> (usize, usize, usize, usize) {
        match self {
            TensorView4::F32(v) => v.dim(),
            TensorView4::Bf16(v) => v.dim(),
        }
    }

    /// Re-interpret axes by stride permutation; never copies.
    ///
    /// Canonical axis `i` of the result reads input axis `order[i]`.
    pub fn permuted(self, order: [usize; 4]) -> Self {
        match self {
            TensorView4::F32(v) => TensorView4::F32(v.permuted_axes(order)),
            TensorView4::Bf16(v) => TensorView4::Bf16(v.permuted_axes(order)),
        }
    }
}

impl<'a> From<ArrayView4<'a, f32>> for TensorView4<'a> {
    fn from(v: ArrayView4<'a, f32>) -> Self {
        TensorView4::F32(v)
    }
}

impl<'a> From<ArrayView4<'a, bf16>> for TensorView4<'a> {
    fn from(v: ArrayView4<'a, bf16>) -> Self {
        TensorView4::Bf16(v)
    }
}

/// Mutable rank-4 output tensor in one of the compute precisions.
pub enum TensorViewMut4<'a> {
    F32(ArrayViewMut4<'a, f32>),
    Bf16(ArrayViewMut4<'a, bf16>),
}

impl<'a> TensorViewMut4<'a> {
    pub fn elem_type(&self) -> ElemType {
        match self {
            TensorViewMut4::F32(_) => ElemType::F32,
            TensorViewMut4::Bf16(_) => ElemType::Bf16,
        }
    }

    pub fn dim(&self) -> (usize, usize, usize, usize) {
        match self {
            TensorViewMut4::F32(v) => v.dim(),
            TensorViewMut4::Bf16(v) => v.dim(),
        }
    }

    /// Down-cast and assign an f32 staging buffer into the output, in
    /// parallel. Shapes must already agree.
    pub(crate) fn assign_from_f32(&mut self, src: ArrayView4<'_, f32>) {
        match self {
            TensorViewMut4::F32(out) => {
                Zip::from(out).and(&src).par_for_each(|o, &x| *o = x);
            }
            TensorViewMut4::Bf16(out) => {
                Zip::from(out)
                    .and(&src)
                    .par_for_each(|o, &x| *o = bf16::from_f32(x));
            }
        }
    }
}

impl<'a> From<ArrayViewMut4<'a, f32>> for TensorViewMut4<'a> {
    fn from(v: ArrayViewMut4<'a, f32>) -> Self {
        TensorViewMut4::F32(v)
    }
}

impl<'a> From<ArrayViewMut4<'a, bf16>> for TensorViewMut4<'a> {
    fn from(v: ArrayViewMut4<'a, bf16>) -> Self {
        TensorViewMut4::Bf16(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;

    #[test]
    fn test_permuted_is_stride_only() {
        let a = Array4::<f32>::zeros((2, 3, 4, 5));
        let view = TensorView4::from(a.view()).permuted([0, 2, 1, 3]);
        assert_eq!(view.dim(), (2, 4, 3, 5));
    }

    #[test]
    fn test_assign_from_f32_downcasts() {
        let src = Array4::<f32>::from_elem((1, 1, 2, 2), 1.5);
        let mut dst = Array4::<bf16>::zeros((1, 1, 2, 2));
        TensorViewMut4::from(dst.view_mut()).assign_from_f32(src.view());
        assert_eq!(dst[[0, 0, 1, 1]], bf16::from_f32(1.5));
    }
}
