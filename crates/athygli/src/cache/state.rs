//! Per-layer KV-cache with beam-table indirection.
//!
//! Physical K/V rows are never shuffled across beams; a per-sequence table of
//! 4-byte lane indices redirects reads instead. Two identical table mirrors
//! are kept (one per cache half) so the in-place reorder gather can read one
//! mirror while writing the other.

use half::{bf16, f16};
use log::debug;
use ndarray::{s, Array2, Array4, ArrayView1, ArrayView4, ArrayView2, Axis};
use rayon::prelude::*;

use crate::common::error::{precondition, AttentionError, Result};
use crate::kernels::quant::{dequant_row_u8, quant_row_u8};
use crate::tensor::{AttnElem, ElemType, TensorView4};

/// Owned storage of one cache half, `[B, H_kv, capacity, S]`.
pub(crate) enum Slab {
    F32(Array4<f32>),
    F16(Array4<f16>),
    Bf16(Array4<bf16>),
    U8 {
        data: Array4<u8>,
        /// `[B, H_kv, capacity, 2]`: `(scale, zero_point)` per cached row.
        scale_zp: Array4<f32>,
    },
}

/// Read-only view of one cache half, sliced to the live prefix.
pub enum CacheView<'a> {
    F32(ArrayView4<'a, f32>),
    F16(ArrayView4<'a, f16>),
    Bf16(ArrayView4<'a, bf16>),
    U8 {
        data: ArrayView4<'a, u8>,
        scale_zp: ArrayView4<'a, f32>,
    },
}

impl<'a> CacheView<'a> {
    /// Read one stored `[S]` row into f32, dequantizing u8 storage through
    /// its `(scale, zero_point)` pair.
    pub fn read_row(&self, b: usize, h: usize, t: usize, out: &mut [f32]) {
        match self {
            CacheView::F32(v) => {
                for (o, &x) in out.iter_mut().zip(v.slice(s![b, h, t, ..]).iter()) {
                    *o = x;
                }
            }
            CacheView::F16(v) => {
                for (o, &x) in out.iter_mut().zip(v.slice(s![b, h, t, ..]).iter()) {
                    *o = x.to_f32();
                }
            }
            CacheView::Bf16(v) => {
                for (o, &x) in out.iter_mut().zip(v.slice(s![b, h, t, ..]).iter()) {
                    *o = x.to_f32();
                }
            }
            CacheView::U8 { data, scale_zp } => {
                let row = data.slice(s![b, h, t, ..]);
                let scale = scale_zp[[b, h, t, 0]];
                let zp = scale_zp[[b, h, t, 1]];
                dequant_row_u8(
                    row.to_slice().expect("cache rows are contiguous"),
                    out,
                    scale,
                    zp,
                );
            }
        }
    }
}

impl Slab {
    fn view(&self, len: usize) -> CacheView<'_> {
        match self {
            Slab::F32(a) => CacheView::F32(a.slice(s![.., .., ..len, ..])),
            Slab::F16(a) => CacheView::F16(a.slice(s![.., .., ..len, ..])),
            Slab::Bf16(a) => CacheView::Bf16(a.slice(s![.., .., ..len, ..])),
            Slab::U8 { data, scale_zp } => CacheView::U8 {
                data: data.slice(s![.., .., ..len, ..]),
                scale_zp: scale_zp.slice(s![.., .., ..len, ..]),
            },
        }
    }
}

/// Per-layer past-K/V state with geometric growth, beam reorder, reset, and
/// optional u8 packing.
pub struct KvCacheState {
    precision: ElemType,
    k: Option<Slab>,
    v: Option<Slab>,
    beam_k: Array2<i32>,
    beam_v: Array2<i32>,
    batch: usize,
    kv_heads: usize,
    head_size: usize,
    len: usize,
    capacity: usize,
    k_reset: bool,
    v_reset: bool,
}

impl KvCacheState {
    pub fn new(precision: ElemType) -> Self {
        Self {
            precision,
            k: None,
            v: None,
            beam_k: Array2::zeros((0, 0)),
            beam_v: Array2::zeros((0, 0)),
            batch: 0,
            kv_heads: 0,
            head_size: 0,
            len: 0,
            capacity: 0,
            k_reset: false,
            v_reset: false,
        }
    }

    /// Logical number of cached time steps (`L0` between appends).
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn batch(&self) -> usize {
        self.batch
    }

    pub fn kv_heads(&self) -> usize {
        self.kv_heads
    }

    pub fn head_size(&self) -> usize {
        self.head_size
    }

    pub fn precision(&self) -> ElemType {
        self.precision
    }

    /// Beam table sliced to the live prefix, `[B, len]`.
    ///
    /// Both mirrors are identical after every update; this returns the K
    /// mirror.
    pub fn beam_table(&self) -> ArrayView2<'_, i32> {
        self.beam_k.slice(s![.., ..self.len])
    }

    pub fn beam_table_k(&self) -> ArrayView2<'_, i32> {
        self.beam_k.slice(s![.., ..self.len])
    }

    pub fn beam_table_v(&self) -> ArrayView2<'_, i32> {
        self.beam_v.slice(s![.., ..self.len])
    }

    pub fn past_k(&self) -> Option<CacheView<'_>> {
        self.k.as_ref().map(|slab| slab.view(self.len))
    }

    pub fn past_v(&self) -> Option<CacheView<'_>> {
        self.v.as_ref().map(|slab| slab.view(self.len))
    }

    pub fn scale_zp_k(&self) -> Option<ArrayView4<'_, f32>> {
        match &self.k {
            Some(Slab::U8 { scale_zp, .. }) => {
                Some(scale_zp.slice(s![.., .., ..self.len, ..]))
            }
            _ => None,
        }
    }

    pub fn scale_zp_v(&self) -> Option<ArrayView4<'_, f32>> {
        match &self.v {
            Some(Slab::U8 { scale_zp, .. }) => {
                Some(scale_zp.slice(s![.., .., ..self.len, ..]))
            }
            _ => None,
        }
    }

    /// Drop the logical content but keep the allocation for reuse.
    ///
    /// Readers observe `len() == 0` immediately; the next append rebuilds the
    /// beam table from scratch and overwrites rows in place.
    pub fn reset(&mut self) {
        self.len = 0;
        self.k_reset = true;
        self.v_reset = true;
    }

    #[cfg(test)]
    pub(crate) fn force_reset_flags(&mut self, k: bool, v: bool) {
        self.k_reset = k;
        self.v_reset = v;
    }

    /// Absorb the current step into the cache.
    ///
    /// Either fully applied or rolled back: all validation and allocation
    /// happens before the first mutation.
    pub fn append(
        &mut self,
        cur_k: &TensorView4<'_>,
        cur_v: &TensorView4<'_>,
        beam_idx: Option<&ArrayView1<'_, i32>>,
    ) -> Result<()> {
        let (b, hk, l1, s) = cur_k.dim();
        precondition!(
            cur_v.dim() == cur_k.dim(),
            "current K {:?} and V {:?} shapes differ",
            cur_k.dim(),
            cur_v.dim()
        );
        precondition!(
            cur_v.elem_type() == cur_k.elem_type(),
            "current K and V precisions differ"
        );
        precondition!(
            b > 0 && hk > 0 && l1 > 0 && s > 0,
            "append with an empty step: [B={b}, H_kv={hk}, L1={l1}, S={s}]"
        );
        if let Some(idx) = beam_idx {
            precondition!(
                idx.len() == b,
                "beam_idx has {} lanes, current step has {}",
                idx.len(),
                b
            );
        }
        if self.k_reset != self.v_reset {
            return Err(AttentionError::CacheInconsistency(
                "K and V halves must be reset together".into(),
            ));
        }

        if self.len == 0 {
            self.start_fresh(cur_k, cur_v)?;
        } else if b != self.batch {
            self.expand_beams(cur_k, cur_v, beam_idx)?;
        } else {
            precondition!(
                hk == self.kv_heads && s == self.head_size,
                "step shape [H_kv={hk}, S={s}] does not match cache [H_kv={}, S={}]",
                self.kv_heads,
                self.head_size
            );
            if let Some(idx) = beam_idx {
                for (i, &lane) in idx.iter().enumerate() {
                    if lane < 0 || lane as usize >= self.batch {
                        return Err(AttentionError::CacheInconsistency(format!(
                            "beam_idx[{i}]={lane} out of range for batch {}",
                            self.batch
                        )));
                    }
                }
            }
            self.grow_if_needed(l1)?;
            self.update_beam_table(beam_idx, l1);
            self.write_step(cur_k, cur_v, self.len);
            self.len += l1;
        }

        self.k_reset = false;
        self.v_reset = false;
        Ok(())
    }

    /// First append, or first append after `reset()`: rebuild the beam table
    /// as identity and write the step at position zero, reusing the
    /// allocation when shapes still match.
    fn start_fresh(&mut self, cur_k: &TensorView4<'_>, cur_v: &TensorView4<'_>) -> Result<()> {
        let (b, hk, l1, s) = cur_k.dim();
        let reusable = self.k.is_some()
            && self.batch == b
            && self.kv_heads == hk
            && self.head_size == s
            && self.capacity >= l1;

        if !reusable {
            let capacity = 2 * l1;
            let new_k = alloc_slab(self.precision, b, hk, capacity, s)?;
            let new_v = alloc_slab(self.precision, b, hk, capacity, s)?;
            let beam_k = alloc_beam_table(b, capacity)?;
            let beam_v = alloc_beam_table(b, capacity)?;
            self.k = Some(new_k);
            self.v = Some(new_v);
            self.beam_k = beam_k;
            self.beam_v = beam_v;
            self.batch = b;
            self.kv_heads = hk;
            self.head_size = s;
            self.capacity = capacity;
            debug!(
                "kv-cache allocated: B={b} H_kv={hk} capacity={capacity} S={s} ({:?})",
                self.precision
            );
        }

        for bi in 0..b {
            self.beam_k.slice_mut(s![bi, ..l1]).fill(bi as i32);
            self.beam_v.slice_mut(s![bi, ..l1]).fill(bi as i32);
        }
        self.write_step(cur_k, cur_v, 0);
        self.len = l1;
        Ok(())
    }

    /// Batch change (beam expansion): gather the history of the selected
    /// source lanes into fresh buffers and rebuild the beam table as
    /// identity.
    fn expand_beams(
        &mut self,
        cur_k: &TensorView4<'_>,
        cur_v: &TensorView4<'_>,
        beam_idx: Option<&ArrayView1<'_, i32>>,
    ) -> Result<()> {
        let (b, hk, l1, s) = cur_k.dim();
        precondition!(
            hk == self.kv_heads && s == self.head_size,
            "step shape [H_kv={hk}, S={s}] does not match cache [H_kv={}, S={}]",
            self.kv_heads,
            self.head_size
        );
        let idx = beam_idx.ok_or_else(|| {
            AttentionError::Precondition(
                "batch change requires beam_idx to select source lanes".into(),
            )
        })?;

        let mut lanes = Vec::with_capacity(b);
        for (i, &lane) in idx.iter().enumerate() {
            if lane < 0 || lane as usize >= self.batch {
                return Err(AttentionError::CacheInconsistency(format!(
                    "beam_idx[{i}]={lane} out of range for prior batch {}",
                    self.batch
                )));
            }
            lanes.push(lane as usize);
        }

        let l0 = self.len;
        let capacity = 2 * (l0 + l1);
        debug!(
            "kv-cache beam expansion: B {}->{} L0={l0} capacity={capacity}",
            self.batch, b
        );

        let mut new_k = alloc_slab(self.precision, b, hk, capacity, s)?;
        let mut new_v = alloc_slab(self.precision, b, hk, capacity, s)?;
        let mut beam_k = alloc_beam_table(b, capacity)?;
        let mut beam_v = alloc_beam_table(b, capacity)?;

        if let (Some(old_k), Some(old_v)) = (&self.k, &self.v) {
            gather_history(old_k, &mut new_k, &self.beam_k, &lanes, l0);
            gather_history(old_v, &mut new_v, &self.beam_v, &lanes, l0);
        }
        for bi in 0..b {
            beam_k.slice_mut(s![bi, ..l0 + l1]).fill(bi as i32);
            beam_v.slice_mut(s![bi, ..l0 + l1]).fill(bi as i32);
        }

        self.k = Some(new_k);
        self.v = Some(new_v);
        self.beam_k = beam_k;
        self.beam_v = beam_v;
        self.batch = b;
        self.capacity = capacity;

        self.write_step(cur_k, cur_v, l0);
        self.len = l0 + l1;
        Ok(())
    }

    /// Double the capacity when the step no longer fits, preserving the live
    /// prefix. Readers pick up the new row stride from the published views.
    fn grow_if_needed(&mut self, l1: usize) -> Result<()> {
        if self.len + l1 <= self.capacity {
            return Ok(());
        }
        let capacity = 2 * (self.len + l1);
        debug!(
            "kv-cache growth: len={} capacity {}->{capacity}",
            self.len, self.capacity
        );

        let (b, hk, s) = (self.batch, self.kv_heads, self.head_size);
        let mut new_k = alloc_slab(self.precision, b, hk, capacity, s)?;
        let mut new_v = alloc_slab(self.precision, b, hk, capacity, s)?;
        let mut beam_k = alloc_beam_table(b, capacity)?;
        let mut beam_v = alloc_beam_table(b, capacity)?;

        if let (Some(old_k), Some(old_v)) = (&self.k, &self.v) {
            copy_prefix(old_k, &mut new_k, self.len);
            copy_prefix(old_v, &mut new_v, self.len);
        }
        beam_k
            .slice_mut(s![.., ..self.len])
            .assign(&self.beam_k.slice(s![.., ..self.len]));
        beam_v
            .slice_mut(s![.., ..self.len])
            .assign(&self.beam_v.slice(s![.., ..self.len]));

        self.k = Some(new_k);
        self.v = Some(new_v);
        self.beam_k = beam_k;
        self.beam_v = beam_v;
        self.capacity = capacity;
        Ok(())
    }

    /// Redirect history rows through `beam_idx` and append identity entries
    /// for the new step. Only 4-byte indices move; K/V rows stay in place.
    fn update_beam_table(&mut self, beam_idx: Option<&ArrayView1<'_, i32>>, l1: usize) {
        let l0 = self.len;

        if let Some(idx) = beam_idx {
            let identity = idx.iter().enumerate().all(|(i, &lane)| lane as usize == i);
            if !identity {
                // Gather one mirror from the other so the permutation never
                // reads rows it has already overwritten, then resync.
                for bi in 0..self.batch {
                    let src = idx[bi] as usize;
                    let (beam_k, beam_v) = (&mut self.beam_k, &self.beam_v);
                    beam_k
                        .slice_mut(s![bi, ..l0])
                        .assign(&beam_v.slice(s![src, ..l0]));
                }
                for bi in 0..self.batch {
                    let (beam_k, beam_v) = (&self.beam_k, &mut self.beam_v);
                    beam_v
                        .slice_mut(s![bi, ..l0])
                        .assign(&beam_k.slice(s![bi, ..l0]));
                }
            }
        }

        for bi in 0..self.batch {
            self.beam_k.slice_mut(s![bi, l0..l0 + l1]).fill(bi as i32);
            self.beam_v.slice_mut(s![bi, l0..l0 + l1]).fill(bi as i32);
        }
    }

    /// Write the current step into rows `l0 .. l0 + L1`, quantizing when the
    /// cache is u8.
    fn write_step(&mut self, cur_k: &TensorView4<'_>, cur_v: &TensorView4<'_>, l0: usize) {
        let k_slab = self.k.as_mut().expect("cache slabs exist before writes");
        write_half(k_slab, cur_k, l0);
        let v_slab = self.v.as_mut().expect("cache slabs exist before writes");
        write_half(v_slab, cur_v, l0);
    }
}

fn try_vec<E: Clone + Default>(n: usize, what: &'static str) -> Result<Vec<E>> {
    let mut v: Vec<E> = Vec::new();
    v.try_reserve_exact(n).map_err(|_| AttentionError::Allocation {
        what,
        bytes: n * std::mem::size_of::<E>(),
    })?;
    v.resize(n, E::default());
    Ok(v)
}

fn alloc_slab(
    precision: ElemType,
    b: usize,
    hk: usize,
    capacity: usize,
    s: usize,
) -> Result<Slab> {
    let shape = (b, hk, capacity, s);
    let n = b * hk * capacity * s;
    let slab = match precision {
        ElemType::F32 => Slab::F32(
            Array4::from_shape_vec(shape, try_vec(n, "kv-cache slab")?)
                .expect("vector length matches shape"),
        ),
        ElemType::F16 => Slab::F16(
            Array4::from_shape_vec(shape, try_vec(n, "kv-cache slab")?)
                .expect("vector length matches shape"),
        ),
        ElemType::Bf16 => Slab::Bf16(
            Array4::from_shape_vec(shape, try_vec(n, "kv-cache slab")?)
                .expect("vector length matches shape"),
        ),
        ElemType::U8 => Slab::U8 {
            data: Array4::from_shape_vec(shape, try_vec(n, "kv-cache slab")?)
                .expect("vector length matches shape"),
            scale_zp: Array4::from_shape_vec(
                (b, hk, capacity, 2),
                try_vec(b * hk * capacity * 2, "kv-cache scale/zp")?,
            )
            .expect("vector length matches shape"),
        },
    };
    Ok(slab)
}

fn alloc_beam_table(b: usize, capacity: usize) -> Result<Array2<i32>> {
    Ok(
        Array2::from_shape_vec((b, capacity), try_vec(b * capacity, "beam table")?)
            .expect("vector length matches shape"),
    )
}

fn copy_prefix(old: &Slab, new: &mut Slab, len: usize) {
    match (old, new) {
        (Slab::F32(o), Slab::F32(n)) => {
            n.slice_mut(s![.., .., ..len, ..])
                .assign(&o.slice(s![.., .., ..len, ..]));
        }
        (Slab::F16(o), Slab::F16(n)) => {
            n.slice_mut(s![.., .., ..len, ..])
                .assign(&o.slice(s![.., .., ..len, ..]));
        }
        (Slab::Bf16(o), Slab::Bf16(n)) => {
            n.slice_mut(s![.., .., ..len, ..])
                .assign(&o.slice(s![.., .., ..len, ..]));
        }
        (
            Slab::U8 {
                data: od,
                scale_zp: os,
            },
            Slab::U8 {
                data: nd,
                scale_zp: ns,
            },
        ) => {
            nd.slice_mut(s![.., .., ..len, ..])
                .assign(&od.slice(s![.., .., ..len, ..]));
            ns.slice_mut(s![.., .., ..len, ..])
                .assign(&os.slice(s![.., .., ..len, ..]));
        }
        _ => unreachable!("cache precision is fixed at construction"),
    }
}

/// `new[b, h, t] = old[old_beam[lanes[b], t], h, t]` for `t < len`.
fn gather_history(old: &Slab, new: &mut Slab, old_beam: &Array2<i32>, lanes: &[usize], len: usize) {
    match (old, new) {
        (Slab::F32(o), Slab::F32(n)) => gather_rows(o, n, old_beam, lanes, len),
        (Slab::F16(o), Slab::F16(n)) => gather_rows(o, n, old_beam, lanes, len),
        (Slab::Bf16(o), Slab::Bf16(n)) => gather_rows(o, n, old_beam, lanes, len),
        (
            Slab::U8 {
                data: od,
                scale_zp: os,
            },
            Slab::U8 {
                data: nd,
                scale_zp: ns,
            },
        ) => {
            gather_rows(od, nd, old_beam, lanes, len);
            gather_rows(os, ns, old_beam, lanes, len);
        }
        _ => unreachable!("cache precision is fixed at construction"),
    }
}

fn gather_rows<E: Copy + Send + Sync>(
    old: &Array4<E>,
    new: &mut Array4<E>,
    old_beam: &Array2<i32>,
    lanes: &[usize],
    len: usize,
) {
    let hk = old.dim().1;
    new.axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(bi, mut dst)| {
            let lane = lanes[bi];
            for hi in 0..hk {
                for ti in 0..len {
                    let src_b = old_beam[[lane, ti]] as usize;
                    dst.slice_mut(s![hi, ti, ..])
                        .assign(&old.slice(s![src_b, hi, ti, ..]));
                }
            }
        });
}

fn write_half(slab: &mut Slab, cur: &TensorView4<'_>, l0: usize) {
    match cur {
        TensorView4::F32(view) => write_typed(slab, view, l0),
        TensorView4::Bf16(view) => write_typed(slab, view, l0),
    }
}

fn write_typed<T: AttnElem>(slab: &mut Slab, cur: &ArrayView4<'_, T>, l0: usize) {
    let (_, _, l1, _) = cur.dim();
    match slab {
        Slab::F32(a) => {
            let mut dst = a.slice_mut(s![.., .., l0..l0 + l1, ..]);
            ndarray::Zip::from(&mut dst)
                .and(cur)
                .par_for_each(|d, &x| *d = x.to_f32());
        }
        Slab::F16(a) => {
            let mut dst = a.slice_mut(s![.., .., l0..l0 + l1, ..]);
            ndarray::Zip::from(&mut dst)
                .and(cur)
                .par_for_each(|d, &x| *d = f16::from_f32(x.to_f32()));
        }
        Slab::Bf16(a) => {
            let mut dst = a.slice_mut(s![.., .., l0..l0 + l1, ..]);
            ndarray::Zip::from(&mut dst)
                .and(cur)
                .par_for_each(|d, &x| *d = bf16::from_f32(x.to_f32()));
        }
        Slab::U8 { data, scale_zp } => {
            let (_, hk, _, _) = cur.dim();
            let mut data = data.slice_mut(s![.., .., l0..l0 + l1, ..]);
            let mut sz = scale_zp.slice_mut(s![.., .., l0..l0 + l1, ..]);
            data.axis_iter_mut(Axis(0))
                .into_par_iter()
                .zip(sz.axis_iter_mut(Axis(0)).into_par_iter())
                .enumerate()
                .for_each(|(bi, (mut db, mut szb))| {
                    for hi in 0..hk {
                        for ti in 0..l1 {
                            let src_row = cur.slice(s![bi, hi, ti, ..]);
                            let mut dst_row = db.slice_mut(s![hi, ti, ..]);
                            let dst = dst_row
                                .as_slice_mut()
                                .expect("cache rows are contiguous");
                            let (scale, zp) = match src_row.as_slice() {
                                Some(row) => quant_row_u8(row, dst),
                                None => {
                                    let tmp: Vec<T> = src_row.iter().copied().collect();
                                    quant_row_u8(&tmp, dst)
                                }
                            };
                            szb[[hi, ti, 0]] = scale;
                            szb[[hi, ti, 1]] = zp;
                        }
                    }
                });
        }
    }
}
