//! Safe matrix-multiplication entry points used by the attention kernels.

pub(crate) mod matmul;
