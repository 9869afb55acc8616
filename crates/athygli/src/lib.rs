//! CPU execution engine for scaled dot-product attention.
//!
//! This crate provides the attention compute kernels (prefill and
//! incremental), the KV-cache state machine behind beam-search decoding, and
//! the dispatcher that picks a kernel per runtime shape and precision. It
//! owns no model weights and no graph: callers hand in projected Q/K/V views
//! and get the attention output back.

pub mod attention;
pub mod cache;
pub mod common;
pub mod kernels;
pub mod ops;
pub mod tensor;

// Re-export commonly used items
pub use crate::{
    attention::{AttentionInputs, AttnMask, KernelStrategy, Sdpa, SdpaConfig},
    cache::{CacheView, KvCacheState},
    common::AttentionError,
    tensor::{ElemType, TensorView4, TensorViewMut4},
};

// Prelude for easy imports
pub mod prelude {
    pub use crate::attention::{AttentionInputs, AttnMask, Sdpa, SdpaConfig};
    pub use crate::cache::KvCacheState;
    pub use crate::common::AttentionError;
    pub use crate::tensor::{ElemType, TensorView4, TensorViewMut4};
}
