//! Error types for the attention engine.

use thiserror::Error;

use crate::tensor::ElemType;

/// Errors reported by the attention engine.
///
/// All variants are fatal to the current call and recoverable at the caller;
/// no partial effects persist on the caller's tensors and KV-cache appends are
/// applied transactionally.
#[derive(Debug, Error)]
pub enum AttentionError {
    /// Shape, precision, or configuration combination is unsupported.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// No matmul backend on this machine matches the requested precision.
    #[error("no matmul backend for {requested:?}: {detail}")]
    BackendUnavailable {
        requested: ElemType,
        detail: String,
    },

    /// Scratch or cache growth failed.
    #[error("failed to allocate {what} ({bytes} bytes)")]
    Allocation { what: &'static str, bytes: usize },

    /// Beam index out of range, or K/V cache halves disagree.
    #[error("kv-cache inconsistency: {0}")]
    CacheInconsistency(String),
}

pub type Result<T, E = AttentionError> = std::result::Result<T, E>;

/// Bail with [`AttentionError::Precondition`] when `cond` does not hold.
macro_rules! precondition {
    ($cond:expr, $($arg:tt)+) => {
        if !($cond) {
            return Err($crate::common::error::AttentionError::Precondition(
                format!($($arg)+),
            ));
        }
    };
}
pub(crate) use precondition;
