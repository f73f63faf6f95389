//! Error handling for the SVO build engine.
//!
//! Capacity overruns are deliberately *not* errors: they surface as
//! [`TruncationFlags`](crate::octree::TruncationFlags) on the build results so
//! callers can distinguish a clamped build from a failed one. Errors here are
//! reserved for protocol violations and readback failures.

use crate::octree::BuildState;

/// SVO engine result type
pub type SvoResult<T> = Result<T, SvoError>;

#[derive(Debug, thiserror::Error)]
pub enum SvoError {
    #[error("invalid build state transition: {from:?} -> {to:?}")]
    InvalidTransition { from: BuildState, to: BuildState },

    #[error("readback did not complete within {waited_ms}ms")]
    ReadbackTimedOut { waited_ms: u64 },

    #[error("no readback in flight")]
    NoReadbackInFlight,

    #[error("buffer mapping failed: {context}")]
    BufferMap { context: String },

    #[error("invalid configuration: {field}: {reason}")]
    InvalidConfig { field: &'static str, reason: String },
}

impl SvoError {
    pub(crate) fn buffer_map(context: impl Into<String>) -> Self {
        Self::BufferMap {
            context: context.into(),
        }
    }
}
