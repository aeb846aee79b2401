//! Error types for streaming sessions.

use thiserror::Error;

use crate::transport::TransferStatus;

/// Failure reported by a transport collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("device disconnected")]
    Disconnected,

    #[error("transfer status {0}")]
    Status(TransferStatus),

    #[error("wait interrupted twice in a row")]
    Interrupted,

    #[error("{0}")]
    Other(String),
}

/// Fatal outcome of a streaming session.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("configuration failed: {context}: {source}")]
    Configuration {
        context: &'static str,
        source: TransportError,
    },

    #[error("cannot allocate {slots} transfers of {buffer_len} bytes")]
    Allocation { slots: usize, buffer_len: usize },

    #[error("submitting transfer {slot} failed: {source}")]
    Submission { slot: usize, source: TransportError },

    #[error("transport failed: {0}")]
    Transport(TransportError),

    #[error("no transfer completed within {timeout_ms} ms")]
    LivenessTimeout { timeout_ms: u64 },
}

impl StreamError {
    /// True when the session ended without a device or host fault.
    pub fn is_graceful(&self) -> bool {
        matches!(self, StreamError::LivenessTimeout { .. })
    }
}
