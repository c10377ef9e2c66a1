//! Engine-level failure taxonomy.
//!
//! Item-level failures never abort a pass; the reconciler records them and
//! continues. Pass-level failures abort before the cursor commit so the
//! same changes replay next tick. The mapping from collaborator errors to
//! these classes is what the retry and abort decisions key on.

use thiserror::Error;
use tidesync_crypto::CryptoError;
use tidesync_delta::DeltaError;
use tidesync_store::StoreError;
use tidesync_transport::TransportError;
use tidesync_watch::WatchError;

/// Engine errors, one variant per failure class.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Required server URL or device credentials missing; the engine
    /// refuses to start.
    #[error("not configured: {0}")]
    NotConfigured(String),

    /// Token rejected and refresh failed; retries pause until the user
    /// re-authenticates.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Network or 5xx failure; retryable with backoff.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed response, unknown algorithm, unsupported version; fatal
    /// for the item.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// AEAD tag, plaintext hash, or reconstructed delta hash mismatch;
    /// fatal for the item, never retried with the same data.
    #[error("integrity error: {0}")]
    Integrity(String),

    /// Divergence detected; routed through the conflict handler rather
    /// than failing an operation.
    #[error("conflict on {0}")]
    Conflict(String),

    /// Local filesystem failure.
    #[error("local I/O error: {0}")]
    LocalIo(String),

    /// Excluded path or size cap; skipped silently with an activity
    /// entry, not an error in the failure sense.
    #[error("policy reject: {0}")]
    PolicyReject(String),

    /// State store failure.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Operation invalid in the current engine state.
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl EngineError {
    /// Whether a retry with backoff is worthwhile.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::LocalIo(_))
    }

    /// Whether the failure is fatal for the item but not the pass.
    #[must_use]
    pub fn is_item_fatal(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::Integrity(_) | Self::PolicyReject(_))
    }
}

impl From<TransportError> for EngineError {
    fn from(e: TransportError) -> Self {
        match &e {
            TransportError::Auth(message) => Self::Auth(message.clone()),
            TransportError::Network(_) => Self::Transport(e.to_string()),
            TransportError::Http { .. } if e.is_retryable() => Self::Transport(e.to_string()),
            TransportError::Http { .. } => Self::Protocol(e.to_string()),
            TransportError::Protocol(message) => Self::Protocol(message.clone()),
        }
    }
}

impl From<CryptoError> for EngineError {
    fn from(e: CryptoError) -> Self {
        match &e {
            CryptoError::Aead
            | CryptoError::Integrity { .. }
            | CryptoError::WrongPassword => Self::Integrity(e.to_string()),
            CryptoError::UnknownAlgorithm(_) | CryptoError::Malformed(_) => {
                Self::Protocol(e.to_string())
            }
            CryptoError::Io(_) => Self::LocalIo(e.to_string()),
            _ => Self::Protocol(e.to_string()),
        }
    }
}

impl From<DeltaError> for EngineError {
    fn from(e: DeltaError) -> Self {
        match &e {
            DeltaError::HashMismatch { .. } => Self::Integrity(e.to_string()),
            DeltaError::Io(_) => Self::LocalIo(e.to_string()),
            _ => Self::Protocol(e.to_string()),
        }
    }
}

impl From<WatchError> for EngineError {
    fn from(e: WatchError) -> Self {
        Self::LocalIo(e.to_string())
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        Self::LocalIo(e.to_string())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_mapping() {
        let e: EngineError = TransportError::Network("reset".into()).into();
        assert!(matches!(e, EngineError::Transport(_)));
        assert!(e.is_retryable());

        let e: EngineError =
            TransportError::Http { status: 503, message: String::new() }.into();
        assert!(e.is_retryable());

        let e: EngineError =
            TransportError::Http { status: 400, message: String::new() }.into();
        assert!(matches!(e, EngineError::Protocol(_)));
        assert!(!e.is_retryable());

        let e: EngineError = TransportError::Auth("rejected".into()).into();
        assert!(matches!(e, EngineError::Auth(_)));
    }

    #[test]
    fn test_crypto_mapping() {
        let e: EngineError = CryptoError::Aead.into();
        assert!(matches!(e, EngineError::Integrity(_)));
        assert!(e.is_item_fatal());

        let e: EngineError = CryptoError::UnknownAlgorithm("x".into()).into();
        assert!(matches!(e, EngineError::Protocol(_)));
    }

    #[test]
    fn test_delta_mapping() {
        let e: EngineError = DeltaError::HashMismatch {
            expected: "a".into(),
            actual: "b".into(),
        }
        .into();
        assert!(matches!(e, EngineError::Integrity(_)));
        assert!(!e.is_retryable());
    }
}
