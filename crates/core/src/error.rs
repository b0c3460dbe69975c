//! Error taxonomy shared by the registry, the relay pumps and upstream adapters.

use thiserror::Error;

/// Every failure the relay can observe, classified by how it is recovered.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Malformed envelope, unknown type, or missing/mistyped payload.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// A payload exceeded its configured cap.
    #[error("{0}")]
    SizeLimitExceeded(String),

    /// An upstream send did not complete within its deadline.
    #[error("Request timeout")]
    Timeout,

    /// The upstream session signalled quota or rate-limit exhaustion.
    #[error("Upstream capacity exhausted: {0}")]
    UpstreamCapacity(String),

    /// Either transport has already gone away.
    #[error("Transport closed")]
    TransportClosed,

    /// A session id did not match the UUIDv4 pattern.
    #[error("Invalid session ID format")]
    InvalidSessionId,

    /// Anything else. Aborts the relay.
    #[error(transparent)]
    Unclassified(#[from] anyhow::Error),
}

impl RelayError {
    /// Classifies a free-form upstream error message.
    ///
    /// The live API reports capacity problems and disconnects only as text
    /// (close reasons, status strings), so the classification is by substring.
    pub fn from_upstream_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let lowered = message.to_lowercase();
        if lowered.contains("quota")
            || lowered.contains("rate limit")
            || lowered.contains("resource exhausted")
            || lowered.contains("resource_exhausted")
        {
            RelayError::UpstreamCapacity(message)
        } else if lowered.contains("connection closed") {
            RelayError::TransportClosed
        } else {
            RelayError::Unclassified(anyhow::anyhow!(message))
        }
    }

    /// True for errors answered with an error frame while the pump keeps running.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            RelayError::InvalidMessage(_)
                | RelayError::SizeLimitExceeded(_)
                | RelayError::Timeout
                | RelayError::UpstreamCapacity(_)
        )
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::InvalidMessage(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for RelayError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        RelayError::Timeout
    }
}
