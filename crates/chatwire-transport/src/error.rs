//! Transport error types.

use std::time::Duration;

use chatwire_core::RunId;
use thiserror::Error;

/// A result type using `TransportError`.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors surfaced by the connection manager, the request client and the correlator.
///
/// Protocol-level decode failures are not part of this enum; they are logged and
/// dropped inside the connection manager (see [`crate::protocol::FrameError`]).
#[derive(Debug, Error)]
pub enum TransportError {
    /// Opening the socket failed.
    #[error("connection failed: {0}")]
    Connection(String),

    /// Writing a frame to an open socket failed.
    #[error("send failed: {0}")]
    Send(String),

    /// The connection did not reach `Open` within the wait-until-open bound.
    #[error("connection not open after {0:?}")]
    OpenTimeout(Duration),

    /// The connection manager has shut down.
    #[error("connection manager closed")]
    Closed,

    /// A REST request failed below the application layer.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// A REST response could not be decoded into the expected envelope.
    #[error("failed to decode response ({status}): {message}")]
    Decode {
        /// HTTP status of the response.
        status: u16,
        /// Decoder message.
        message: String,
    },

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A header value (usually the access token) is not a valid HTTP header value.
    #[error("invalid header value: {0}")]
    InvalidHeader(#[from] reqwest::header::InvalidHeaderValue),

    /// The access token was rejected by the server.
    #[error("access token expired")]
    AuthExpired,

    /// The call was cancelled through its cancellation token.
    #[error("cancelled")]
    Cancelled,

    /// No answer slot exists for the run.
    #[error("unknown run: {0}")]
    UnknownRun(RunId),
}

impl TransportError {
    /// Returns true if this error is a transport-level failure worth retrying.
    ///
    /// Application errors travel inside successful envelopes and never reach this
    /// classification.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Http(e) => !e.is_builder() && !e.is_decode(),
            Self::Connection(_) | Self::Send(_) | Self::OpenTimeout(_) => true,
            Self::Closed
            | Self::Decode { .. }
            | Self::Json(_)
            | Self::InvalidHeader(_)
            | Self::AuthExpired
            | Self::Cancelled
            | Self::UnknownRun(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_failures_are_retriable() {
        assert!(TransportError::Connection("refused".into()).is_retriable());
        assert!(TransportError::Send("broken pipe".into()).is_retriable());
        assert!(TransportError::OpenTimeout(Duration::from_secs(8)).is_retriable());
    }

    #[test]
    fn non_transport_failures_are_not_retriable() {
        assert!(!TransportError::AuthExpired.is_retriable());
        assert!(!TransportError::Cancelled.is_retriable());
        assert!(!TransportError::Closed.is_retriable());
        assert!(!TransportError::Decode {
            status: 200,
            message: "expected value".into()
        }
        .is_retriable());
    }
}
