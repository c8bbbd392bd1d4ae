//! User-facing notices.
//!
//! The UI decides how to show these (a transient toast in the mobile client). Everything
//! not listed here stays invisible to the user.

use std::fmt;

/// A notice the transport wants shown to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// The server reported an application error inside an envelope.
    ApplicationError {
        /// Application code (≥ 400).
        code: i64,
        /// Server-provided message.
        message: String,
    },
    /// The access token was rejected; the user has to log in again.
    AuthExpired,
    /// The streaming connection failed and could not be recovered automatically.
    ConnectionError {
        /// Failure description.
        message: String,
    },
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ApplicationError { message, .. } if !message.is_empty() => f.write_str(message),
            Self::ApplicationError { code, .. } => write!(f, "Request failed ({code})"),
            Self::AuthExpired => f.write_str("Login expired, please sign in again"),
            Self::ConnectionError { .. } => f.write_str("Connection error, please retry"),
        }
    }
}

/// Receiver of user-facing notices. Must not block.
pub trait Notifier: Send + Sync {
    /// Show `notice` to the user.
    fn notify(&self, notice: Notice);
}

/// Notifier that only logs.
///
/// Used when no UI is attached.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notice: Notice) {
        tracing::warn!(notice = ?notice, "{notice}");
    }
}

/// Notifier that records every notice, for assertions in tests.
#[cfg(any(test, feature = "test-utils"))]
#[derive(Debug, Clone, Default)]
pub struct RecordingNotifier {
    notices: std::sync::Arc<parking_lot::Mutex<Vec<Notice>>>,
}

#[cfg(any(test, feature = "test-utils"))]
impl RecordingNotifier {
    /// Create an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All notices received so far.
    #[must_use]
    pub fn notices(&self) -> Vec<Notice> {
        self.notices.lock().clone()
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl Notifier for RecordingNotifier {
    fn notify(&self, notice: Notice) {
        self.notices.lock().push(notice);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn application_error_prefers_server_message() {
        let notice = Notice::ApplicationError {
            code: 400,
            message: "title too long".into(),
        };
        assert_eq!(notice.to_string(), "title too long");

        let notice = Notice::ApplicationError {
            code: 500,
            message: String::new(),
        };
        assert_eq!(notice.to_string(), "Request failed (500)");
    }

    #[test]
    fn recording_notifier_collects() {
        let recorder = RecordingNotifier::new();
        recorder.notify(Notice::AuthExpired);
        assert_eq!(recorder.notices(), vec![Notice::AuthExpired]);
    }
}
