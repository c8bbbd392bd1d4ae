//! Access-token seam.
//!
//! The transport never owns credentials. It asks a [`TokenProvider`] for the current
//! access token whenever it opens a socket, encodes a command or builds a request, and
//! tells it to invalidate the token when the server rejects it.

use std::sync::Arc;

use parking_lot::RwLock;

/// Source of the current access token.
pub trait TokenProvider: Send + Sync {
    /// Current access token, if the user is logged in.
    fn access_token(&self) -> Option<String>;

    /// Drop the current token after the server rejected it.
    fn invalidate(&self) {}
}

/// A fixed token that never changes.
#[derive(Debug, Clone)]
pub struct StaticToken(String);

impl StaticToken {
    /// Create a provider that always returns `token`.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl TokenProvider for StaticToken {
    fn access_token(&self) -> Option<String> {
        Some(self.0.clone())
    }
}

/// A token slot shared with the login flow.
///
/// Cloning shares the slot; `set` after a refresh is visible to every clone.
#[derive(Debug, Clone, Default)]
pub struct SharedToken {
    inner: Arc<RwLock<Option<String>>>,
}

impl SharedToken {
    /// Create an empty slot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a slot holding `token`.
    #[must_use]
    pub fn with_token(token: impl Into<String>) -> Self {
        let shared = Self::new();
        shared.set(token);
        shared
    }

    /// Replace the stored token.
    pub fn set(&self, token: impl Into<String>) {
        *self.inner.write() = Some(token.into());
    }

    /// Returns true if a token is stored.
    #[must_use]
    pub fn is_logged_in(&self) -> bool {
        self.inner.read().is_some()
    }
}

impl TokenProvider for SharedToken {
    fn access_token(&self) -> Option<String> {
        self.inner.read().clone()
    }

    fn invalidate(&self) {
        if self.inner.write().take().is_some() {
            tracing::info!("Access token invalidated");
        }
    }
}

/// Current token or the empty string; the server rejects the latter itself.
pub(crate) fn current_token(provider: &dyn TokenProvider) -> String {
    provider.access_token().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_token_ignores_invalidate() {
        let token = StaticToken::new("abc");
        token.invalidate();
        assert_eq!(token.access_token().as_deref(), Some("abc"));
    }

    #[test]
    fn shared_token_visible_across_clones() {
        let token = SharedToken::new();
        let clone = token.clone();
        assert!(!clone.is_logged_in());

        token.set("fresh");
        assert_eq!(clone.access_token().as_deref(), Some("fresh"));

        clone.invalidate();
        assert!(!token.is_logged_in());
        assert_eq!(current_token(&token), "");
    }
}
