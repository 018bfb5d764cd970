//! Credential provider
//!
//! Owns the raw token and its auth prefix. The REST layer invalidates the
//! token on 401/403 so later calls fail fast instead of hammering the API.

use std::sync::RwLock;

/// Thread-safe holder for the API credential.
#[derive(Debug)]
pub struct TokenProvider {
    prefix: String,
    token: RwLock<Option<String>>,
}

impl TokenProvider {
    /// Create a provider with a token and prefix (`"Bot"` or `"Bearer"`).
    pub fn new(prefix: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            token: RwLock::new(Some(token.into())),
        }
    }

    /// Create a provider with no token yet.
    pub fn empty(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            token: RwLock::new(None),
        }
    }

    /// The auth prefix this provider was built with.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The raw token, if one is set.
    pub fn raw(&self) -> Option<String> {
        self.token.read().expect("token lock poisoned").clone()
    }

    /// The full `Authorization` header value, if a token is set.
    pub fn authorization(&self) -> Option<String> {
        self.raw().map(|t| format!("{} {}", self.prefix, t))
    }

    /// Install a new token.
    pub fn replace(&self, token: impl Into<String>) {
        *self.token.write().expect("token lock poisoned") = Some(token.into());
    }

    /// Clear the token. Later calls needing auth fail immediately.
    pub fn invalidate(&self) {
        *self.token.write().expect("token lock poisoned") = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authorization_header() {
        let provider = TokenProvider::new("Bot", "abc123");
        assert_eq!(provider.authorization().as_deref(), Some("Bot abc123"));
    }

    #[test]
    fn test_invalidate_clears_token() {
        let provider = TokenProvider::new("Bot", "abc123");
        provider.invalidate();
        assert!(provider.authorization().is_none());
        assert!(provider.raw().is_none());
    }

    #[test]
    fn test_replace_after_invalidate() {
        let provider = TokenProvider::empty("Bearer");
        assert!(provider.authorization().is_none());
        provider.replace("xyz");
        assert_eq!(provider.authorization().as_deref(), Some("Bearer xyz"));
    }
}
