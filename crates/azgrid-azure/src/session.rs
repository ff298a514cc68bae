//! Token acquisition seam.
//!
//! OAuth flows are an external collaborator: the only contract the rest
//! of the system relies on is `token()` returning a current bearer
//! token. The provider is consulted on every request so rotated tokens
//! are picked up without restarting anything.

use std::sync::Arc;

/// Supplies the bearer token for management-plane requests.
pub trait SessionProvider: Send + Sync {
    fn token(&self) -> String;
}

pub type Session = Arc<dyn SessionProvider>;

/// A fixed token, mainly for tests and short-lived tooling.
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl SessionProvider for StaticToken {
    fn token(&self) -> String {
        self.0.clone()
    }
}

/// Reads the token from an environment variable on each call, so an
/// external refresher can rotate it in place.
pub struct EnvSession {
    var: String,
}

impl EnvSession {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl Default for EnvSession {
    fn default() -> Self {
        Self::new("AZURE_TOKEN")
    }
}

impl SessionProvider for EnvSession {
    fn token(&self) -> String {
        std::env::var(&self.var).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_token_returns_value() {
        let s = StaticToken::new("abc");
        assert_eq!(s.token(), "abc");
    }
}
