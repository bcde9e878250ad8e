//! Shared-secret bearer auth for the worker control plane.
//!
//! Tokens come from one process-wide configuration value and are immutable
//! after startup. An empty set disables auth entirely (development mode).

use axum::http::HeaderMap;
use std::collections::HashSet;

#[derive(Debug, Clone, Default)]
pub struct AuthTokens {
    tokens: HashSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    MissingBearer,
    InvalidToken,
}

impl AuthTokens {
    /// Parse the configured token list: comma-separated entries, each either
    /// a bare token or a `name:token` pair (the name is ignored; only token
    /// values are matched).
    pub fn parse(raw: &str) -> Self {
        let mut tokens = HashSet::new();
        for entry in raw.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let token = match entry.split_once(':') {
                Some((_, token)) => token.trim(),
                None => entry,
            };
            if !token.is_empty() {
                tokens.insert(token.to_string());
            }
        }
        Self { tokens }
    }

    pub fn is_enabled(&self) -> bool {
        !self.tokens.is_empty()
    }

    /// Check the `Authorization: Bearer` header. `Ok` when auth is disabled
    /// or the token matches.
    pub fn verify(&self, headers: &HeaderMap) -> Result<(), AuthError> {
        if !self.is_enabled() {
            return Ok(());
        }

        let auth = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let Some(token) = auth.strip_prefix("Bearer ") else {
            return Err(AuthError::MissingBearer);
        };

        let token = token.trim();
        if token.is_empty() || !self.tokens.contains(token) {
            return Err(AuthError::InvalidToken);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header::AUTHORIZATION;

    fn headers_with(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, value.parse().unwrap());
        headers
    }

    #[test]
    fn empty_config_disables_auth() {
        let auth = AuthTokens::parse("");
        assert!(!auth.is_enabled());
        assert!(auth.verify(&HeaderMap::new()).is_ok());
    }

    #[test]
    fn parses_named_and_bare_tokens() {
        let auth = AuthTokens::parse("ci:secret-a, secret-b ,, ops: secret-c");
        assert!(auth.verify(&headers_with("Bearer secret-a")).is_ok());
        assert!(auth.verify(&headers_with("Bearer secret-b")).is_ok());
        assert!(auth.verify(&headers_with("Bearer secret-c")).is_ok());
    }

    #[test]
    fn rejects_missing_and_wrong_tokens() {
        let auth = AuthTokens::parse("secret");
        assert_eq!(
            auth.verify(&HeaderMap::new()),
            Err(AuthError::MissingBearer)
        );
        assert_eq!(
            auth.verify(&headers_with("Bearer nope")),
            Err(AuthError::InvalidToken)
        );
        assert_eq!(
            auth.verify(&headers_with("Basic secret")),
            Err(AuthError::MissingBearer)
        );
    }
}
