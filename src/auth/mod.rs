//! Authentication module
//!
//! Supplies the bearer token attached to Graph requests. Acquiring the token
//! (device code flow, refresh) happens outside this crate; providers here
//! only hand out a token that already exists.
//!
//! # Example
//!
//! ```
//! use tsubame_mailr::auth::{StaticToken, TokenProvider};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let provider = StaticToken::new("eyJ0eXAi...");
//! let token = provider.token().await?;
//! assert_eq!(token, "eyJ0eXAi...");
//! # Ok(())
//! # }
//! ```

use crate::config::AuthConfig;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Default environment variable holding the access token
pub const DEFAULT_TOKEN_ENV: &str = "GRAPH_ACCESS_TOKEN";

/// Authentication errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Missing access token: {0}")]
    MissingToken(String),

    #[error("Invalid access token: {0}")]
    InvalidToken(String),
}

/// Bearer token provider
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Return a bearer token for the next request
    async fn token(&self) -> Result<String, AuthError>;
}

/// Token fixed at construction
#[derive(Clone)]
pub struct StaticToken {
    token: String,
}

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl std::fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticToken")
            .field("token", &"<redacted>")
            .finish()
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn token(&self) -> Result<String, AuthError> {
        validate_token(&self.token)?;
        Ok(self.token.clone())
    }
}

/// Token read from an environment variable on every call, so an external
/// refresher can rotate it
#[derive(Debug, Clone)]
pub struct EnvToken {
    var: String,
}

impl EnvToken {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }

    pub fn var(&self) -> &str {
        &self.var
    }
}

impl Default for EnvToken {
    fn default() -> Self {
        Self::new(DEFAULT_TOKEN_ENV)
    }
}

#[async_trait]
impl TokenProvider for EnvToken {
    async fn token(&self) -> Result<String, AuthError> {
        let token = std::env::var(&self.var)
            .map_err(|_| AuthError::MissingToken(format!("{} not set", self.var)))?;
        validate_token(&token)?;
        Ok(token)
    }
}

/// Build the provider described by the auth configuration.
///
/// An explicit `access_token` wins; otherwise the token is read from
/// `token_env`.
pub fn provider_from_config(config: &AuthConfig) -> Arc<dyn TokenProvider> {
    match config.access_token.as_deref() {
        Some(token) if !token.trim().is_empty() && !token.starts_with("${") => {
            Arc::new(StaticToken::new(token))
        }
        _ => Arc::new(EnvToken::new(config.token_env.clone())),
    }
}

fn validate_token(token: &str) -> Result<(), AuthError> {
    if token.trim().is_empty() {
        return Err(AuthError::MissingToken("token is empty".into()));
    }
    if token.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(AuthError::InvalidToken(
            "token contains whitespace or control characters".into(),
        ));
    }
    Ok(())
}
