//! Authentication capability consumed by the connection.
//!
//! Token acquisition and renewal live outside the connection core; the core
//! only asks for a valid token on connect and a renewed one after a token
//! error.

use std::fmt;
use std::sync::Arc;

use crate::error::ErrorInfo;

/// Access token presented when opening a transport
#[derive(Clone, PartialEq, Eq)]
pub struct Token {
    pub token: String,
    /// Expiry as milliseconds since the Unix epoch, when known
    pub expires: Option<u64>,
}

impl Token {
    pub fn new(token: impl Into<String>) -> Self {
        Token {
            token: token.into(),
            expires: None,
        }
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never log the secret itself
        f.debug_struct("Token")
            .field("token", &"<redacted>")
            .field("expires", &self.expires)
            .finish()
    }
}

#[async_trait::async_trait]
pub trait AuthProvider: Send + Sync + 'static {
    /// A token that is valid now, obtaining one if necessary
    async fn current_token(&self) -> Result<Option<Token>, ErrorInfo>;

    /// Discard the current token and obtain a new one
    async fn renew_token(&self) -> Result<Option<Token>, ErrorInfo>;

    /// Whether `renew_token` can produce a different token
    fn is_token_renewable(&self) -> bool;
}

pub type ArcAuthProvider = Arc<dyn AuthProvider>;

/// Fixed credentials (API key auth or a single pre-issued token)
#[derive(Debug, Clone, Default)]
pub struct StaticAuth {
    token: Option<Token>,
}

impl StaticAuth {
    pub fn anonymous() -> Self {
        StaticAuth { token: None }
    }

    pub fn with_token(token: Token) -> Self {
        StaticAuth { token: Some(token) }
    }
}

#[async_trait::async_trait]
impl AuthProvider for StaticAuth {
    async fn current_token(&self) -> Result<Option<Token>, ErrorInfo> {
        Ok(self.token.clone())
    }

    async fn renew_token(&self) -> Result<Option<Token>, ErrorInfo> {
        Ok(self.token.clone())
    }

    fn is_token_renewable(&self) -> bool {
        false
    }
}
