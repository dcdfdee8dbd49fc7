//! Error Module
//!
//! Consumer-facing `ErrorInfo` plus the internal error type returned while
//! executing connection commands.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Error codes used by the connection core
pub mod codes {
    pub const BAD_REQUEST: u32 = 40000;
    pub const TOKEN_ERROR_MIN: u32 = 40140;
    pub const TOKEN_ERROR_MAX: u32 = 40149;
    pub const TOKEN_EXPIRED: u32 = 40142;
    pub const INTERNAL_ERROR: u32 = 50000;
    pub const TIMEOUT: u32 = 50003;
    pub const CONNECTION_FAILED: u32 = 80000;
    pub const CONNECTION_SUSPENDED: u32 = 80002;
    pub const CONNECTION_DISCONNECTED: u32 = 80003;
    pub const CONNECTION_CLOSED: u32 = 80017;
    pub const NOT_CONNECTED: u32 = 80019;
    pub const CONNECT_TIMEOUT: u32 = 80014;
    pub const PING_TIMEOUT: u32 = 80020;
    pub const TRANSPORT_ERROR: u32 = 80021;
}

/// Error details surfaced to library consumers.
///
/// Carried by state-change events, failed acknowledgements, failed pings and
/// inbound `Error` / `Disconnected` protocol messages.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[error("{message} (code: {code}, status: {status_code})")]
pub struct ErrorInfo {
    pub code: u32,
    pub status_code: u16,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<ErrorInfo>>,
}

impl ErrorInfo {
    pub fn new(code: u32, status_code: u16, message: impl Into<String>) -> Self {
        ErrorInfo {
            code,
            status_code,
            message: message.into(),
            cause: None,
        }
    }

    /// Attach a nested cause
    pub fn with_cause(mut self, cause: ErrorInfo) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn not_connected() -> Self {
        Self::new(codes::NOT_CONNECTED, 400, "not connected")
    }

    pub fn disconnected() -> Self {
        Self::new(codes::CONNECTION_DISCONNECTED, 503, "disconnected")
    }

    pub fn suspended() -> Self {
        Self::new(codes::CONNECTION_SUSPENDED, 503, "suspended")
    }

    pub fn closed() -> Self {
        Self::new(codes::CONNECTION_CLOSED, 400, "closed")
    }

    pub fn failed() -> Self {
        Self::new(codes::CONNECTION_FAILED, 500, "failed")
    }

    pub fn connect_timeout() -> Self {
        Self::new(codes::CONNECT_TIMEOUT, 504, "connect timeout")
    }

    pub fn ping_timeout() -> Self {
        Self::new(
            codes::PING_TIMEOUT,
            504,
            "unable to ping service — request timed out",
        )
    }

    pub fn unknown() -> Self {
        Self::new(codes::INTERNAL_ERROR, 500, "unknown error")
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(codes::TRANSPORT_ERROR, 503, message)
    }

    /// Token errors are in the 40140..=40149 range
    pub fn is_token_error(&self) -> bool {
        (codes::TOKEN_ERROR_MIN..=codes::TOKEN_ERROR_MAX).contains(&self.code)
    }

    /// Server-side errors that warrant retrying against a fallback host
    pub fn is_retryable(&self) -> bool {
        (500..=504).contains(&self.status_code)
    }
}

/// Errors produced while executing a connection command.
///
/// These never reach library consumers directly: the workflow loop logs them
/// and moves on to the next command.
#[derive(Error, Debug)]
pub enum RealtimeError {
    #[error("Transport error: {0}")]
    Transport(ErrorInfo),
    #[error("Authentication failed: {0}")]
    Auth(ErrorInfo),
    #[error("Codec error: {0}")]
    Codec(String),
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Command queue is closed")]
    QueueClosed,
    #[error("Invalid command: {0}")]
    InvalidCommand(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RealtimeError {
    /// Consumer-facing view of this error
    pub fn to_error_info(&self) -> ErrorInfo {
        match self {
            RealtimeError::Transport(info) | RealtimeError::Auth(info) => info.clone(),
            RealtimeError::Config(msg) => ErrorInfo::new(codes::BAD_REQUEST, 400, msg.clone()),
            other => ErrorInfo::new(codes::INTERNAL_ERROR, 500, other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, RealtimeError>;

/// Short form used in log lines
pub(crate) struct Reason<'a>(pub Option<&'a ErrorInfo>);

impl fmt::Display for Reason<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(err) => write!(f, "{} [{}]", err.message, err.code),
            None => f.write_str("none"),
        }
    }
}
