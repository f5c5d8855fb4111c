//! Market data transport used by stream sessions.

use async_trait::async_trait;
use keel_domain::MarketEvent;
use std::time::Duration;
use thiserror::Error;

/// Close code for "too many requests, queued".
pub const CODE_TOO_MANY_REQUESTS: i64 = 1008;
/// HTTP status for a hard rate limit.
pub const CODE_RATE_LIMITED: i64 = 429;
/// Transient internal error on the venue side.
pub const CODE_SERVER_ERROR: i64 = -1003;

/// Errors raised while connecting or reading.
///
/// `Disconnected` and `Io` are retried with backoff; the other variants carry
/// their own remediation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection closed: {0}")]
    Disconnected(String),

    #[error("transport io error: {0}")]
    Io(String),

    #[error("too many requests (code 1008)")]
    TooManyRequests,

    #[error("rate limited (code 429), retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("server error (code {code}): {message}")]
    ServerError { code: i64, message: String },
}

impl TransportError {
    /// Maps a venue close or error code to an error.
    pub fn from_code(code: i64, message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        match code {
            CODE_TOO_MANY_REQUESTS => Self::TooManyRequests,
            CODE_RATE_LIMITED => Self::RateLimited { retry_after },
            CODE_SERVER_ERROR => Self::ServerError {
                code,
                message: message.into(),
            },
            _ => Self::Disconnected(format!("code {code}: {}", message.into())),
        }
    }

    /// Venue code, when the error came with one.
    pub fn code(&self) -> Option<i64> {
        match self {
            Self::TooManyRequests => Some(CODE_TOO_MANY_REQUESTS),
            Self::RateLimited { .. } => Some(CODE_RATE_LIMITED),
            Self::ServerError { code, .. } => Some(*code),
            Self::Disconnected(_) | Self::Io(_) => None,
        }
    }
}

/// Opens subscriptions.
#[async_trait]
pub trait MarketTransport: Send + Sync {
    async fn connect(&self, symbols: &[String]) -> Result<Box<dyn MarketConnection>, TransportError>;
}

/// One live subscription.
#[async_trait]
pub trait MarketConnection: Send {
    /// Waits for the next update. An error ends the connection.
    async fn next_message(&mut self) -> Result<MarketEvent, TransportError>;

    /// Closes the connection in an orderly way.
    async fn close(&mut self);
}
