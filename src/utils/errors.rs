// src/utils/errors.rs

use std::{error::Error, fmt};
use reqwest;
use serde_json;
use tungstenite::Error as WsError;

/// Errors coming from external I/O (time probe HTTP, JSON, feed WS, etc).
#[derive(Debug)]
pub enum ApiError {
    Http(reqwest::Error),
    Json(serde_json::Error),
    WebSocket(WsError),
    Timeout(u64),
    Other(String),
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiError::Http(e)      => write!(f, "HTTP error: {}", e),
            ApiError::Json(e)      => write!(f, "JSON error: {}", e),
            ApiError::WebSocket(e) => write!(f, "WebSocket error: {}", e),
            ApiError::Timeout(ms)  => write!(f, "timed out after {} ms", ms),
            ApiError::Other(msg)   => write!(f, "{}", msg),
        }
    }
}

impl Error for ApiError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ApiError::Http(e)      => Some(e),
            ApiError::Json(e)      => Some(e),
            ApiError::WebSocket(e) => Some(e),
            ApiError::Timeout(_)   => None,
            ApiError::Other(_)     => None,
        }
    }
}

// Conversions from underlying errors into ApiError
impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self { ApiError::Http(err) }
}
impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self { ApiError::Json(err) }
}
impl From<WsError> for ApiError {
    fn from(err: WsError) -> Self { ApiError::WebSocket(err) }
}

/// Rejected configuration. Timeframe and strategy identity never default.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown timeframe '{0}'")]
    UnknownTimeframe(String),
    #[error("unknown strategy kind '{0}'")]
    UnknownStrategy(String),
    #[error("invalid setting {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// A single strategy failed one evaluation; siblings keep running.
#[derive(Debug, thiserror::Error)]
pub enum StrategyError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("strategy panicked: {0}")]
    Panicked(String),
}

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("feed unavailable after {attempts} reconnect attempts")]
    Unavailable { attempts: u32 },
    #[error(transparent)]
    Api(#[from] ApiError),
}
