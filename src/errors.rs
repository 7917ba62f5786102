//! Typed error hierarchy.
//!
//! Library seams return these; the binary and config loading wrap them with
//! `anyhow::Context`.

use std::time::Duration;
use thiserror::Error;

/// Failures surfaced by the position store and its backends.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("conditional update abandoned after {attempts} conflicting attempts")]
    Conflict { attempts: u32 },

    #[error("malformed stored record: {0}")]
    Malformed(String),

    #[error("mutation would produce an invalid position: {0}")]
    InvalidState(String),
}

impl StoreError {
    /// Backend I/O failures are retried on the next tick.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Malformed(e.to_string())
    }
}

/// Failures from the market data / order execution client.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClientError {
    // -- Transport ----------------------------------------------------------
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    // -- Payload ------------------------------------------------------------
    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("invalid market {market_id}: {reason}")]
    InvalidMarket { market_id: String, reason: String },
}

impl ClientError {
    /// Everything except a structurally invalid market is worth retrying.
    pub fn is_transient(&self) -> bool {
        !matches!(self, ClientError::InvalidMarket { .. })
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ClientError::Malformed(e.to_string())
        } else {
            ClientError::Transport(e.to_string())
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self {
        ClientError::Malformed(e.to_string())
    }
}

/// Control-surface failures (start/stop/halt/resume/panic).
#[derive(Error, Debug)]
pub enum ControlError {
    #[error("cannot {action} while session is {state}")]
    InvalidTransition { action: &'static str, state: String },

    #[error("no eligible market found")]
    NoMarket,

    #[error("market validation failed: {0}")]
    InvalidMarket(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Errors a loop tick can return to its supervisor.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("no market loaded for this session")]
    NoMarket,
}

impl EngineError {
    /// Transient errors skip the tick; anything else fails the task.
    pub fn is_transient(&self) -> bool {
        match self {
            EngineError::Store(e) => e.is_transient() || matches!(e, StoreError::Conflict { .. }),
            EngineError::Client(e) => e.is_transient(),
            EngineError::NoMarket => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(EngineError::Store(StoreError::Unavailable("db".into())).is_transient());
        assert!(EngineError::Store(StoreError::Conflict { attempts: 5 }).is_transient());
        assert!(!EngineError::Store(StoreError::Malformed("x".into())).is_transient());
        assert!(EngineError::Client(ClientError::Timeout(Duration::from_secs(5))).is_transient());
        assert!(!EngineError::Client(ClientError::InvalidMarket {
            market_id: "m".into(),
            reason: "bad".into(),
        })
        .is_transient());
        assert!(!EngineError::NoMarket.is_transient());
    }

    #[test]
    fn test_error_messages() {
        let err = StoreError::Conflict { attempts: 3 };
        assert_eq!(
            err.to_string(),
            "conditional update abandoned after 3 conflicting attempts"
        );
        let err = ControlError::InvalidTransition {
            action: "resume",
            state: "RUNNING".into(),
        };
        assert_eq!(err.to_string(), "cannot resume while session is RUNNING");
    }
}
