//! Crate-wide error taxonomy
//!
//! Errors are classified by how workers must react to them:
//!
//! - `Config` is fatal at startup; the process exits non-zero.
//! - `Transport` errors are transient and retried with backoff; the
//!   originating service is carried so retry policy can differ per service.
//! - `RateLimited` is a transport error with an advertised reset time.
//! - `LockConflict` is expected control flow, never logged as an error.
//! - `Validation` marks a malformed queue message; the message is dropped
//!   (nack without requeue).
//! - `Scan` is unrecoverable at the scan level; it is appended to the
//!   scan's error log and the scan transitions to `error`.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Which external service produced a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    GitHub,
    Llm,
    Queue,
    Db,
}

impl std::fmt::Display for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Service::GitHub => "github",
            Service::Llm => "llm",
            Service::Queue => "queue",
            Service::Db => "db",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("{service} transport error: {message}")]
    Transport { service: Service, message: String },

    #[error("rate limited until {reset_at}")]
    RateLimited { reset_at: DateTime<Utc> },

    #[error("lock conflict: {0}")]
    LockConflict(String),

    #[error("invalid task message: {0}")]
    Validation(String),

    #[error("scan {scan_id} failed during {phase}: {message}")]
    Scan {
        scan_id: i64,
        phase: String,
        message: String,
    },

    #[error("not found: {0}")]
    NotFound(String),
}

impl Error {
    pub fn github(message: impl Into<String>) -> Self {
        Error::Transport {
            service: Service::GitHub,
            message: message.into(),
        }
    }

    pub fn llm(message: impl Into<String>) -> Self {
        Error::Transport {
            service: Service::Llm,
            message: message.into(),
        }
    }

    pub fn queue(message: impl Into<String>) -> Self {
        Error::Transport {
            service: Service::Queue,
            message: message.into(),
        }
    }

    pub fn scan(scan_id: i64, phase: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Scan {
            scan_id,
            phase: phase.into(),
            message: message.into(),
        }
    }

    /// Whether a consumer should requeue the message that triggered this error.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Transport { .. } | Error::RateLimited { .. }
        )
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Error::NotFound("row not found".to_string()),
            other => Error::Transport {
                service: Service::Db,
                message: other.to_string(),
            },
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        // reqwest errors reach us from both the GitHub client and the scoring
        // client; callers that need the distinction construct the variant
        // themselves via Error::github / Error::llm.
        Error::Transport {
            service: Service::GitHub,
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Validation(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(Error::github("boom").is_transient());
        assert!(Error::RateLimited {
            reset_at: Utc::now()
        }
        .is_transient());
        assert!(!Error::Validation("bad".into()).is_transient());
        assert!(!Error::LockConflict("held".into()).is_transient());
    }

    #[test]
    fn display_includes_service() {
        let err = Error::queue("connection refused");
        assert_eq!(err.to_string(), "queue transport error: connection refused");
    }
}
