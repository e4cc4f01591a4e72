//! Error types for the ingest pipeline.
//!
//! Errors are `Clone` so the send side can hand the same failure to the
//! channel, which replays it on the read side.

use crate::cid::CidError;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, IngestError>;

#[derive(Debug, Clone, Error)]
pub enum IngestError {
    /// Normalizer or content-read failure
    #[error("Failed to read input {path}: {source}")]
    Input {
        path: String,
        #[source]
        source: Arc<io::Error>,
    },

    /// Channel-level failure (connection drop, write failure, remote fatal)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed frame or unexpected message
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid content identifier {cid:?} for {path}: {source}")]
    InvalidCid {
        path: String,
        cid: String,
        #[source]
        source: CidError,
    },

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl IngestError {
    pub fn input(path: impl Into<String>, source: io::Error) -> Self {
        Self::Input {
            path: path.into(),
            source: Arc::new(source),
        }
    }

    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport(err.to_string())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Whether the error was caused by the caller stopping the operation
    /// (explicit cancel or deadline) rather than by a failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Timeout(_))
    }
}
