//! Error types for Cinder
//!
//! This module defines all error types used throughout the storage engine.
//! Uses `thiserror` for ergonomic error definitions.

use std::io;
use thiserror::Error;

/// Main error type for Cinder operations
#[derive(Error, Debug)]
pub enum CinderError {
    /// Underlying I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A record or file failed integrity verification
    #[error("Corruption at address {address:#x}: {reason}")]
    Corruption {
        /// Logical address (or file offset) where corruption was detected
        address: u64,
        /// Human-readable reason
        reason: String,
    },

    /// Disk full, allocation failure or a configured limit reached
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Durability can no longer be guaranteed; writes are refused until the
    /// condition clears
    #[error("Fatal storage error: {0}")]
    Fatal(String),

    /// Invalid argument value or format
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Checkpoint operation error
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Data recovery error
    #[error("Recovery error: {0}")]
    Recovery(String),

    /// Configuration parsing or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal invariant violated
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for Cinder operations
pub type Result<T> = std::result::Result<T, CinderError>;

impl CinderError {
    /// Build a corruption error for the given address
    pub fn corruption(address: u64, reason: impl Into<String>) -> Self {
        CinderError::Corruption {
            address,
            reason: reason.into(),
        }
    }

    /// Returns true if the engine cannot continue accepting writes
    #[cold]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CinderError::Fatal(_) | CinderError::ResourceExhausted(_) | CinderError::Internal(_)
        )
    }

    /// Returns true if repeating the operation may succeed
    #[cold]
    pub fn is_retryable(&self) -> bool {
        match self {
            CinderError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::Other
            ),
            _ => false,
        }
    }
}
