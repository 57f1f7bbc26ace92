//! Error types for the docket domain layer.

use std::fmt;

/// Top-level error type for domain-level operations.
#[derive(Debug, Clone)]
pub enum CoreError {
    /// A validation constraint was violated.
    Validation(String),
    /// A referenced entity was not found.
    NotFound(String),
    /// An internal/unexpected error.
    Internal(String),
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation(msg) => write!(f, "validation error: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for CoreError {}
