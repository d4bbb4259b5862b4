//! # Sync Error Types
//!
//! One error enum for the whole sync core. Variants are grouped by how the
//! orchestrator reacts to them:
//!
//! - entity-level (`NotFound`, `Malformed`, `Transient`, `Timeout`, `Storage`,
//!   `RateLimited`) are absorbed into the run summary counters,
//! - batch-level (`Conflict`, `Auth`, `Config`) short-circuit the run.

use std::time::Duration;

use thiserror::Error;

use crate::lock::ResourceClass;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    /// Entity absent upstream (HTTP 404 equivalent).
    #[error("not found upstream: {0}")]
    NotFound(String),

    /// Timeout, 5xx, connection reset.
    #[error("transient upstream failure: {0}")]
    Transient(String),

    #[error("upstream call timed out after {0:?}")]
    Timeout(Duration),

    /// Upstream signalled throttling (HTTP 429 equivalent).
    #[error("upstream rate limit hit on {endpoint}")]
    RateLimited { endpoint: String },

    /// Payload did not match the expected shape.
    #[error("malformed payload from {origin}: {reason}")]
    Malformed { origin: String, reason: String },

    /// Resource class lock already held.
    #[error("sync for {0} is already running")]
    Conflict(ResourceClass),

    #[error("authentication rejected by {0}")]
    Auth(String),

    #[error("invalid sync configuration: {0}")]
    Config(String),

    /// Repository write failed.
    #[error("repository write failed: {0}")]
    Storage(String),
}

/// Coarse classification used by retry rules and summary accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ErrorKind {
    NotFound,
    Transient,
    RateLimited,
    Malformed,
    Conflict,
    Fatal,
}

impl SyncError {
    pub fn malformed(origin: impl Into<String>, reason: impl Into<String>) -> Self {
        SyncError::Malformed {
            origin: origin.into(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::NotFound(_) => ErrorKind::NotFound,
            SyncError::Transient(_) | SyncError::Timeout(_) | SyncError::Storage(_) => {
                ErrorKind::Transient
            }
            SyncError::RateLimited { .. } => ErrorKind::RateLimited,
            SyncError::Malformed { .. } => ErrorKind::Malformed,
            SyncError::Conflict(_) => ErrorKind::Conflict,
            SyncError::Auth(_) | SyncError::Config(_) => ErrorKind::Fatal,
        }
    }

    /// True for errors that must abort the whole run.
    pub fn is_batch_level(&self) -> bool {
        matches!(self.kind(), ErrorKind::Conflict | ErrorKind::Fatal)
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            SyncError::malformed(
                err.url().map(|u| u.to_string()).unwrap_or_default(),
                err.to_string(),
            )
        } else {
            SyncError::Transient(err.to_string())
        }
    }
}
