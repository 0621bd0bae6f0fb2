use thiserror::Error;

use crate::types::{ListingStatus, Tier};

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Transient fetch error: {0}")]
    TransientFetch(String),

    #[error("Listing not found: {0}")]
    NotFound(String),

    #[error("Ambiguous response: {0}")]
    Ambiguous(String),

    #[error(
        "Scan coverage too low: observed {observed} of {expected} active listings (minimum {threshold_percent}%)"
    )]
    CoverageTooLow {
        observed: u64,
        expected: u64,
        threshold_percent: u8,
    },

    #[error("Store error: {0}")]
    Store(String),

    #[error("Illegal lifecycle transition from {from} on {event}")]
    IllegalTransition {
        from: ListingStatus,
        event: &'static str,
    },

    #[error("Tier {running} is already running")]
    TierBusy { running: Tier },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid listing url: {0}")]
    InvalidListingUrl(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Errors worth retrying with backoff at the item or page level.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::TransientFetch(_))
    }

    /// Errors that must fail the enclosing sync run.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::Store(_)
                | SyncError::Serialization(_)
                | SyncError::Internal(_)
        )
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for SyncError {
    fn from(err: sqlx::Error) -> Self {
        SyncError::Store(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
