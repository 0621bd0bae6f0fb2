//! Contracts for the external fetchers the engine drives.
//!
//! Parsing listing pages is the adapter's business; the engine only sees
//! scanned entries, full records and probe outcomes.

use async_trait::async_trait;
use thiserror::Error;

use crate::{
    sync::{
        config::ListingSource,
        queue::CompletionOutcome,
    },
    types::{FullRecord, ScannedEntry},
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Network failure, timeout or 5xx.
    #[error("transient fetch failure: {0}")]
    Transient(String),

    #[error("not found")]
    NotFound,

    #[error("redirected to {location}")]
    Redirected { location: String },

    /// Rate limited or challenged by the source.
    #[error("blocked by source: {0}")]
    Blocked(String),

    #[error("unparseable response: {0}")]
    Parse(String),
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Transient(_) | FetchError::Blocked(_))
    }

    /// How a failed full fetch settles its queue item.
    pub fn completion_outcome(&self) -> CompletionOutcome {
        if self.is_retryable() {
            CompletionOutcome::retryable(self.to_string())
        } else {
            CompletionOutcome::permanent(self.to_string())
        }
    }
}

/// One page of a listing index.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ScanPage {
    pub entries: Vec<ScannedEntry>,
    /// False once the source has no further pages.
    pub has_more: bool,
}

#[async_trait]
pub trait ScanFetcher: Send + Sync {
    /// Fetches page `page` (1-based) of `source`. Failures are page-scoped.
    async fn fetch_page(
        &self,
        source: &ListingSource,
        page: u32,
    ) -> Result<ScanPage, FetchError>;
}

/// Result of a cheap existence check against a listing url.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProbeOutcome {
    Exists,
    NotFound,
    Sold,
    /// No decision can be taken on this signal.
    Ambiguous(String),
}

impl ProbeOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ProbeOutcome::Exists => "exists",
            ProbeOutcome::NotFound => "not_found",
            ProbeOutcome::Sold => "sold",
            ProbeOutcome::Ambiguous(_) => "ambiguous",
        }
    }
}

/// Classifies a redirect target seen while probing a listing url.
///
/// Sold pages are checked first since they usually live under the generic
/// listing paths too.
pub fn classify_redirect(location: &str) -> ProbeOutcome {
    let location = location.to_ascii_lowercase();
    if location.contains("sold") {
        return ProbeOutcome::Sold;
    }
    if is_generic_listing_redirect(&location) {
        return ProbeOutcome::NotFound;
    }
    ProbeOutcome::Ambiguous(format!("redirected to {location}"))
}

fn is_generic_listing_redirect(location: &str) -> bool {
    ["search", "properties", "filter", "?"]
        .iter()
        .any(|marker| location.contains(marker))
}

#[async_trait]
pub trait DetailFetcher: Send + Sync {
    async fn fetch_detail(&self, url: &str) -> Result<FullRecord, FetchError>;

    /// Existence check used by removal confirmation. Adapters with a cheaper
    /// request than a full fetch should override this.
    async fn probe(&self, url: &str) -> ProbeOutcome {
        match self.fetch_detail(url).await {
            Ok(_) => ProbeOutcome::Exists,
            Err(FetchError::NotFound) => ProbeOutcome::NotFound,
            Err(FetchError::Redirected { location }) => {
                classify_redirect(&location)
            }
            Err(other) => ProbeOutcome::Ambiguous(other.to_string()),
        }
    }
}
