use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    error::Result,
    sync::stats::ManifestStats,
    types::{ListingId, ManifestEntry, SessionId},
};

/// Detection flags to clear once a full fetch has covered them.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ManifestFlags {
    pub is_new: bool,
    pub price_changed: bool,
}

impl ManifestFlags {
    pub const ALL: ManifestFlags = ManifestFlags {
        is_new: true,
        price_changed: true,
    };
}

#[async_trait]
pub trait ManifestRepository: Send + Sync {
    async fn get_many(
        &self,
        ids: &[ListingId],
    ) -> Result<HashMap<ListingId, ManifestEntry>>;

    /// Writes every entry in one transaction.
    async fn upsert_many(&self, entries: &[ManifestEntry]) -> Result<u64>;

    /// Entries last observed by `session`.
    async fn session_entries(
        &self,
        session: SessionId,
    ) -> Result<Vec<ManifestEntry>>;

    async fn count_in_session(&self, session: SessionId) -> Result<u64>;

    /// Clears the selected flags and recomputes `needs_full_scrape`.
    async fn clear_flags(
        &self,
        ids: &[ListingId],
        flags: ManifestFlags,
    ) -> Result<u64>;

    async fn delete(&self, id: &ListingId) -> Result<bool>;

    async fn stats(&self, now: DateTime<Utc>) -> Result<ManifestStats>;
}
