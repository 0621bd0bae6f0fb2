use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    error::Result,
    sync::stats::QualityReport,
    types::{
        FullRecord, ListingId, ListingRef, ListingStatus, LiveRecord,
        MissingListing, ObservedListing, SessionId,
    },
};

/// Outcome of resetting missing counts for everything a session observed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ObservationReport {
    /// Live records observed by the session, any status.
    pub observed: u64,
    /// Of those, records that were `Active` before the reset.
    pub observed_active: u64,
    /// Observed records that were `ConfirmedRemoved` or `Sold`.
    pub off_market: Vec<ObservedListing>,
}

/// Compare-and-set status change; applied only while the record is still in
/// `from`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusTransition {
    pub listing_id: ListingId,
    pub from: ListingStatus,
    pub to: ListingStatus,
    pub missing_count: u32,
    pub at: DateTime<Utc>,
}

#[async_trait]
pub trait LiveRecordRepository: Send + Sync {
    async fn get(&self, id: &ListingId) -> Result<Option<LiveRecord>>;

    async fn get_many(
        &self,
        ids: &[ListingId],
    ) -> Result<HashMap<ListingId, LiveRecord>>;

    /// Inserts or replaces a record verbatim.
    async fn put(&self, record: &LiveRecord) -> Result<()>;

    async fn active_count(&self) -> Result<u64>;

    /// Resets `consecutive_missing_count` and stamps
    /// `last_manifest_seen_at` on every record observed by `session`.
    async fn record_observations(
        &self,
        session: SessionId,
        now: DateTime<Utc>,
    ) -> Result<ObservationReport>;

    /// Increments `consecutive_missing_count` on every active record not
    /// observed by `session` and returns the new counts.
    async fn record_misses(
        &self,
        session: SessionId,
    ) -> Result<Vec<MissingListing>>;

    async fn apply_transition(&self, transition: &StatusTransition) -> Result<bool>;

    /// Creates or refreshes a record from a successful detail fetch.
    async fn upsert_fetched(
        &self,
        id: &ListingId,
        record: &FullRecord,
        scrape_priority: u8,
        now: DateTime<Utc>,
    ) -> Result<LiveRecord>;

    /// Active records never fully fetched or last fetched before `before`,
    /// oldest first.
    async fn stale_active(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ListingRef>>;

    async fn sample_active(&self, limit: usize) -> Result<Vec<ListingRef>>;

    async fn quality(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<QualityReport>;
}
