//! Durable, priority-ordered backlog of full-fetch work.

pub mod job;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod persistence;

use std::{collections::BTreeMap, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::Result,
    types::{QueueItemId, WorkerId},
};

pub use job::{
    ClaimRequest, CompletionOutcome, EnqueueOutcome, EnqueueRequest, QueueItem,
    QueuePriority, QueueReason, QueueStatus,
};

/// Abstracts the queue backend consumed by the orchestrator and the drain
/// worker. Every method is one atomic step against the store.
#[async_trait]
pub trait QueueService: Send + Sync {
    /// Inserts a pending item unless one is already pending for the listing.
    async fn enqueue(&self, request: EnqueueRequest) -> Result<EnqueueOutcome>;

    /// Reserves up to `request.limit` pending items whose `available_at`
    /// has passed, ordered by `(priority, queued_at)`. Concurrent callers
    /// never receive the same item.
    async fn claim_batch(&self, request: ClaimRequest) -> Result<Vec<QueueItem>>;

    /// Settles a claimed item. A retryable failure returns it to pending
    /// behind the retry backoff. Returns `None` when `worker` no longer holds
    /// the claim (it was reclaimed and possibly re-claimed elsewhere).
    async fn complete(
        &self,
        item_id: QueueItemId,
        worker: &WorkerId,
        outcome: CompletionOutcome,
    ) -> Result<Option<QueueStatus>>;

    /// Returns in-progress items claimed longer than `timeout` ago to
    /// pending, or to failed when their attempts are exhausted.
    async fn reclaim_stale(&self, timeout: Duration) -> Result<u64>;

    async fn stats(&self) -> Result<QueueStats>;

    /// Deletes completed and cancelled items older than `retention`.
    async fn purge(&self, retention: Duration) -> Result<u64>;

    async fn pending_depth(&self) -> Result<u64>;

    /// Cancels pending items, optionally only those with `reason`.
    async fn cancel_pending(&self, reason: Option<QueueReason>) -> Result<u64>;

    async fn failed_items(&self, limit: usize) -> Result<Vec<QueueItem>>;

    /// Moves failed items back to pending with a fresh attempt budget.
    async fn retry_failed(&self, limit: usize) -> Result<u64>;

    async fn get(&self, item_id: QueueItemId) -> Result<Option<QueueItem>>;
}

/// Aggregated queue counters at a specific instant.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub sampled_at: Option<DateTime<Utc>>,
    pub by_status: BTreeMap<String, u64>,
    /// Pending items per priority band.
    pub pending_by_priority: BTreeMap<u8, u64>,
    /// Pending items per reason.
    pub pending_by_reason: BTreeMap<String, u64>,
    pub oldest_pending_at: Option<DateTime<Utc>>,
}

impl QueueStats {
    pub fn count(&self, status: QueueStatus) -> u64 {
        self.by_status.get(status.as_str()).copied().unwrap_or(0)
    }

    pub fn pending(&self) -> u64 {
        self.count(QueueStatus::Pending)
    }

    pub fn total(&self) -> u64 {
        self.by_status.values().sum()
    }
}

/// `now - age`, saturating at the earliest representable instant.
pub(crate) fn cutoff(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// `now + delay`, saturating at the latest representable instant.
pub(crate) fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
