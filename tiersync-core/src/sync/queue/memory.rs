//! Process-local queue used by tests and single-process dry runs. Each
//! operation holds the state lock for its whole body, which gives it the
//! same atomicity the Postgres queue gets from a transaction.

use std::{collections::BTreeMap, fmt, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use super::{
    ClaimRequest, CompletionOutcome, EnqueueOutcome, EnqueueRequest, QueueItem,
    QueueReason, QueueService, QueueStats, QueueStatus, after, cutoff,
    job::status_after_failure,
};
use crate::{
    error::Result,
    sync::config::{QueueConfig, RetryConfig},
    types::{ListingId, QueueItemId, WorkerId},
};

#[derive(Default)]
struct QueueState {
    items: BTreeMap<i64, QueueItem>,
    next_seq: i64,
}

impl QueueState {
    fn has_pending(&self, listing_id: &ListingId, except: QueueItemId) -> bool {
        self.items.values().any(|item| {
            item.id != except
                && item.status == QueueStatus::Pending
                && &item.listing_id == listing_id
        })
    }

    fn find_mut(&mut self, item_id: QueueItemId) -> Option<&mut QueueItem> {
        self.items.values_mut().find(|item| item.id == item_id)
    }
}

pub struct MemoryQueueService {
    state: Mutex<QueueState>,
    max_attempts: u16,
    backoff: RetryConfig,
}

impl fmt::Debug for MemoryQueueService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryQueueService")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl MemoryQueueService {
    /// Queue whose retryable failures are claimable again immediately.
    pub fn new(max_attempts: u16) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            max_attempts: max_attempts.max(1),
            backoff: RetryConfig {
                max_retries: max_attempts.saturating_sub(1),
                backoff_base_ms: 0,
                backoff_max_ms: 0,
            },
        }
    }

    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            backoff: config.retry_backoff(),
            ..Self::new(config.max_attempts)
        }
    }

    /// Snapshot of every row, in insertion order.
    pub async fn items(&self) -> Vec<QueueItem> {
        self.state.lock().await.items.values().cloned().collect()
    }
}

impl Default for MemoryQueueService {
    fn default() -> Self {
        Self::from_config(&QueueConfig::default())
    }
}

#[async_trait]
impl QueueService for MemoryQueueService {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<EnqueueOutcome> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.items.values().find(|item| {
            item.status == QueueStatus::Pending
                && item.listing_id == request.listing_id
        }) {
            return Ok(EnqueueOutcome::AlreadyPending(existing.id));
        }

        state.next_seq += 1;
        let seq = state.next_seq;
        let now = Utc::now();
        let item = QueueItem {
            id: QueueItemId::new(),
            seq,
            priority: request.priority(),
            listing_id: request.listing_id,
            url: request.url,
            reason: request.reason,
            status: QueueStatus::Pending,
            queued_at: now,
            available_at: now,
            claimed_at: None,
            claimed_by: None,
            completed_at: None,
            attempt_count: 0,
            last_error: None,
            session_id: request.session_id,
        };
        let id = item.id;
        state.items.insert(seq, item);
        Ok(EnqueueOutcome::Inserted(id))
    }

    async fn claim_batch(&self, request: ClaimRequest) -> Result<Vec<QueueItem>> {
        if request.limit == 0 {
            return Ok(Vec::new());
        }
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let mut candidates: Vec<(u8, chrono::DateTime<Utc>, i64)> = state
            .items
            .values()
            .filter(|item| {
                item.status == QueueStatus::Pending
                    && item.available_at <= now
                    && request.admits(item.priority)
            })
            .map(|item| (item.priority.value(), item.queued_at, item.seq))
            .collect();
        candidates.sort();
        candidates.truncate(request.limit);

        let mut claimed = Vec::with_capacity(candidates.len());
        for (_, _, seq) in candidates {
            if let Some(item) = state.items.get_mut(&seq) {
                item.status = QueueStatus::InProgress;
                item.claimed_at = Some(now);
                item.claimed_by = Some(request.worker.clone());
                item.attempt_count = item.attempt_count.saturating_add(1);
                claimed.push(item.clone());
            }
        }
        Ok(claimed)
    }

    async fn complete(
        &self,
        item_id: QueueItemId,
        worker: &WorkerId,
        outcome: CompletionOutcome,
    ) -> Result<Option<QueueStatus>> {
        let mut state = self.state.lock().await;
        let max_attempts = self.max_attempts;

        let Some(item) = state.find_mut(item_id) else {
            return Ok(None);
        };
        if item.status != QueueStatus::InProgress
            || item.claimed_by.as_ref() != Some(worker)
        {
            return Ok(None);
        }
        let listing_id = item.listing_id.clone();
        let attempt_count = item.attempt_count;

        let next = match &outcome {
            CompletionOutcome::Succeeded => QueueStatus::Completed,
            CompletionOutcome::Failed { retryable, .. } => {
                status_after_failure(attempt_count, max_attempts, *retryable)
            }
        };
        let next = if next == QueueStatus::Pending
            && state.has_pending(&listing_id, item_id)
        {
            QueueStatus::Cancelled
        } else {
            next
        };

        let now = Utc::now();
        let Some(item) = state.find_mut(item_id) else {
            return Ok(None);
        };
        item.status = next;
        match outcome {
            CompletionOutcome::Succeeded => {
                item.completed_at = Some(now);
            }
            CompletionOutcome::Failed { error, .. } => {
                item.last_error = Some(error);
                if next == QueueStatus::Pending {
                    item.claimed_at = None;
                    item.claimed_by = None;
                    item.available_at =
                        after(now, self.backoff.delay_for(attempt_count));
                } else {
                    item.completed_at = Some(now);
                }
            }
        }
        Ok(Some(next))
    }

    async fn reclaim_stale(&self, timeout: Duration) -> Result<u64> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let stale_before = cutoff(now, timeout);
        let stale: Vec<i64> = state
            .items
            .iter()
            .filter(|(_, item)| {
                item.status == QueueStatus::InProgress
                    && item.claimed_at.is_some_and(|at| at <= stale_before)
            })
            .map(|(seq, _)| *seq)
            .collect();

        let mut reclaimed = 0u64;
        for seq in stale {
            let Some((listing_id, item_id, attempts)) =
                state.items.get(&seq).map(|item| {
                    (item.listing_id.clone(), item.id, item.attempt_count)
                })
            else {
                continue;
            };
            let mut next = status_after_failure(attempts, self.max_attempts, true);
            if next == QueueStatus::Pending
                && state.has_pending(&listing_id, item_id)
            {
                next = QueueStatus::Cancelled;
            }
            if let Some(item) = state.items.get_mut(&seq) {
                item.status = next;
                item.claimed_at = None;
                item.claimed_by = None;
                item.last_error
                    .get_or_insert_with(|| "claim expired".to_string());
                if next != QueueStatus::Pending {
                    item.completed_at = Some(now);
                }
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn stats(&self) -> Result<QueueStats> {
        let state = self.state.lock().await;
        let mut stats = QueueStats {
            sampled_at: Some(Utc::now()),
            ..QueueStats::default()
        };
        for item in state.items.values() {
            *stats
                .by_status
                .entry(item.status.as_str().to_string())
                .or_default() += 1;
            if item.status == QueueStatus::Pending {
                *stats
                    .pending_by_priority
                    .entry(item.priority.value())
                    .or_default() += 1;
                *stats
                    .pending_by_reason
                    .entry(item.reason.as_str().to_string())
                    .or_default() += 1;
                stats.oldest_pending_at = Some(match stats.oldest_pending_at {
                    Some(oldest) => oldest.min(item.queued_at),
                    None => item.queued_at,
                });
            }
        }
        Ok(stats)
    }

    async fn purge(&self, retention: Duration) -> Result<u64> {
        let mut state = self.state.lock().await;
        let before = cutoff(Utc::now(), retention);
        let initial = state.items.len();
        state.items.retain(|_, item| {
            !(item.status.is_purgeable()
                && item
                    .completed_at
                    .unwrap_or(item.queued_at)
                    .le(&before))
        });
        Ok((initial - state.items.len()) as u64)
    }

    async fn pending_depth(&self) -> Result<u64> {
        let state = self.state.lock().await;
        Ok(state
            .items
            .values()
            .filter(|item| item.status == QueueStatus::Pending)
            .count() as u64)
    }

    async fn cancel_pending(&self, reason: Option<QueueReason>) -> Result<u64> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let mut cancelled = 0u64;
        for item in state.items.values_mut() {
            if item.status == QueueStatus::Pending
                && reason.is_none_or(|reason| item.reason == reason)
            {
                item.status = QueueStatus::Cancelled;
                item.completed_at = Some(now);
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    async fn failed_items(&self, limit: usize) -> Result<Vec<QueueItem>> {
        let state = self.state.lock().await;
        Ok(state
            .items
            .values()
            .filter(|item| item.status == QueueStatus::Failed)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn retry_failed(&self, limit: usize) -> Result<u64> {
        let mut state = self.state.lock().await;
        let failed: Vec<i64> = state
            .items
            .iter()
            .filter(|(_, item)| item.status == QueueStatus::Failed)
            .map(|(seq, _)| *seq)
            .collect();

        let now = Utc::now();
        let mut retried = 0u64;
        for seq in failed {
            if retried as usize >= limit {
                break;
            }
            let Some((listing_id, item_id)) = state
                .items
                .get(&seq)
                .map(|item| (item.listing_id.clone(), item.id))
            else {
                continue;
            };
            if state.has_pending(&listing_id, item_id) {
                continue;
            }
            if let Some(item) = state.items.get_mut(&seq) {
                item.status = QueueStatus::Pending;
                item.attempt_count = 0;
                item.queued_at = now;
                item.available_at = now;
                item.claimed_at = None;
                item.claimed_by = None;
                item.completed_at = None;
                retried += 1;
            }
        }
        Ok(retried)
    }

    async fn get(&self, item_id: QueueItemId) -> Result<Option<QueueItem>> {
        let state = self.state.lock().await;
        Ok(state.items.values().find(|item| item.id == item_id).cloned())
    }
}
