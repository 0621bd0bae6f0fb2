//! Postgres-backed queue. Batch claims are a single
//! `FOR UPDATE SKIP LOCKED` statement, so any number of drain workers can
//! share one table without double-processing.

use std::{collections::BTreeMap, fmt, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    ClaimRequest, CompletionOutcome, EnqueueOutcome, EnqueueRequest, QueueItem,
    QueuePriority, QueueReason, QueueService, QueueStats, QueueStatus,
    job::status_after_failure,
};
use crate::{
    database::infrastructure::postgres::{is_unique_violation, store_err},
    error::{Result, SyncError},
    sync::config::{QueueConfig, RetryConfig},
    types::{ListingId, QueueItemId, SessionId, WorkerId},
};

const QUEUE_COLUMNS: &str = "id, seq, listing_id, url, priority, reason, \
     status, queued_at, available_at, claimed_at, claimed_by, completed_at, \
     attempt_count, last_error, session_id";

/// Durable queue backed by Postgres.
#[derive(Clone)]
pub struct PostgresQueueService {
    pool: PgPool,
    max_attempts: u16,
    backoff: RetryConfig,
}

impl fmt::Debug for PostgresQueueService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresQueueService")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .finish()
    }
}

#[derive(FromRow)]
struct QueueRow {
    id: Uuid,
    seq: i64,
    listing_id: String,
    url: String,
    priority: i16,
    reason: String,
    status: String,
    queued_at: DateTime<Utc>,
    available_at: DateTime<Utc>,
    claimed_at: Option<DateTime<Utc>>,
    claimed_by: Option<String>,
    completed_at: Option<DateTime<Utc>>,
    attempt_count: i32,
    last_error: Option<String>,
    session_id: Option<Uuid>,
}

impl TryFrom<QueueRow> for QueueItem {
    type Error = SyncError;

    fn try_from(row: QueueRow) -> Result<Self> {
        let id = row.id;
        let corrupt =
            |e: String| SyncError::Store(format!("corrupt queue row {id}: {e}"));
        let priority = u8::try_from(row.priority)
            .map_err(|e| e.to_string())
            .and_then(QueuePriority::try_from)
            .map_err(corrupt)?;
        let reason = row.reason.parse::<QueueReason>().map_err(corrupt)?;
        let status = row.status.parse::<QueueStatus>().map_err(corrupt)?;
        Ok(QueueItem {
            id: QueueItemId(id),
            seq: row.seq,
            listing_id: ListingId(row.listing_id),
            url: row.url,
            priority,
            reason,
            status,
            queued_at: row.queued_at,
            available_at: row.available_at,
            claimed_at: row.claimed_at,
            claimed_by: row.claimed_by.map(WorkerId),
            completed_at: row.completed_at,
            attempt_count: u16::try_from(row.attempt_count.max(0))
                .unwrap_or(u16::MAX),
            last_error: row.last_error,
            session_id: row.session_id.map(SessionId),
        })
    }
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

impl PostgresQueueService {
    /// Create a queue service and verify DB health + schema.
    pub async fn new(pool: PgPool, config: &QueueConfig) -> Result<Self> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&pool)
            .await
            .map_err(|e| {
                SyncError::Store(format!(
                    "Queue service failed Postgres health check: {e}"
                ))
            })?;
        info!("Queue service connected to Postgres");

        // The dedup guarantee depends on this index.
        let idx_exists = sqlx::query_scalar::<_, i32>(
            r#"
            SELECT 1
            FROM pg_indexes
            WHERE indexname = $1
            LIMIT 1
            "#,
        )
        .bind("uq_sync_queue_pending_listing")
        .fetch_optional(&pool)
        .await
        .map_err(store_err("queue schema validation"))?
        .is_some();

        if !idx_exists {
            return Err(SyncError::Store(
                "Required index uq_sync_queue_pending_listing is missing; run migrations"
                    .into(),
            ));
        }

        Ok(Self {
            pool,
            max_attempts: config.max_attempts.max(1),
            backoff: config.retry_backoff(),
        })
    }

    async fn pending_id_for(&self, listing_id: &ListingId) -> Result<Option<Uuid>> {
        sqlx::query_scalar::<_, Uuid>(
            "SELECT id FROM sync_queue WHERE listing_id = $1 AND status = 'pending'",
        )
        .bind(listing_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err("enqueue pending lookup"))
    }

    async fn has_other_pending(
        &self,
        listing_id: &str,
        item_id: Uuid,
    ) -> Result<bool> {
        Ok(sqlx::query_scalar::<_, i32>(
            r#"
            SELECT 1 FROM sync_queue
            WHERE listing_id = $1 AND status = 'pending' AND id <> $2
            LIMIT 1
            "#,
        )
        .bind(listing_id)
        .bind(item_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err("pending sibling lookup"))?
        .is_some())
    }

    /// Compare-and-set settle of one in-progress row. Returns false when the
    /// row no longer matches `(status, claimed_by, attempt_count)`. A row
    /// returned to pending becomes claimable after `delay`.
    async fn settle(
        &self,
        item_id: Uuid,
        claimed_by: Option<&str>,
        attempt_count: i32,
        next: QueueStatus,
        error: Option<&str>,
        delay: Duration,
    ) -> Result<bool> {
        match self
            .settle_once(item_id, claimed_by, attempt_count, next, error, delay)
            .await
        {
            Ok(settled) => Ok(settled),
            // A pending sibling appeared between the precheck and the update.
            Err(e) if next == QueueStatus::Pending && is_unique_violation(&e) => {
                debug!(item_id = %item_id, "pending sibling exists; cancelling");
                self.settle_once(
                    item_id,
                    claimed_by,
                    attempt_count,
                    QueueStatus::Cancelled,
                    Some("superseded by a newer pending item"),
                    Duration::ZERO,
                )
                .await
                .map_err(store_err("queue settle"))
            }
            Err(e) => Err(SyncError::Store(format!("queue settle failed: {e}"))),
        }
    }

    async fn settle_once(
        &self,
        item_id: Uuid,
        claimed_by: Option<&str>,
        attempt_count: i32,
        next: QueueStatus,
        error: Option<&str>,
        delay: Duration,
    ) -> std::result::Result<bool, sqlx::Error> {
        let done = sqlx::query(
            r#"
            UPDATE sync_queue
            SET status = $4,
                completed_at = CASE WHEN $4 = 'pending' THEN NULL ELSE NOW() END,
                claimed_at = CASE WHEN $4 = 'pending' THEN NULL ELSE claimed_at END,
                claimed_by = CASE WHEN $4 = 'pending' THEN NULL ELSE claimed_by END,
                available_at = CASE
                    WHEN $4 = 'pending'
                        THEN NOW() + ($6::bigint) * INTERVAL '1 millisecond'
                    ELSE available_at
                END,
                last_error = COALESCE($5, last_error),
                updated_at = NOW()
            WHERE id = $1
              AND status = 'in_progress'
              AND claimed_by IS NOT DISTINCT FROM $2
              AND attempt_count = $3
            "#,
        )
        .bind(item_id)
        .bind(claimed_by)
        .bind(attempt_count)
        .bind(next.as_str())
        .bind(error)
        .bind(millis(delay))
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() > 0)
    }
}

#[async_trait]
impl QueueService for PostgresQueueService {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<EnqueueOutcome> {
        // Partial unique index uq_sync_queue_pending_listing makes this
        // insert-or-skip atomic. A concurrent claim can empty the slot
        // between the insert and the lookup, so retry a few times.
        for _ in 0..3 {
            let item_id = QueueItemId::new();
            let inserted = sqlx::query_scalar::<_, Uuid>(
                r#"
                INSERT INTO sync_queue (
                    id, listing_id, url, priority, reason, status,
                    queued_at, available_at, attempt_count, session_id,
                    updated_at
                )
                VALUES ($1, $2, $3, $4, $5, 'pending', NOW(), NOW(), 0, $6, NOW())
                ON CONFLICT (listing_id) WHERE status = 'pending' DO NOTHING
                RETURNING id
                "#,
            )
            .bind(item_id.0)
            .bind(request.listing_id.as_str())
            .bind(&request.url)
            .bind(i16::from(request.priority().value()))
            .bind(request.reason.as_str())
            .bind(request.session_id.map(|id| id.0))
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err("enqueue insert"))?;

            if let Some(id) = inserted {
                debug!(
                    listing_id = %request.listing_id,
                    reason = %request.reason,
                    "queued listing"
                );
                return Ok(EnqueueOutcome::Inserted(QueueItemId(id)));
            }
            if let Some(existing) = self.pending_id_for(&request.listing_id).await? {
                return Ok(EnqueueOutcome::AlreadyPending(QueueItemId(existing)));
            }
        }
        Err(SyncError::Store(format!(
            "enqueue for {} kept racing with concurrent claims",
            request.listing_id
        )))
    }

    async fn claim_batch(&self, request: ClaimRequest) -> Result<Vec<QueueItem>> {
        if request.limit == 0 {
            return Ok(Vec::new());
        }
        let sql = format!(
            r#"
            WITH picked AS (
                SELECT id
                FROM sync_queue
                WHERE status = 'pending'
                  AND available_at <= NOW()
                  AND ($3::smallint IS NULL OR priority <= $3)
                ORDER BY priority ASC, queued_at ASC, seq ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE sync_queue q
            SET status = 'in_progress',
                claimed_at = NOW(),
                claimed_by = $2,
                attempt_count = q.attempt_count + 1,
                updated_at = NOW()
            FROM picked
            WHERE q.id = picked.id
            RETURNING {}
            "#,
            QUEUE_COLUMNS
                .split(", ")
                .map(|col| format!("q.{}", col.trim()))
                .collect::<Vec<_>>()
                .join(", ")
        );
        let rows = sqlx::query_as::<_, QueueRow>(&sql)
            .bind(i64::try_from(request.limit).unwrap_or(i64::MAX))
            .bind(request.worker.as_str())
            .bind(request.max_priority.map(|p| i16::from(p.value())))
            .fetch_all(&self.pool)
            .await
            .map_err(store_err("claim batch"))?;

        let mut items = rows
            .into_iter()
            .map(QueueItem::try_from)
            .collect::<Result<Vec<_>>>()?;
        // RETURNING order is unspecified.
        items.sort_by_key(|item| (item.priority, item.queued_at, item.seq));
        debug!(worker = %request.worker, claimed = items.len(), "claimed batch");
        Ok(items)
    }

    async fn complete(
        &self,
        item_id: QueueItemId,
        worker: &WorkerId,
        outcome: CompletionOutcome,
    ) -> Result<Option<QueueStatus>> {
        let current = sqlx::query_as::<_, (String, i32)>(
            r#"
            SELECT listing_id, attempt_count
            FROM sync_queue
            WHERE id = $1 AND status = 'in_progress' AND claimed_by = $2
            "#,
        )
        .bind(item_id.0)
        .bind(worker.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err("complete lookup"))?;

        let Some((listing_id, attempt_count)) = current else {
            warn!(item_id = %item_id, worker = %worker, "completion for a lost claim ignored");
            return Ok(None);
        };

        let attempts = u16::try_from(attempt_count.max(0)).unwrap_or(u16::MAX);
        let (mut next, error) = match &outcome {
            CompletionOutcome::Succeeded => (QueueStatus::Completed, None),
            CompletionOutcome::Failed { error, retryable } => (
                status_after_failure(attempts, self.max_attempts, *retryable),
                Some(error.as_str()),
            ),
        };
        if next == QueueStatus::Pending
            && self.has_other_pending(&listing_id, item_id.0).await?
        {
            next = QueueStatus::Cancelled;
        }

        let settled = self
            .settle(
                item_id.0,
                Some(worker.as_str()),
                attempt_count,
                next,
                error,
                self.backoff.delay_for(attempts),
            )
            .await?;
        Ok(settled.then_some(next))
    }

    async fn reclaim_stale(&self, timeout: Duration) -> Result<u64> {
        let expired = sqlx::query_as::<_, (Uuid, String, i32, Option<String>)>(
            r#"
            SELECT id, listing_id, attempt_count, claimed_by
            FROM sync_queue
            WHERE status = 'in_progress'
              AND claimed_at <= NOW() - ($1::bigint) * INTERVAL '1 millisecond'
            ORDER BY claimed_at ASC
            "#,
        )
        .bind(millis(timeout))
        .fetch_all(&self.pool)
        .await
        .map_err(store_err("stale claim scan"))?;

        let mut reclaimed = 0u64;
        for (id, listing_id, attempt_count, claimed_by) in expired {
            let attempts = u16::try_from(attempt_count.max(0)).unwrap_or(u16::MAX);
            let mut next = status_after_failure(attempts, self.max_attempts, true);
            if next == QueueStatus::Pending
                && self.has_other_pending(&listing_id, id).await?
            {
                next = QueueStatus::Cancelled;
            }
            if self
                .settle(
                    id,
                    claimed_by.as_deref(),
                    attempt_count,
                    next,
                    Some("claim expired"),
                    Duration::ZERO,
                )
                .await?
            {
                reclaimed += 1;
            }
        }
        if reclaimed > 0 {
            info!(reclaimed, "reclaimed stale queue claims");
        }
        Ok(reclaimed)
    }

    async fn stats(&self) -> Result<QueueStats> {
        let by_status = sqlx::query_as::<_, (String, i64)>(
            "SELECT status, COUNT(*)::bigint FROM sync_queue GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(store_err("queue status counts"))?;

        let by_priority = sqlx::query_as::<_, (i16, i64)>(
            r#"
            SELECT priority, COUNT(*)::bigint
            FROM sync_queue
            WHERE status = 'pending'
            GROUP BY priority
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(store_err("queue priority counts"))?;

        let by_reason = sqlx::query_as::<_, (String, i64)>(
            r#"
            SELECT reason, COUNT(*)::bigint
            FROM sync_queue
            WHERE status = 'pending'
            GROUP BY reason
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(store_err("queue reason counts"))?;

        let oldest_pending_at = sqlx::query_scalar::<_, Option<DateTime<Utc>>>(
            "SELECT MIN(queued_at) FROM sync_queue WHERE status = 'pending'",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(store_err("oldest pending lookup"))?;

        let count = |n: i64| u64::try_from(n).unwrap_or(0);
        Ok(QueueStats {
            sampled_at: Some(Utc::now()),
            by_status: by_status
                .into_iter()
                .map(|(status, n)| (status, count(n)))
                .collect(),
            pending_by_priority: by_priority
                .into_iter()
                .filter_map(|(priority, n)| {
                    u8::try_from(priority).ok().map(|p| (p, count(n)))
                })
                .collect::<BTreeMap<_, _>>(),
            pending_by_reason: by_reason
                .into_iter()
                .map(|(reason, n)| (reason, count(n)))
                .collect(),
            oldest_pending_at,
        })
    }

    async fn purge(&self, retention: Duration) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM sync_queue
            WHERE status IN ('completed', 'cancelled')
              AND COALESCE(completed_at, queued_at)
                  <= NOW() - ($1::bigint) * INTERVAL '1 millisecond'
            "#,
        )
        .bind(millis(retention))
        .execute(&self.pool)
        .await
        .map_err(store_err("queue purge"))?;
        Ok(result.rows_affected())
    }

    async fn pending_depth(&self) -> Result<u64> {
        let depth = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*)::bigint FROM sync_queue WHERE status = 'pending'",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(store_err("pending depth"))?;
        Ok(u64::try_from(depth).unwrap_or(0))
    }

    async fn cancel_pending(&self, reason: Option<QueueReason>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE sync_queue
            SET status = 'cancelled', completed_at = NOW(), updated_at = NOW()
            WHERE status = 'pending'
              AND ($1::text IS NULL OR reason = $1)
            "#,
        )
        .bind(reason.map(QueueReason::as_str))
        .execute(&self.pool)
        .await
        .map_err(store_err("cancel pending"))?;
        Ok(result.rows_affected())
    }

    async fn failed_items(&self, limit: usize) -> Result<Vec<QueueItem>> {
        let sql = format!(
            r#"
            SELECT {QUEUE_COLUMNS}
            FROM sync_queue
            WHERE status = 'failed'
            ORDER BY completed_at DESC NULLS LAST, seq DESC
            LIMIT $1
            "#
        );
        sqlx::query_as::<_, QueueRow>(&sql)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(store_err("failed items"))?
            .into_iter()
            .map(QueueItem::try_from)
            .collect()
    }

    async fn retry_failed(&self, limit: usize) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE sync_queue q
            SET status = 'pending',
                attempt_count = 0,
                queued_at = NOW(),
                available_at = NOW(),
                claimed_at = NULL,
                claimed_by = NULL,
                completed_at = NULL,
                updated_at = NOW()
            WHERE q.id IN (
                SELECT DISTINCT ON (f.listing_id) f.id
                FROM sync_queue f
                WHERE f.status = 'failed'
                  AND NOT EXISTS (
                      SELECT 1 FROM sync_queue p
                      WHERE p.listing_id = f.listing_id AND p.status = 'pending'
                  )
                ORDER BY f.listing_id, f.completed_at DESC NULLS LAST
                LIMIT $1
            )
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .execute(&self.pool)
        .await
        .map_err(store_err("retry failed items"))?;
        Ok(result.rows_affected())
    }

    async fn get(&self, item_id: QueueItemId) -> Result<Option<QueueItem>> {
        let sql = format!("SELECT {QUEUE_COLUMNS} FROM sync_queue WHERE id = $1");
        sqlx::query_as::<_, QueueRow>(&sql)
            .bind(item_id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err("queue item lookup"))?
            .map(QueueItem::try_from)
            .transpose()
    }
}
