use std::{collections::HashMap, fmt};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, types::Json};
use tracing::debug;

use crate::{
    database::{
        infrastructure::postgres::{health_check, store_err},
        ports::live_records::{
            LiveRecordRepository, ObservationReport, StatusTransition,
        },
    },
    error::{Result, SyncError},
    sync::{lifecycle::status_after_full_fetch, stats::QualityReport},
    types::{
        FullRecord, ListingId, ListingRef, ListingStatus, LiveRecord,
        MissingListing, ObservedListing, SessionId,
    },
};

const RECORD_COLUMNS: &str = "listing_id, url, price, title, listing_status, \
     consecutive_missing_count, last_manifest_seen_at, last_full_scrape_at, \
     scrape_priority, removed_at, details, created_at, updated_at, \
     price_at_last_manifest";

#[derive(Clone)]
pub struct PostgresLiveRecordRepository {
    pool: PgPool,
}

impl fmt::Debug for PostgresLiveRecordRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresLiveRecordRepository")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .finish()
    }
}

#[derive(FromRow)]
struct RecordRow {
    listing_id: String,
    url: String,
    price: Option<i64>,
    title: Option<String>,
    listing_status: String,
    consecutive_missing_count: i32,
    last_manifest_seen_at: Option<DateTime<Utc>>,
    last_full_scrape_at: Option<DateTime<Utc>>,
    scrape_priority: Option<i16>,
    removed_at: Option<DateTime<Utc>>,
    details: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    price_at_last_manifest: Option<i64>,
}

impl TryFrom<RecordRow> for LiveRecord {
    type Error = SyncError;

    fn try_from(row: RecordRow) -> Result<Self> {
        let listing_status =
            row.listing_status.parse::<ListingStatus>().map_err(|e| {
                SyncError::Store(format!(
                    "corrupt listing record {}: {e}",
                    row.listing_id
                ))
            })?;
        Ok(LiveRecord {
            listing_id: ListingId(row.listing_id),
            url: row.url,
            price: row.price,
            title: row.title,
            listing_status,
            consecutive_missing_count: u32::try_from(
                row.consecutive_missing_count.max(0),
            )
            .unwrap_or(0),
            last_manifest_seen_at: row.last_manifest_seen_at,
            price_at_last_manifest: row.price_at_last_manifest,
            last_full_scrape_at: row.last_full_scrape_at,
            scrape_priority: row
                .scrape_priority
                .and_then(|p| u8::try_from(p).ok()),
            removed_at: row.removed_at,
            details: row.details,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct ObservationRow {
    observed: i64,
    observed_active: i64,
    off_market: Json<Vec<ObservedListing>>,
}

#[derive(FromRow)]
struct MissRow {
    listing_id: String,
    url: String,
    consecutive_missing_count: i32,
}

#[derive(FromRow)]
struct RefRow {
    listing_id: String,
    url: String,
}

impl From<RefRow> for ListingRef {
    fn from(row: RefRow) -> Self {
        ListingRef {
            listing_id: ListingId(row.listing_id),
            url: row.url,
        }
    }
}

fn missing_count_param(count: u32) -> i32 {
    i32::try_from(count).unwrap_or(i32::MAX)
}

impl PostgresLiveRecordRepository {
    pub async fn new(pool: PgPool) -> Result<Self> {
        health_check(&pool, "Live record repository").await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl LiveRecordRepository for PostgresLiveRecordRepository {
    async fn get(&self, id: &ListingId) -> Result<Option<LiveRecord>> {
        sqlx::query_as::<_, RecordRow>(&format!(
            "SELECT {RECORD_COLUMNS} FROM listing_records WHERE listing_id = $1"
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err("listing record lookup"))?
        .map(LiveRecord::try_from)
        .transpose()
    }

    async fn get_many(
        &self,
        ids: &[ListingId],
    ) -> Result<HashMap<ListingId, LiveRecord>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let keys: Vec<String> = ids.iter().map(|id| id.0.clone()).collect();
        let rows = sqlx::query_as::<_, RecordRow>(&format!(
            "SELECT {RECORD_COLUMNS} FROM listing_records \
             WHERE listing_id = ANY($1)"
        ))
        .bind(keys)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err("listing record batch lookup"))?;

        rows.into_iter()
            .map(|row| {
                LiveRecord::try_from(row)
                    .map(|record| (record.listing_id.clone(), record))
            })
            .collect()
    }

    async fn put(&self, record: &LiveRecord) -> Result<()> {
        sqlx::query(&format!(
            r#"
            INSERT INTO listing_records ({RECORD_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (listing_id) DO UPDATE SET
                url = EXCLUDED.url,
                price = EXCLUDED.price,
                title = EXCLUDED.title,
                listing_status = EXCLUDED.listing_status,
                consecutive_missing_count = EXCLUDED.consecutive_missing_count,
                last_manifest_seen_at = EXCLUDED.last_manifest_seen_at,
                last_full_scrape_at = EXCLUDED.last_full_scrape_at,
                scrape_priority = EXCLUDED.scrape_priority,
                removed_at = EXCLUDED.removed_at,
                details = EXCLUDED.details,
                updated_at = EXCLUDED.updated_at,
                price_at_last_manifest = EXCLUDED.price_at_last_manifest
            "#
        ))
        .bind(record.listing_id.as_str())
        .bind(&record.url)
        .bind(record.price)
        .bind(&record.title)
        .bind(record.listing_status.as_str())
        .bind(missing_count_param(record.consecutive_missing_count))
        .bind(record.last_manifest_seen_at)
        .bind(record.last_full_scrape_at)
        .bind(record.scrape_priority.map(i16::from))
        .bind(record.removed_at)
        .bind(&record.details)
        .bind(record.created_at)
        .bind(record.updated_at)
        .bind(record.price_at_last_manifest)
        .execute(&self.pool)
        .await
        .map_err(store_err("listing record write"))?;
        Ok(())
    }

    async fn active_count(&self) -> Result<u64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM listing_records WHERE listing_status = 'active'",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(store_err("active record count"))?;
        Ok(count.max(0) as u64)
    }

    async fn record_observations(
        &self,
        session: SessionId,
        now: DateTime<Utc>,
    ) -> Result<ObservationReport> {
        // The final SELECT reads the CTE snapshot, so it reports statuses
        // and counts as they were before the reset.
        let row = sqlx::query_as::<_, ObservationRow>(
            r#"
            WITH observed AS (
                SELECT r.listing_id, r.url, r.listing_status,
                       r.consecutive_missing_count, m.price AS manifest_price
                FROM listing_records r
                JOIN listing_manifest m ON m.listing_id = r.listing_id
                WHERE m.seen_in_session = $1
                FOR UPDATE OF r
            ),
            reset AS (
                UPDATE listing_records r
                SET consecutive_missing_count = 0,
                    last_manifest_seen_at = $2,
                    price_at_last_manifest = o.manifest_price,
                    updated_at = $2
                FROM observed o
                WHERE r.listing_id = o.listing_id
                RETURNING r.listing_id
            )
            SELECT
                COUNT(*) AS observed,
                COUNT(*) FILTER (WHERE listing_status = 'active')
                    AS observed_active,
                COALESCE(
                    jsonb_agg(
                        jsonb_build_object(
                            'listing_id', listing_id,
                            'url', url,
                            'listing_status', listing_status,
                            'previous_missing_count', consecutive_missing_count
                        )
                        ORDER BY listing_id
                    ) FILTER (
                        WHERE listing_status IN ('confirmed_removed', 'sold')
                    ),
                    '[]'::jsonb
                ) AS off_market
            FROM observed
            "#,
        )
        .bind(session.as_uuid())
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(store_err("observation reset"))?;

        debug!(
            observed = row.observed,
            observed_active = row.observed_active,
            "Reset missing counts for observed listings"
        );
        Ok(ObservationReport {
            observed: row.observed.max(0) as u64,
            observed_active: row.observed_active.max(0) as u64,
            off_market: row.off_market.0,
        })
    }

    async fn record_misses(
        &self,
        session: SessionId,
    ) -> Result<Vec<MissingListing>> {
        let rows = sqlx::query_as::<_, MissRow>(
            r#"
            UPDATE listing_records r
            SET consecutive_missing_count = r.consecutive_missing_count + 1,
                updated_at = NOW()
            WHERE r.listing_status = 'active'
              AND NOT EXISTS (
                  SELECT 1 FROM listing_manifest m
                  WHERE m.listing_id = r.listing_id
                    AND m.seen_in_session = $1
              )
            RETURNING r.listing_id, r.url, r.consecutive_missing_count
            "#,
        )
        .bind(session.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(store_err("missing count increment"))?;

        let mut missing: Vec<MissingListing> = rows
            .into_iter()
            .map(|row| MissingListing {
                listing_id: ListingId(row.listing_id),
                url: row.url,
                consecutive_missing_count: u32::try_from(
                    row.consecutive_missing_count.max(0),
                )
                .unwrap_or(0),
            })
            .collect();
        missing.sort_by(|a, b| a.listing_id.cmp(&b.listing_id));
        Ok(missing)
    }

    async fn apply_transition(&self, transition: &StatusTransition) -> Result<bool> {
        let done = sqlx::query(
            r#"
            UPDATE listing_records
            SET listing_status = $3,
                consecutive_missing_count = $4,
                updated_at = $5,
                removed_at = CASE
                    WHEN $3 IN ('confirmed_removed', 'sold') THEN $5
                    WHEN $2 IN ('confirmed_removed', 'sold') THEN NULL
                    ELSE removed_at
                END
            WHERE listing_id = $1 AND listing_status = $2
            "#,
        )
        .bind(transition.listing_id.as_str())
        .bind(transition.from.as_str())
        .bind(transition.to.as_str())
        .bind(missing_count_param(transition.missing_count))
        .bind(transition.at)
        .execute(&self.pool)
        .await
        .map_err(store_err("status transition"))?;
        Ok(done.rows_affected() > 0)
    }

    async fn upsert_fetched(
        &self,
        id: &ListingId,
        record: &FullRecord,
        scrape_priority: u8,
        now: DateTime<Utc>,
    ) -> Result<LiveRecord> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(store_err("fetched record transaction begin"))?;

        let current = sqlx::query_scalar::<_, String>(
            "SELECT listing_status FROM listing_records \
             WHERE listing_id = $1 FOR UPDATE",
        )
        .bind(id.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(store_err("fetched record lock"))?
        .map(|raw| {
            raw.parse::<ListingStatus>().map_err(|e| {
                SyncError::Store(format!("corrupt listing record {id}: {e}"))
            })
        })
        .transpose()?;
        let status = status_after_full_fetch(current);

        let row = sqlx::query_as::<_, RecordRow>(&format!(
            r#"
            INSERT INTO listing_records (
                listing_id, url, price, title, listing_status,
                consecutive_missing_count, last_full_scrape_at,
                scrape_priority, details, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, 0, $6, $7, $8, $6, $6)
            ON CONFLICT (listing_id) DO UPDATE SET
                url = EXCLUDED.url,
                price = EXCLUDED.price,
                title = EXCLUDED.title,
                listing_status = EXCLUDED.listing_status,
                consecutive_missing_count = CASE
                    WHEN EXCLUDED.listing_status IN ('confirmed_removed', 'sold')
                        THEN listing_records.consecutive_missing_count
                    ELSE 0
                END,
                last_full_scrape_at = EXCLUDED.last_full_scrape_at,
                scrape_priority = EXCLUDED.scrape_priority,
                details = EXCLUDED.details,
                updated_at = EXCLUDED.updated_at
            RETURNING {RECORD_COLUMNS}
            "#
        ))
        .bind(id.as_str())
        .bind(&record.url)
        .bind(record.price)
        .bind(&record.title)
        .bind(status.as_str())
        .bind(now)
        .bind(i16::from(scrape_priority))
        .bind(&record.details)
        .fetch_one(&mut *tx)
        .await
        .map_err(store_err("fetched record upsert"))?;

        tx.commit()
            .await
            .map_err(store_err("fetched record transaction commit"))?;
        LiveRecord::try_from(row)
    }

    async fn stale_active(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ListingRef>> {
        let rows = sqlx::query_as::<_, RefRow>(
            r#"
            SELECT listing_id, url
            FROM listing_records
            WHERE listing_status = 'active'
              AND (last_full_scrape_at IS NULL OR last_full_scrape_at < $1)
            ORDER BY last_full_scrape_at ASC NULLS FIRST, listing_id
            LIMIT $2
            "#,
        )
        .bind(before)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(store_err("stale record scan"))?;
        Ok(rows.into_iter().map(ListingRef::from).collect())
    }

    async fn sample_active(&self, limit: usize) -> Result<Vec<ListingRef>> {
        let rows = sqlx::query_as::<_, RefRow>(
            r#"
            SELECT listing_id, url
            FROM listing_records
            WHERE listing_status = 'active'
            ORDER BY random()
            LIMIT $1
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(store_err("random record sample"))?;
        Ok(rows.into_iter().map(ListingRef::from).collect())
    }

    async fn quality(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<QualityReport> {
        let rows = sqlx::query_as::<_, (String, i64, i64)>(
            r#"
            SELECT listing_status,
                   COUNT(*),
                   COUNT(*) FILTER (
                       WHERE last_full_scrape_at IS NULL
                          OR last_full_scrape_at < $1
                   )
            FROM listing_records
            GROUP BY listing_status
            "#,
        )
        .bind(stale_before)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err("quality report"))?;

        let mut report = QualityReport {
            generated_at: Some(now),
            ..QualityReport::default()
        };
        for (status, count, stale) in rows {
            let count = count.max(0) as u64;
            report.total += count;
            if status == ListingStatus::Active.as_str() {
                report.active = count;
                report.stale_active = stale.max(0) as u64;
            }
            report.by_status.insert(status, count);
        }
        Ok(report)
    }
}
