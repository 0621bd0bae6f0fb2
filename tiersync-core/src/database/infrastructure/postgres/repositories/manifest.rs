use std::{collections::HashMap, fmt};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder};
use tracing::debug;
use uuid::Uuid;

use crate::{
    database::{
        infrastructure::postgres::{health_check, store_err},
        ports::manifest::{ManifestFlags, ManifestRepository},
    },
    error::Result,
    sync::stats::ManifestStats,
    types::{ListingId, ManifestEntry, SessionId},
};

const MANIFEST_COLUMNS: &str = "listing_id, url, price, title, latitude, \
     longitude, first_seen_at, last_seen_at, seen_in_session, is_new, \
     needs_full_scrape, price_changed";

/// Twelve binds per row keeps each statement well under the protocol limit.
const UPSERT_CHUNK: usize = 1_000;

#[derive(Clone)]
pub struct PostgresManifestRepository {
    pool: PgPool,
}

impl fmt::Debug for PostgresManifestRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresManifestRepository")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .finish()
    }
}

#[derive(FromRow)]
struct ManifestRow {
    listing_id: String,
    url: String,
    price: Option<i64>,
    title: Option<String>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    first_seen_at: DateTime<Utc>,
    last_seen_at: DateTime<Utc>,
    seen_in_session: Option<Uuid>,
    is_new: bool,
    needs_full_scrape: bool,
    price_changed: bool,
}

impl From<ManifestRow> for ManifestEntry {
    fn from(row: ManifestRow) -> Self {
        ManifestEntry {
            listing_id: ListingId(row.listing_id),
            url: row.url,
            price: row.price,
            title: row.title,
            latitude: row.latitude,
            longitude: row.longitude,
            first_seen_at: row.first_seen_at,
            last_seen_at: row.last_seen_at,
            seen_in_session: row.seen_in_session.map(SessionId),
            is_new: row.is_new,
            needs_full_scrape: row.needs_full_scrape,
            price_changed: row.price_changed,
        }
    }
}

#[derive(FromRow)]
struct ManifestStatsRow {
    total: i64,
    flagged_new: i64,
    needs_full_scrape: i64,
    price_changed: i64,
    average_staleness_hours: Option<f64>,
    oldest_last_seen_at: Option<DateTime<Utc>>,
}

fn id_strings(ids: &[ListingId]) -> Vec<String> {
    ids.iter().map(|id| id.0.clone()).collect()
}

impl PostgresManifestRepository {
    pub async fn new(pool: PgPool) -> Result<Self> {
        health_check(&pool, "Manifest repository").await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl ManifestRepository for PostgresManifestRepository {
    async fn get_many(
        &self,
        ids: &[ListingId],
    ) -> Result<HashMap<ListingId, ManifestEntry>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = sqlx::query_as::<_, ManifestRow>(&format!(
            "SELECT {MANIFEST_COLUMNS} FROM listing_manifest \
             WHERE listing_id = ANY($1)"
        ))
        .bind(id_strings(ids))
        .fetch_all(&self.pool)
        .await
        .map_err(store_err("manifest lookup"))?;

        Ok(rows
            .into_iter()
            .map(ManifestEntry::from)
            .map(|entry| (entry.listing_id.clone(), entry))
            .collect())
    }

    async fn upsert_many(&self, entries: &[ManifestEntry]) -> Result<u64> {
        if entries.is_empty() {
            return Ok(0);
        }
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(store_err("manifest transaction begin"))?;

        let mut written = 0u64;
        for chunk in entries.chunks(UPSERT_CHUNK) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                "INSERT INTO listing_manifest ({MANIFEST_COLUMNS}) "
            ));
            builder.push_values(chunk, |mut row, entry| {
                row.push_bind(entry.listing_id.as_str())
                    .push_bind(&entry.url)
                    .push_bind(entry.price)
                    .push_bind(&entry.title)
                    .push_bind(entry.latitude)
                    .push_bind(entry.longitude)
                    .push_bind(entry.first_seen_at)
                    .push_bind(entry.last_seen_at)
                    .push_bind(entry.seen_in_session.map(|s| s.as_uuid()))
                    .push_bind(entry.is_new)
                    .push_bind(entry.needs_full_scrape)
                    .push_bind(entry.price_changed);
            });
            builder.push(
                r#"
                ON CONFLICT (listing_id) DO UPDATE SET
                    url = EXCLUDED.url,
                    price = EXCLUDED.price,
                    title = EXCLUDED.title,
                    latitude = EXCLUDED.latitude,
                    longitude = EXCLUDED.longitude,
                    first_seen_at = LEAST(listing_manifest.first_seen_at, EXCLUDED.first_seen_at),
                    last_seen_at = EXCLUDED.last_seen_at,
                    seen_in_session = EXCLUDED.seen_in_session,
                    is_new = EXCLUDED.is_new,
                    needs_full_scrape = EXCLUDED.needs_full_scrape,
                    price_changed = EXCLUDED.price_changed
                "#,
            );
            let done = builder
                .build()
                .execute(&mut *tx)
                .await
                .map_err(store_err("manifest upsert"))?;
            written += done.rows_affected();
        }

        tx.commit()
            .await
            .map_err(store_err("manifest transaction commit"))?;
        debug!(written, "Manifest batch upserted");
        Ok(written)
    }

    async fn session_entries(
        &self,
        session: SessionId,
    ) -> Result<Vec<ManifestEntry>> {
        let rows = sqlx::query_as::<_, ManifestRow>(&format!(
            "SELECT {MANIFEST_COLUMNS} FROM listing_manifest \
             WHERE seen_in_session = $1 ORDER BY listing_id"
        ))
        .bind(session.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(store_err("manifest session scan"))?;
        Ok(rows.into_iter().map(ManifestEntry::from).collect())
    }

    async fn count_in_session(&self, session: SessionId) -> Result<u64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM listing_manifest WHERE seen_in_session = $1",
        )
        .bind(session.as_uuid())
        .fetch_one(&self.pool)
        .await
        .map_err(store_err("manifest session count"))?;
        Ok(count.max(0) as u64)
    }

    async fn clear_flags(
        &self,
        ids: &[ListingId],
        flags: ManifestFlags,
    ) -> Result<u64> {
        if ids.is_empty() || (!flags.is_new && !flags.price_changed) {
            return Ok(0);
        }
        // SET expressions see the pre-update row, so needs_full_scrape is
        // recomputed from the same CASE arms.
        let done = sqlx::query(
            r#"
            UPDATE listing_manifest
            SET is_new = CASE WHEN $2 THEN FALSE ELSE is_new END,
                price_changed = CASE WHEN $3 THEN FALSE ELSE price_changed END,
                needs_full_scrape =
                    (CASE WHEN $2 THEN FALSE ELSE is_new END)
                    OR (CASE WHEN $3 THEN FALSE ELSE price_changed END)
            WHERE listing_id = ANY($1)
            "#,
        )
        .bind(id_strings(ids))
        .bind(flags.is_new)
        .bind(flags.price_changed)
        .execute(&self.pool)
        .await
        .map_err(store_err("manifest flag clear"))?;
        Ok(done.rows_affected())
    }

    async fn delete(&self, id: &ListingId) -> Result<bool> {
        let done =
            sqlx::query("DELETE FROM listing_manifest WHERE listing_id = $1")
                .bind(id.as_str())
                .execute(&self.pool)
                .await
                .map_err(store_err("manifest delete"))?;
        Ok(done.rows_affected() > 0)
    }

    async fn stats(&self, now: DateTime<Utc>) -> Result<ManifestStats> {
        let row = sqlx::query_as::<_, ManifestStatsRow>(
            r#"
            SELECT
                COUNT(*) AS total,
                COUNT(*) FILTER (WHERE is_new) AS flagged_new,
                COUNT(*) FILTER (WHERE needs_full_scrape) AS needs_full_scrape,
                COUNT(*) FILTER (WHERE price_changed) AS price_changed,
                (AVG(EXTRACT(EPOCH FROM ($1 - last_seen_at))) / 3600.0)::float8
                    AS average_staleness_hours,
                MIN(last_seen_at) AS oldest_last_seen_at
            FROM listing_manifest
            "#,
        )
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(store_err("manifest stats"))?;

        Ok(ManifestStats {
            total: row.total.max(0) as u64,
            flagged_new: row.flagged_new.max(0) as u64,
            needs_full_scrape: row.needs_full_scrape.max(0) as u64,
            price_changed: row.price_changed.max(0) as u64,
            average_staleness_hours: row.average_staleness_hours,
            oldest_last_seen_at: row.oldest_last_seen_at,
        })
    }
}
