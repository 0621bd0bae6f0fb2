use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, types::Json};
use tracing::warn;
use uuid::Uuid;

use crate::{
    database::{
        infrastructure::postgres::{health_check, store_err},
        ports::sync_runs::{RunHistoryQuery, SyncRunRepository},
    },
    error::{Result, SyncError},
    types::{SessionId, SyncRun, SyncRunCounters, SyncRunId, SyncRunStatus, Tier},
};

const RUN_COLUMNS: &str = "id, tier, tier_name, status, session_id, \
     started_at, completed_at, counters, error_summary, alerts, \
     cancel_requested";

#[derive(Clone)]
pub struct PostgresSyncRunRepository {
    pool: PgPool,
}

impl fmt::Debug for PostgresSyncRunRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresSyncRunRepository")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .finish()
    }
}

#[derive(FromRow)]
struct RunRow {
    id: Uuid,
    tier: i16,
    tier_name: String,
    status: String,
    session_id: Uuid,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    counters: Json<SyncRunCounters>,
    error_summary: Option<String>,
    alerts: Json<Vec<String>>,
    cancel_requested: bool,
}

impl TryFrom<RunRow> for SyncRun {
    type Error = SyncError;

    fn try_from(row: RunRow) -> Result<Self> {
        let id = row.id;
        let corrupt =
            |e: String| SyncError::Store(format!("corrupt sync run {id}: {e}"));
        let tier = u8::try_from(row.tier)
            .map_err(|e| e.to_string())
            .and_then(Tier::try_from)
            .map_err(corrupt)?;
        let status = row.status.parse::<SyncRunStatus>().map_err(corrupt)?;
        Ok(SyncRun {
            id: SyncRunId(id),
            tier,
            tier_name: row.tier_name,
            status,
            session_id: SessionId(row.session_id),
            started_at: row.started_at,
            completed_at: row.completed_at,
            counters: row.counters.0,
            error_summary: row.error_summary,
            alerts: row.alerts.0,
            cancel_requested: row.cancel_requested,
        })
    }
}

impl PostgresSyncRunRepository {
    pub async fn new(pool: PgPool) -> Result<Self> {
        health_check(&pool, "Sync run repository").await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl SyncRunRepository for PostgresSyncRunRepository {
    async fn insert(&self, run: &SyncRun) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO sync_runs ({RUN_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"
        ))
        .bind(run.id.as_uuid())
        .bind(i16::from(run.tier.level()))
        .bind(&run.tier_name)
        .bind(run.status.as_str())
        .bind(run.session_id.as_uuid())
        .bind(run.started_at)
        .bind(run.completed_at)
        .bind(Json(&run.counters))
        .bind(&run.error_summary)
        .bind(Json(&run.alerts))
        .bind(run.cancel_requested)
        .execute(&self.pool)
        .await
        .map_err(store_err("sync run insert"))?;
        Ok(())
    }

    async fn get(&self, id: SyncRunId) -> Result<Option<SyncRun>> {
        sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {RUN_COLUMNS} FROM sync_runs WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err("sync run lookup"))?
        .map(SyncRun::try_from)
        .transpose()
    }

    async fn record_progress(
        &self,
        id: SyncRunId,
        counters: &SyncRunCounters,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE sync_runs SET counters = $2 \
             WHERE id = $1 AND status = 'running'",
        )
        .bind(id.as_uuid())
        .bind(Json(counters))
        .execute(&self.pool)
        .await
        .map_err(store_err("sync run progress"))?;
        Ok(())
    }

    async fn finalize(&self, run: &SyncRun) -> Result<bool> {
        let done = sqlx::query(
            r#"
            UPDATE sync_runs
            SET status = $2,
                completed_at = $3,
                counters = $4,
                error_summary = $5,
                alerts = $6
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(run.id.as_uuid())
        .bind(run.status.as_str())
        .bind(run.completed_at)
        .bind(Json(&run.counters))
        .bind(&run.error_summary)
        .bind(Json(&run.alerts))
        .execute(&self.pool)
        .await
        .map_err(store_err("sync run finalize"))?;

        let finalized = done.rows_affected() > 0;
        if !finalized {
            warn!(run_id = %run.id, "Sync run already terminal; not rewritten");
        }
        Ok(finalized)
    }

    async fn running(&self) -> Result<Option<SyncRun>> {
        sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {RUN_COLUMNS} FROM sync_runs WHERE status = 'running' \
             ORDER BY started_at DESC LIMIT 1"
        ))
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err("running sync run lookup"))?
        .map(SyncRun::try_from)
        .transpose()
    }

    async fn latest_for_tier(&self, tier: Tier) -> Result<Option<SyncRun>> {
        sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {RUN_COLUMNS} FROM sync_runs WHERE tier = $1 \
             ORDER BY started_at DESC LIMIT 1"
        ))
        .bind(i16::from(tier.level()))
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err("latest sync run lookup"))?
        .map(SyncRun::try_from)
        .transpose()
    }

    async fn history(&self, query: RunHistoryQuery) -> Result<Vec<SyncRun>> {
        let rows = sqlx::query_as::<_, RunRow>(&format!(
            r#"
            SELECT {RUN_COLUMNS} FROM sync_runs
            WHERE ($1::smallint IS NULL OR tier = $1)
              AND ($2::timestamptz IS NULL OR started_at >= $2)
            ORDER BY started_at DESC
            LIMIT $3
            "#
        ))
        .bind(query.tier.map(|tier| i16::from(tier.level())))
        .bind(query.since)
        .bind(i64::try_from(query.limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(store_err("sync run history"))?;
        rows.into_iter().map(SyncRun::try_from).collect()
    }

    async fn request_cancel(&self, id: SyncRunId) -> Result<bool> {
        let done = sqlx::query(
            "UPDATE sync_runs SET cancel_requested = TRUE \
             WHERE id = $1 AND status = 'running'",
        )
        .bind(id.as_uuid())
        .execute(&self.pool)
        .await
        .map_err(store_err("sync run cancel"))?;
        Ok(done.rows_affected() > 0)
    }

    async fn is_cancel_requested(&self, id: SyncRunId) -> Result<bool> {
        Ok(sqlx::query_scalar::<_, bool>(
            "SELECT cancel_requested FROM sync_runs WHERE id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err("sync run cancel lookup"))?
        .unwrap_or(false))
    }

    async fn fail_abandoned(
        &self,
        started_before: DateTime<Utc>,
    ) -> Result<Vec<SyncRunId>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            r#"
            UPDATE sync_runs
            SET status = 'failed',
                completed_at = NOW(),
                error_summary = 'abandoned'
            WHERE status = 'running' AND started_at < $1
            RETURNING id
            "#,
        )
        .bind(started_before)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err("abandoned run cleanup"))?;
        Ok(ids.into_iter().map(SyncRunId).collect())
    }
}
