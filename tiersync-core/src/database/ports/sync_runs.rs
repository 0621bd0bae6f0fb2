use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    error::Result,
    types::{SyncRun, SyncRunCounters, SyncRunId, Tier},
};

#[derive(Clone, Debug, Default)]
pub struct RunHistoryQuery {
    pub tier: Option<Tier>,
    pub since: Option<DateTime<Utc>>,
    pub limit: usize,
}

#[async_trait]
pub trait SyncRunRepository: Send + Sync {
    async fn insert(&self, run: &SyncRun) -> Result<()>;

    async fn get(&self, id: SyncRunId) -> Result<Option<SyncRun>>;

    /// Writes counters of a run that is still running.
    async fn record_progress(
        &self,
        id: SyncRunId,
        counters: &SyncRunCounters,
    ) -> Result<()>;

    /// Writes the terminal state. Returns false if the stored run already
    /// left `Running`; terminal runs are never rewritten.
    async fn finalize(&self, run: &SyncRun) -> Result<bool>;

    async fn running(&self) -> Result<Option<SyncRun>>;

    async fn latest_for_tier(&self, tier: Tier) -> Result<Option<SyncRun>>;

    /// Most recent first.
    async fn history(&self, query: RunHistoryQuery) -> Result<Vec<SyncRun>>;

    async fn request_cancel(&self, id: SyncRunId) -> Result<bool>;

    async fn is_cancel_requested(&self, id: SyncRunId) -> Result<bool>;

    /// Fails runs still marked running that started before `started_before`.
    async fn fail_abandoned(
        &self,
        started_before: DateTime<Utc>,
    ) -> Result<Vec<SyncRunId>>;
}
