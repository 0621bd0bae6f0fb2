//! Queue drain worker: claim, fetch, materialize, complete.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::{
    database::ports::{
        live_records::LiveRecordRepository,
        manifest::{ManifestFlags, ManifestRepository},
        sync_runs::SyncRunRepository,
    },
    error::Result,
    sync::{
        fetch::DetailFetcher,
        pacing::Pacer,
        queue::{
            ClaimRequest, CompletionOutcome, QueueItem, QueuePriority,
            QueueService, QueueStatus,
        },
    },
    types::{FullRecord, SyncRunId, WorkerId},
};

/// Where a long-running loop looks for a stop request.
#[derive(Clone, Copy)]
pub enum StopSignal<'a> {
    Never,
    Token(&'a CancellationToken),
    /// The cooperative cancel flag on a sync run.
    Run {
        runs: &'a dyn SyncRunRepository,
        run_id: SyncRunId,
    },
}

impl std::fmt::Debug for StopSignal<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopSignal::Never => f.write_str("Never"),
            StopSignal::Token(token) => f
                .debug_tuple("Token")
                .field(&token.is_cancelled())
                .finish(),
            StopSignal::Run { run_id, .. } => {
                f.debug_struct("Run").field("run_id", run_id).finish()
            }
        }
    }
}

impl StopSignal<'_> {
    pub async fn requested(&self) -> Result<bool> {
        match self {
            StopSignal::Never => Ok(false),
            StopSignal::Token(token) => Ok(token.is_cancelled()),
            StopSignal::Run { runs, run_id } => {
                runs.is_cancel_requested(*run_id).await
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct DrainOptions {
    pub batch_size: usize,
    /// Stop after this many claimed items.
    pub max_items: Option<usize>,
    /// Only claim items at or above this priority.
    pub max_priority: Option<QueuePriority>,
    /// Spacing between detail fetches.
    pub item_delay: Duration,
    /// Claims older than this are reclaimed before draining.
    pub stale_claim_timeout: Duration,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainStop {
    #[default]
    Exhausted,
    ItemCap,
    Cancelled,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainReport {
    pub reclaimed: u64,
    pub claimed: u64,
    pub scraped: u64,
    pub failed: u64,
    /// Completions refused because the claim had moved to another worker.
    pub lost_claims: u64,
    pub stopped: DrainStop,
}

pub struct QueueDrainer {
    queue: Arc<dyn QueueService>,
    manifest: Arc<dyn ManifestRepository>,
    live: Arc<dyn LiveRecordRepository>,
    detail: Arc<dyn DetailFetcher>,
    worker: WorkerId,
}

impl std::fmt::Debug for QueueDrainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueDrainer")
            .field("worker", &self.worker)
            .finish_non_exhaustive()
    }
}

impl QueueDrainer {
    pub fn new(
        queue: Arc<dyn QueueService>,
        manifest: Arc<dyn ManifestRepository>,
        live: Arc<dyn LiveRecordRepository>,
        detail: Arc<dyn DetailFetcher>,
        worker: WorkerId,
    ) -> Self {
        Self {
            queue,
            manifest,
            live,
            detail,
            worker,
        }
    }

    pub fn worker(&self) -> &WorkerId {
        &self.worker
    }

    /// Drains until the admitted backlog is empty, the item cap is reached
    /// or `stop` fires. Item failures settle through the queue; a store
    /// error aborts the drain.
    #[instrument(skip(self, stop), fields(worker = %self.worker))]
    pub async fn drain(
        &self,
        options: &DrainOptions,
        stop: StopSignal<'_>,
    ) -> Result<DrainReport> {
        let mut report = DrainReport {
            reclaimed: self.queue.reclaim_stale(options.stale_claim_timeout).await?,
            ..DrainReport::default()
        };
        let mut pacer = Pacer::new(options.item_delay);
        let batch_size = options.batch_size.max(1);

        loop {
            let remaining = match options.max_items {
                Some(cap) => {
                    let left = cap.saturating_sub(report.claimed as usize);
                    if left == 0 {
                        report.stopped = DrainStop::ItemCap;
                        break;
                    }
                    left.min(batch_size)
                }
                None => batch_size,
            };
            if stop.requested().await? {
                report.stopped = DrainStop::Cancelled;
                break;
            }

            let claimed = self
                .queue
                .claim_batch(
                    ClaimRequest::new(remaining, self.worker.clone())
                        .with_max_priority(options.max_priority),
                )
                .await?;
            if claimed.is_empty() {
                report.stopped = DrainStop::Exhausted;
                break;
            }
            report.claimed += claimed.len() as u64;

            for (index, item) in claimed.iter().enumerate() {
                // Claims left unprocessed here are recovered by reclaim.
                if index > 0 && stop.requested().await? {
                    report.stopped = DrainStop::Cancelled;
                    info!(
                        target: "tiersync::drain",
                        stranded = claimed.len() - index,
                        "Drain cancelled mid-batch"
                    );
                    return Ok(report);
                }
                pacer.wait().await;
                self.process(item, &mut report).await?;
            }
        }

        info!(
            target: "tiersync::drain",
            claimed = report.claimed,
            scraped = report.scraped,
            failed = report.failed,
            stopped = ?report.stopped,
            "Queue drain finished"
        );
        Ok(report)
    }

    async fn process(&self, item: &QueueItem, report: &mut DrainReport) -> Result<()> {
        let outcome = match self.detail.fetch_detail(&item.url).await {
            Ok(record) => match self.materialize(item, &record).await {
                Ok(()) => CompletionOutcome::Succeeded,
                Err(err) => {
                    self.settle(
                        item,
                        CompletionOutcome::retryable(err.to_string()),
                        report,
                    )
                    .await?;
                    return Err(err);
                }
            },
            Err(err) => {
                warn!(
                    target: "tiersync::drain",
                    listing_id = %item.listing_id,
                    attempt = item.attempt_count,
                    error = %err,
                    "Detail fetch failed"
                );
                err.completion_outcome()
            }
        };
        self.settle(item, outcome, report).await
    }

    /// Writes the fetched record, then clears the detection flags the fetch
    /// has covered.
    async fn materialize(&self, item: &QueueItem, record: &FullRecord) -> Result<()> {
        self.live
            .upsert_fetched(&item.listing_id, record, item.priority.value(), Utc::now())
            .await?;
        self.manifest
            .clear_flags(std::slice::from_ref(&item.listing_id), ManifestFlags::ALL)
            .await?;
        Ok(())
    }

    async fn settle(
        &self,
        item: &QueueItem,
        outcome: CompletionOutcome,
        report: &mut DrainReport,
    ) -> Result<()> {
        let succeeded = outcome == CompletionOutcome::Succeeded;
        match self.queue.complete(item.id, &self.worker, outcome).await? {
            Some(QueueStatus::Completed) if succeeded => {
                report.scraped += 1;
                debug!(
                    target: "tiersync::drain",
                    listing_id = %item.listing_id,
                    "Listing materialized"
                );
            }
            Some(_) => report.failed += 1,
            None => {
                report.lost_claims += 1;
                warn!(
                    target: "tiersync::drain",
                    item_id = %item.id,
                    listing_id = %item.listing_id,
                    "Claim lost before completion"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;

    use super::*;
    use crate::{
        database::infrastructure::memory::MemoryStore,
        sync::{
            config::QueueConfig,
            fetch::FetchError,
            queue::{EnqueueRequest, QueueReason, memory::MemoryQueueService},
        },
        types::{ListingId, ListingStatus, ManifestEntry, SessionId},
    };

    struct ScriptedDetail(HashMap<String, std::result::Result<FullRecord, FetchError>>);

    #[async_trait]
    impl DetailFetcher for ScriptedDetail {
        async fn fetch_detail(
            &self,
            url: &str,
        ) -> std::result::Result<FullRecord, FetchError> {
            self.0
                .get(url)
                .cloned()
                .unwrap_or(Err(FetchError::NotFound))
        }
    }

    fn options() -> DrainOptions {
        DrainOptions {
            batch_size: 2,
            max_items: None,
            max_priority: None,
            item_delay: Duration::ZERO,
            stale_claim_timeout: Duration::from_secs(1_800),
        }
    }

    fn record(url: &str, price: i64) -> FullRecord {
        FullRecord {
            url: url.to_string(),
            price: Some(price),
            title: Some("Flat".into()),
            details: serde_json::json!({"rooms": 2}),
        }
    }

    async fn setup(
        detail: ScriptedDetail,
    ) -> (Arc<MemoryStore>, Arc<MemoryQueueService>, QueueDrainer) {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueueService::new(3));
        let drainer = QueueDrainer::new(
            queue.clone(),
            store.clone(),
            store.clone(),
            Arc::new(detail),
            WorkerId::new("test-worker"),
        );
        (store, queue, drainer)
    }

    #[tokio::test]
    async fn successful_fetch_materializes_an_active_record() {
        let detail = ScriptedDetail(HashMap::from([(
            "u1".to_string(),
            Ok(record("u1", 250_000)),
        )]));
        let (store, queue, drainer) = setup(detail).await;
        queue
            .enqueue(EnqueueRequest::new(
                ListingId::from("l1"),
                "u1",
                QueueReason::NewProperty,
            ))
            .await
            .unwrap();

        let report = drainer.drain(&options(), StopSignal::Never).await.unwrap();

        assert_eq!(report.scraped, 1);
        assert_eq!(report.stopped, DrainStop::Exhausted);
        let live = LiveRecordRepository::get(store.as_ref(), &ListingId::from("l1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(live.listing_status, ListingStatus::Active);
        assert_eq!(live.price, Some(250_000));
        assert_eq!(live.scrape_priority, Some(1));
        assert!(live.last_full_scrape_at.is_some());
    }

    async fn flag_new(store: &MemoryStore, id: &str, url: &str) {
        let now = Utc::now();
        let entry = ManifestEntry {
            listing_id: ListingId::from(id),
            url: url.to_string(),
            price: Some(250_000),
            title: None,
            latitude: None,
            longitude: None,
            first_seen_at: now,
            last_seen_at: now,
            seen_in_session: Some(SessionId::new()),
            is_new: true,
            needs_full_scrape: true,
            price_changed: false,
        };
        ManifestRepository::upsert_many(store, &[entry]).await.unwrap();
    }

    async fn manifest_row(store: &MemoryStore, id: &str) -> ManifestEntry {
        let id = ListingId::from(id);
        ManifestRepository::get_many(store, std::slice::from_ref(&id))
            .await
            .unwrap()
            .remove(&id)
            .unwrap()
    }

    #[tokio::test]
    async fn flags_clear_only_after_a_successful_fetch() {
        let detail = ScriptedDetail(HashMap::from([
            ("u1".to_string(), Ok(record("u1", 250_000))),
            ("u2".to_string(), Err(FetchError::Transient("503".into()))),
        ]));
        let (store, queue, drainer) = setup(detail).await;
        for (id, url) in [("l1", "u1"), ("l2", "u2")] {
            flag_new(&store, id, url).await;
            queue
                .enqueue(EnqueueRequest::new(
                    ListingId::from(id),
                    url,
                    QueueReason::NewProperty,
                ))
                .await
                .unwrap();
        }

        let report = drainer.drain(&options(), StopSignal::Never).await.unwrap();
        assert_eq!(report.scraped, 1);

        let fetched = manifest_row(&store, "l1").await;
        assert!(!fetched.is_new && !fetched.needs_full_scrape);
        let failing = manifest_row(&store, "l2").await;
        assert!(failing.is_new && failing.needs_full_scrape);
    }

    #[tokio::test]
    async fn backed_off_item_is_not_retried_in_the_same_drain() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueueService::from_config(&QueueConfig::default()));
        let drainer = QueueDrainer::new(
            queue.clone(),
            store.clone(),
            store.clone(),
            Arc::new(ScriptedDetail(HashMap::from([(
                "u1".to_string(),
                Err(FetchError::Transient("503".into())),
            )]))),
            WorkerId::new("test-worker"),
        );
        let id = queue
            .enqueue(EnqueueRequest::new(
                ListingId::from("l1"),
                "u1",
                QueueReason::NewProperty,
            ))
            .await
            .unwrap()
            .item_id();

        let report = drainer.drain(&options(), StopSignal::Never).await.unwrap();

        assert_eq!(report.claimed, 1);
        assert_eq!(report.stopped, DrainStop::Exhausted);
        let item = queue.get(id).await.unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::Pending);
        assert_eq!(item.attempt_count, 1);
        assert!(item.available_at > Utc::now());
    }

    #[tokio::test]
    async fn not_found_fails_without_retry() {
        let (_store, queue, drainer) = setup(ScriptedDetail(HashMap::new())).await;
        let outcome = queue
            .enqueue(EnqueueRequest::new(
                ListingId::from("gone"),
                "missing",
                QueueReason::StaleData,
            ))
            .await
            .unwrap();

        let report = drainer.drain(&options(), StopSignal::Never).await.unwrap();

        assert_eq!(report.failed, 1);
        let item = queue.get(outcome.item_id()).await.unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::Failed);
        assert_eq!(item.attempt_count, 1);
    }

    #[tokio::test]
    async fn respects_item_cap_and_priority_ceiling() {
        let detail = ScriptedDetail(
            (0..5)
                .map(|i| (format!("u{i}"), Ok(record(&format!("u{i}"), 1))))
                .collect(),
        );
        let (_store, queue, drainer) = setup(detail).await;
        for i in 0..3 {
            queue
                .enqueue(EnqueueRequest::new(
                    ListingId::new(format!("n{i}")),
                    format!("u{i}"),
                    QueueReason::NewProperty,
                ))
                .await
                .unwrap();
        }
        queue
            .enqueue(EnqueueRequest::new(
                ListingId::from("s"),
                "u4",
                QueueReason::StaleData,
            ))
            .await
            .unwrap();

        let capped = DrainOptions {
            max_items: Some(2),
            max_priority: Some(QueuePriority::P1),
            ..options()
        };
        let report = drainer.drain(&capped, StopSignal::Never).await.unwrap();
        assert_eq!(report.claimed, 2);
        assert_eq!(report.stopped, DrainStop::ItemCap);

        let hot_only = DrainOptions {
            max_priority: Some(QueuePriority::P1),
            ..options()
        };
        let report = drainer.drain(&hot_only, StopSignal::Never).await.unwrap();
        assert_eq!(report.claimed, 1);
        assert_eq!(queue.pending_depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_claiming() {
        let (_store, queue, drainer) = setup(ScriptedDetail(HashMap::new())).await;
        queue
            .enqueue(EnqueueRequest::new(
                ListingId::from("l"),
                "u",
                QueueReason::NewProperty,
            ))
            .await
            .unwrap();
        let token = CancellationToken::new();
        token.cancel();

        let report = drainer
            .drain(&options(), StopSignal::Token(&token))
            .await
            .unwrap();

        assert_eq!(report.claimed, 0);
        assert_eq!(report.stopped, DrainStop::Cancelled);
        assert_eq!(queue.pending_depth().await.unwrap(), 1);
    }
}
