//! One parameterized workflow for every tier:
//! scan, diff, confirm removals, enqueue, drain, finalize.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    database::{
        infrastructure::memory::MemoryStore,
        ports::{
            live_records::LiveRecordRepository,
            manifest::ManifestRepository,
            sync_runs::SyncRunRepository,
        },
    },
    error::{Result, SyncError},
    sync::{
        config::{ListingSource, QueueConfig, SyncConfig, TierSettings},
        diff::DiffEngine,
        drain::{DrainOptions, DrainStop, QueueDrainer, StopSignal},
        fetch::{DetailFetcher, FetchError, ScanFetcher, ScanPage},
        pacing::Pacer,
        queue::{
            EnqueueRequest, QueuePriority, QueueReason, QueueService,
            cutoff, memory::MemoryQueueService,
        },
        removal::RemovalConfirmation,
        stats::QualityReport,
    },
    types::{ListingRef, ManifestEntry, SyncRun, SyncRunStatus, Tier, WorkerId},
};

/// Unbounded scans give up on a source after this many failed pages in a
/// row.
const MAX_CONSECUTIVE_PAGE_FAILURES: u32 = 3;

/// Every store the engine touches.
#[derive(Clone)]
pub struct SyncStores {
    pub manifest: Arc<dyn ManifestRepository>,
    pub live: Arc<dyn LiveRecordRepository>,
    pub runs: Arc<dyn SyncRunRepository>,
    pub queue: Arc<dyn QueueService>,
}

impl std::fmt::Debug for SyncStores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncStores").finish_non_exhaustive()
    }
}

impl SyncStores {
    /// One shared in-memory store plus an in-memory queue.
    pub fn memory(
        queue: &QueueConfig,
    ) -> (Self, Arc<MemoryStore>, Arc<MemoryQueueService>) {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueueService::from_config(queue));
        let stores = Self {
            manifest: store.clone(),
            live: store.clone(),
            runs: store.clone(),
            queue: queue.clone(),
        };
        (stores, store, queue)
    }

    #[cfg(feature = "postgres")]
    pub async fn postgres(pool: sqlx::PgPool, config: &SyncConfig) -> Result<Self> {
        use crate::{
            database::infrastructure::postgres::{
                PostgresLiveRecordRepository, PostgresManifestRepository,
                PostgresSyncRunRepository,
            },
            sync::queue::persistence::PostgresQueueService,
        };

        Ok(Self {
            manifest: Arc::new(PostgresManifestRepository::new(pool.clone()).await?),
            live: Arc::new(PostgresLiveRecordRepository::new(pool.clone()).await?),
            runs: Arc::new(PostgresSyncRunRepository::new(pool.clone()).await?),
            queue: Arc::new(PostgresQueueService::new(pool, &config.queue).await?),
        })
    }
}

/// Enqueues one detection batch and tallies what happened.
#[derive(Debug, Default)]
struct EnqueueTally {
    inserted: u64,
    suppressed: u64,
    /// Listings that now have a pending item, inserted or already there.
    handled: u64,
}

pub struct TierOrchestrator {
    stores: SyncStores,
    scanner: Arc<dyn ScanFetcher>,
    detail: Arc<dyn DetailFetcher>,
    config: Arc<SyncConfig>,
    worker: WorkerId,
}

impl std::fmt::Debug for TierOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TierOrchestrator")
            .field("worker", &self.worker)
            .field("tiers", &self.config.tiers.len())
            .finish_non_exhaustive()
    }
}

impl TierOrchestrator {
    pub fn new(
        stores: SyncStores,
        scanner: Arc<dyn ScanFetcher>,
        detail: Arc<dyn DetailFetcher>,
        config: Arc<SyncConfig>,
    ) -> Self {
        Self {
            stores,
            scanner,
            detail,
            config,
            worker: WorkerId::for_process(),
        }
    }

    pub fn with_worker(mut self, worker: WorkerId) -> Self {
        self.worker = worker;
        self
    }

    pub fn stores(&self) -> &SyncStores {
        &self.stores
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn drainer(&self) -> QueueDrainer {
        QueueDrainer::new(
            self.stores.queue.clone(),
            self.stores.manifest.clone(),
            self.stores.live.clone(),
            self.detail.clone(),
            self.worker.clone(),
        )
    }

    /// Quality of the live records against the monthly tier's stale window
    /// (30 days when the tier has no stale policy).
    pub async fn quality_report(&self, now: DateTime<Utc>) -> Result<QualityReport> {
        let window_days = self
            .config
            .tier(Tier::MonthlyRefresh)
            .ok()
            .and_then(|settings| settings.stale)
            .map_or(30, |stale| stale.after_days);
        self.stores
            .live
            .quality(
                cutoff(now, Duration::from_secs(u64::from(window_days) * 86_400)),
                now,
            )
            .await
    }

    fn diff_engine(&self) -> DiffEngine {
        DiffEngine::new(
            self.stores.manifest.clone(),
            self.stores.live.clone(),
            self.config.diff.clone(),
        )
    }

    /// Runs `tier` to a terminal state and returns the finalized record.
    ///
    /// Only failures to create or finalize the run record are returned as
    /// errors; everything else is recorded on the run.
    #[instrument(skip(self), fields(tier = %tier))]
    pub async fn run(&self, tier: Tier) -> Result<SyncRun> {
        let settings = self.config.tier(tier)?.clone();
        let mut run = SyncRun::start(tier, settings.name.clone(), Utc::now());
        self.stores.runs.insert(&run).await?;
        info!(
            target: "tiersync::tier",
            run_id = %run.id,
            session = %run.session_id,
            name = %settings.name,
            "Tier run started"
        );

        let outcome = self.execute(&mut run, &settings).await;
        run.completed_at = Some(Utc::now());
        match outcome {
            Ok(()) => run.status = SyncRunStatus::Completed,
            Err(SyncError::Cancelled(reason)) => {
                run.status = SyncRunStatus::Cancelled;
                run.error_summary = Some(reason);
            }
            Err(err) => {
                error!(
                    target: "tiersync::tier",
                    run_id = %run.id,
                    error = %err,
                    "Tier run failed"
                );
                run.status = SyncRunStatus::Failed;
                run.error_summary = Some(err.to_string());
            }
        }

        if !self.stores.runs.finalize(&run).await? {
            // Finalized elsewhere, e.g. failed as abandoned.
            if let Some(stored) = self.stores.runs.get(run.id).await? {
                return Ok(stored);
            }
        }
        info!(
            target: "tiersync::tier",
            run_id = %run.id,
            status = %run.status,
            pages = run.counters.pages_scanned,
            new = run.counters.new_count,
            changed = run.counters.changed_count,
            removed = run.counters.removed_count,
            queued = run.counters.queued_count,
            scraped = run.counters.scraped_count,
            "Tier run finished"
        );
        Ok(run)
    }

    async fn execute(&self, run: &mut SyncRun, settings: &TierSettings) -> Result<()> {
        let engine = self.diff_engine();
        let session = run.session_id;

        self.scan(run, settings, &engine).await?;
        self.checkpoint(run).await?;

        let now = Utc::now();
        let reobserved = engine.apply_reobservations(session, now).await?;
        let relisted = self
            .enqueue_all(run, reobserved.relisted, QueueReason::Relisted)
            .await?;
        run.counters.relisted_count += relisted.handled;

        // Flags stay set until the drain materializes the listing, so a
        // detection that is already pending is not counted again.
        if settings.detections.new_listings {
            let new = engine.detect_new(session).await?;
            let tally = self
                .enqueue_all(
                    run,
                    new.into_iter().map(to_ref).collect(),
                    QueueReason::NewProperty,
                )
                .await?;
            run.counters.new_count += tally.inserted;
        }

        if settings.detections.price_changes {
            let changed = engine.detect_price_changes(session).await?;
            let tally = self
                .enqueue_all(
                    run,
                    changed.into_iter().map(to_ref).collect(),
                    QueueReason::PriceChange,
                )
                .await?;
            run.counters.changed_count += tally.inserted;
        }
        self.checkpoint(run).await?;

        if settings.detections.removals {
            self.process_removals(run, settings, &engine, reobserved.observed_active)
                .await?;
            self.checkpoint(run).await?;
        }

        if let Some(stale) = settings.stale {
            let before = cutoff(
                Utc::now(),
                Duration::from_secs(u64::from(stale.after_days) * 86_400),
            );
            let refs = self.stores.live.stale_active(before, stale.cap).await?;
            self.enqueue_all(run, refs, QueueReason::StaleData).await?;
        }

        if let Some(percent) = settings.random_sample_percent {
            let active = self.stores.live.active_count().await?;
            let size = ((active as f64) * percent / 100.0).ceil() as usize;
            if size > 0 {
                let refs = self.stores.live.sample_active(size).await?;
                self.enqueue_all(run, refs, QueueReason::RandomSample).await?;
            }
        }
        self.checkpoint(run).await?;

        let drain = self
            .drainer()
            .drain(
                &DrainOptions {
                    batch_size: self.config.queue.claim_batch_size,
                    max_items: Some(settings.max_queue_items),
                    max_priority: settings
                        .drain_max_priority
                        .and_then(|p| QueuePriority::try_from(p).ok()),
                    item_delay: settings.detail_delay(),
                    stale_claim_timeout: self.config.queue.stale_claim_timeout(),
                },
                StopSignal::Run {
                    runs: self.stores.runs.as_ref(),
                    run_id: run.id,
                },
            )
            .await?;
        run.counters.scraped_count += drain.scraped;
        run.counters.error_count += drain.failed;
        if drain.stopped == DrainStop::Cancelled {
            return Err(SyncError::Cancelled("cancel requested during drain".into()));
        }

        if settings.tier == Tier::MonthlyRefresh {
            let report = self.quality_report(Utc::now()).await?;
            info!(target: "tiersync::tier", "{}", report.summary_line());
            run.alerts.push(report.summary_line());
        }
        Ok(())
    }

    /// Scans every configured source within the tier's page scope.
    async fn scan(
        &self,
        run: &mut SyncRun,
        settings: &TierSettings,
        engine: &DiffEngine,
    ) -> Result<()> {
        let mut pacer = Pacer::new(settings.page_delay());
        let bounded = settings.max_pages_per_source > 0;
        let page_limit = if bounded {
            settings.max_pages_per_source.min(settings.page_hard_cap)
        } else {
            settings.page_hard_cap
        };
        let scope = bounded.then(|| {
            u64::from(page_limit) * self.config.sources.sources.len() as u64
        });

        for source in &self.config.sources.sources {
            let mut consecutive_failures = 0u32;
            for page in 1..=page_limit {
                self.checkpoint(run).await?;
                pacer.wait().await;

                match self.fetch_page_with_retry(source, page).await {
                    Ok(scan) => {
                        consecutive_failures = 0;
                        run.counters.pages_scanned += 1;
                        let has_more = scan.has_more && !scan.entries.is_empty();
                        let ingest = engine
                            .ingest_scan(run.session_id, scan.entries, Utc::now())
                            .await?;
                        run.counters.manifest_size += ingest.written;
                        debug!(
                            target: "tiersync::scan",
                            source = %source.name,
                            page,
                            written = ingest.written,
                            "Scanned page"
                        );
                        if !has_more {
                            break;
                        }
                    }
                    Err(err) => {
                        consecutive_failures += 1;
                        run.counters.pages_failed += 1;
                        run.counters.error_count += 1;
                        warn!(
                            target: "tiersync::scan",
                            run_id = %run.id,
                            source = %source.name,
                            page,
                            error = %err,
                            "Skipping page after retries"
                        );
                        if let Some(scope) = scope {
                            self.check_page_failures(run, scope)?;
                        } else if consecutive_failures >= MAX_CONSECUTIVE_PAGE_FAILURES {
                            warn!(
                                target: "tiersync::scan",
                                source = %source.name,
                                page,
                                "Too many consecutive page failures; ending source"
                            );
                            break;
                        }
                    }
                }
            }
        }

        let attempted = run.counters.pages_scanned + run.counters.pages_failed;
        self.check_page_failures(run, scope.unwrap_or(attempted))
    }

    /// Fails the run once failed pages exceed the allowed share of `scope`.
    fn check_page_failures(&self, run: &mut SyncRun, scope: u64) -> Result<()> {
        let failed = run.counters.pages_failed;
        let limit = u64::from(self.config.max_page_error_percent);
        if scope > 0 && failed * 100 > scope * limit {
            let message = format!(
                "{failed} of {scope} scan pages failed (limit {limit}%)"
            );
            warn!(target: "tiersync::scan", run_id = %run.id, "{message}; aborting run");
            run.alerts.push(format!("scan aborted: {message}"));
            return Err(SyncError::TransientFetch(message));
        }
        Ok(())
    }

    async fn fetch_page_with_retry(
        &self,
        source: &ListingSource,
        page: u32,
    ) -> std::result::Result<ScanPage, FetchError> {
        let retry = self.config.page_retry;
        let mut attempt = 0u16;
        loop {
            match self.scanner.fetch_page(source, page).await {
                Ok(scan) => return Ok(scan),
                Err(err) if err.is_retryable() && attempt < retry.max_retries => {
                    attempt += 1;
                    let delay = retry.delay_for(attempt);
                    debug!(
                        target: "tiersync::scan",
                        source = %source.name,
                        page,
                        attempt,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying page"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn process_removals(
        &self,
        run: &mut SyncRun,
        settings: &TierSettings,
        engine: &DiffEngine,
        observed_active: u64,
    ) -> Result<()> {
        let scan = match engine
            .detect_removal_candidates(run.session_id, observed_active)
            .await
        {
            Ok(scan) => scan,
            Err(err @ SyncError::CoverageTooLow { .. }) => {
                warn!(
                    target: "tiersync::tier",
                    run_id = %run.id,
                    error = %err,
                    "Removal processing skipped"
                );
                run.alerts.push(format!("coverage alert: {err}"));
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        if scan.candidates.is_empty() {
            return Ok(());
        }

        let confirmation = RemovalConfirmation::new(
            self.stores.live.clone(),
            self.stores.manifest.clone(),
            self.detail.clone(),
            self.config.diff.min_missing_count_for_removal,
        );
        let report = confirmation
            .confirm(&scan.candidates, settings.detail_delay(), Utc::now())
            .await?;
        run.counters.removed_count += report.confirmed_absent();
        self.enqueue_all(run, report.still_present, QueueReason::Verification)
            .await?;
        Ok(())
    }

    /// Enqueues `refs` for `reason`. Deferrable reasons stop once the
    /// pending depth reaches the backpressure ceiling.
    async fn enqueue_all(
        &self,
        run: &mut SyncRun,
        refs: Vec<ListingRef>,
        reason: QueueReason,
    ) -> Result<EnqueueTally> {
        let mut tally = EnqueueTally::default();
        if refs.is_empty() {
            return Ok(tally);
        }
        let ceiling = self.config.queue.max_pending;
        let mut depth = if reason.is_deferrable() {
            self.stores.queue.pending_depth().await?
        } else {
            0
        };

        let total = refs.len() as u64;
        for listing in refs {
            if reason.is_deferrable() && depth >= ceiling {
                tally.suppressed = total - tally.handled;
                break;
            }
            let outcome = self
                .stores
                .queue
                .enqueue(
                    EnqueueRequest::new(listing.listing_id, listing.url, reason)
                        .with_session(run.session_id),
                )
                .await?;
            if outcome.inserted() {
                tally.inserted += 1;
                depth += 1;
            }
            tally.handled += 1;
        }

        run.counters.queued_count += tally.inserted;
        run.counters.suppressed_count += tally.suppressed;
        if tally.suppressed > 0 {
            info!(
                target: "tiersync::tier",
                run_id = %run.id,
                reason = reason.as_str(),
                suppressed = tally.suppressed,
                ceiling,
                "Queue over ceiling; suppressed low-priority enqueues"
            );
        }
        Ok(tally)
    }

    /// Honors a cooperative cancel request and persists counters.
    async fn checkpoint(&self, run: &SyncRun) -> Result<()> {
        if self.stores.runs.is_cancel_requested(run.id).await? {
            info!(target: "tiersync::tier", run_id = %run.id, "Cancel requested");
            return Err(SyncError::Cancelled("cancel requested".into()));
        }
        self.stores
            .runs
            .record_progress(run.id, &run.counters)
            .await
    }
}

fn to_ref(entry: ManifestEntry) -> ListingRef {
    ListingRef {
        listing_id: entry.listing_id,
        url: entry.url,
    }
}
