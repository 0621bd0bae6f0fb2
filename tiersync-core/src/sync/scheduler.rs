//! Decides which tier is due and keeps tier runs strictly one at a time.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    database::ports::sync_runs::{RunHistoryQuery, SyncRunRepository},
    error::{Result, SyncError},
    sync::{orchestrator::TierOrchestrator, queue::cutoff},
    types::{SyncRun, SyncRunCounters, SyncRunId, Tier},
};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TierSchedule {
    pub tier: Tier,
    pub name: String,
    pub frequency_hours: u32,
    pub last_run: Option<SyncRun>,
    pub due: bool,
    pub next_run_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScheduleStatus {
    pub generated_at: DateTime<Utc>,
    pub running: Option<SyncRun>,
    pub tiers: Vec<TierSchedule>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TierSummary {
    pub tier: Option<Tier>,
    pub name: String,
    pub runs: u64,
    pub by_status: BTreeMap<String, u64>,
    pub counters: SyncRunCounters,
}

pub struct Scheduler {
    orchestrator: Arc<TierOrchestrator>,
    runs: Arc<dyn SyncRunRepository>,
    gate: Mutex<()>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("orchestrator", &self.orchestrator)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    pub fn new(orchestrator: Arc<TierOrchestrator>) -> Self {
        let runs = orchestrator.stores().runs.clone();
        Self {
            orchestrator,
            runs,
            gate: Mutex::new(()),
        }
    }

    pub fn orchestrator(&self) -> &Arc<TierOrchestrator> {
        &self.orchestrator
    }

    fn frequency(&self, tier: Tier) -> Result<chrono::Duration> {
        Ok(self.orchestrator.config().tier(tier)?.frequency())
    }

    /// A tier is due when it never ran or its last start is at least one
    /// frequency ago.
    pub async fn is_due(&self, tier: Tier, now: DateTime<Utc>) -> Result<bool> {
        let frequency = self.frequency(tier)?;
        Ok(match self.runs.latest_for_tier(tier).await? {
            None => true,
            Some(last) => now - last.started_at >= frequency,
        })
    }

    pub async fn next_run_at(
        &self,
        tier: Tier,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        let frequency = self.frequency(tier)?;
        Ok(match self.runs.latest_for_tier(tier).await? {
            None => now,
            Some(last) => (last.started_at + frequency).max(now),
        })
    }

    /// Fails runs left `running` by a process that died.
    pub async fn fail_abandoned(&self) -> Result<Vec<SyncRunId>> {
        let after = self.orchestrator.config().scheduler.abandoned_run_after();
        let failed = self.runs.fail_abandoned(cutoff(Utc::now(), after)).await?;
        for run_id in &failed {
            warn!(
                target: "tiersync::scheduler",
                run_id = %run_id,
                "Marked abandoned run as failed"
            );
        }
        Ok(failed)
    }

    /// Runs one tier. Without `force` this refuses while any run is
    /// recorded as running; runs in this process are always serialized.
    pub async fn run_tier(&self, tier: Tier, force: bool) -> Result<SyncRun> {
        let _guard = self.gate.lock().await;
        self.fail_abandoned().await?;
        if !force && let Some(running) = self.runs.running().await? {
            return Err(SyncError::TierBusy {
                running: running.tier,
            });
        }
        self.orchestrator.run(tier).await
    }

    /// Runs every due tier, lowest level first.
    pub async fn run_scheduled(&self, now: DateTime<Utc>) -> Result<Vec<SyncRun>> {
        self.fail_abandoned().await?;
        let mut completed = Vec::new();
        for tier in Tier::ALL {
            if !self.is_due(tier, now).await? {
                continue;
            }
            match self.run_tier(tier, false).await {
                Ok(run) => completed.push(run),
                Err(SyncError::TierBusy { running }) => {
                    info!(
                        target: "tiersync::scheduler",
                        running = %running,
                        "Another tier is running; deferring"
                    );
                    break;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(completed)
    }

    pub async fn status(&self, now: DateTime<Utc>) -> Result<ScheduleStatus> {
        let mut tiers = Vec::with_capacity(Tier::ALL.len());
        for settings in &self.orchestrator.config().tiers {
            let last_run = self.runs.latest_for_tier(settings.tier).await?;
            tiers.push(TierSchedule {
                tier: settings.tier,
                name: settings.name.clone(),
                frequency_hours: settings.frequency_hours,
                due: self.is_due(settings.tier, now).await?,
                next_run_at: self.next_run_at(settings.tier, now).await?,
                last_run,
            });
        }
        tiers.sort_by_key(|t| t.tier);
        Ok(ScheduleStatus {
            generated_at: now,
            running: self.runs.running().await?,
            tiers,
        })
    }

    pub async fn history(&self, query: RunHistoryQuery) -> Result<Vec<SyncRun>> {
        self.runs.history(query).await
    }

    /// Per-tier totals over the last `days`.
    pub async fn summary(
        &self,
        days: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<TierSummary>> {
        let since = cutoff(now, Duration::from_secs(u64::from(days) * 86_400));
        let runs = self
            .runs
            .history(RunHistoryQuery {
                tier: None,
                since: Some(since),
                limit: usize::MAX,
            })
            .await?;

        let mut by_tier: BTreeMap<Tier, TierSummary> = BTreeMap::new();
        for run in runs {
            let summary = by_tier.entry(run.tier).or_insert_with(|| TierSummary {
                tier: Some(run.tier),
                name: run.tier_name.clone(),
                ..TierSummary::default()
            });
            summary.runs += 1;
            *summary
                .by_status
                .entry(run.status.as_str().to_string())
                .or_default() += 1;
            summary.counters.absorb(&run.counters);
        }
        Ok(by_tier.into_values().collect())
    }

    /// Requests cooperative cancellation of the running run, if any.
    pub async fn cancel_current(&self) -> Result<Option<SyncRunId>> {
        let Some(running) = self.runs.running().await? else {
            return Ok(None);
        };
        if self.runs.request_cancel(running.id).await? {
            info!(
                target: "tiersync::scheduler",
                run_id = %running.id,
                tier = %running.tier,
                "Cancellation requested"
            );
            Ok(Some(running.id))
        } else {
            Ok(None)
        }
    }

    /// Loops [`Self::run_scheduled`] every `interval` until `shutdown` fires
    /// or `max_iterations` passes complete. A shutdown during a pass cancels
    /// the running tier and waits for it to finalize.
    pub async fn run_continuous(
        &self,
        interval: Duration,
        max_iterations: Option<u64>,
        shutdown: CancellationToken,
    ) -> Result<u64> {
        let mut iterations = 0u64;
        info!(
            target: "tiersync::scheduler",
            interval_secs = interval.as_secs(),
            "Scheduler loop started"
        );

        while !shutdown.is_cancelled() {
            let pass = self.run_scheduled(Utc::now());
            tokio::pin!(pass);
            let finished = tokio::select! {
                result = &mut pass => Some(result),
                _ = shutdown.cancelled() => None,
            };
            let result = match finished {
                Some(result) => result,
                None => {
                    info!(
                        target: "tiersync::scheduler",
                        "Shutdown requested; cancelling running tier"
                    );
                    self.cancel_current().await?;
                    pass.await
                }
            };
            match result {
                Ok(runs) => {
                    for run in &runs {
                        info!(
                            target: "tiersync::scheduler",
                            tier = %run.tier,
                            status = %run.status,
                            "Scheduled run finished"
                        );
                    }
                }
                Err(err) => {
                    error!(
                        target: "tiersync::scheduler",
                        error = %err,
                        "Scheduling pass failed"
                    );
                }
            }

            iterations += 1;
            if max_iterations.is_some_and(|max| iterations >= max) {
                break;
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        info!(
            target: "tiersync::scheduler",
            iterations,
            "Scheduler loop stopped"
        );
        Ok(iterations)
    }
}
