//! In-memory implementation of every repository port.
//!
//! All three tables sit behind one lock so operations that read one table
//! and write another (observation resets, miss counting) are atomic, the
//! same way a single Postgres statement is.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use tokio::sync::Mutex;

use crate::{
    database::ports::{
        live_records::{LiveRecordRepository, ObservationReport, StatusTransition},
        manifest::{ManifestFlags, ManifestRepository},
        sync_runs::{RunHistoryQuery, SyncRunRepository},
    },
    error::Result,
    sync::{
        lifecycle::status_after_full_fetch,
        stats::{ManifestStats, QualityReport},
    },
    types::{
        FullRecord, ListingId, ListingRef, ListingStatus, LiveRecord,
        ManifestEntry, MissingListing, ObservedListing, SessionId, SyncRun,
        SyncRunCounters, SyncRunId, SyncRunStatus, Tier,
    },
};

#[derive(Default)]
struct StoreState {
    manifest: HashMap<ListingId, ManifestEntry>,
    live: HashMap<ListingId, LiveRecord>,
    runs: Vec<SyncRun>,
}

impl StoreState {
    fn observed_by(&self, session: SessionId, id: &ListingId) -> bool {
        self.manifest
            .get(id)
            .is_some_and(|entry| entry.seen_in_session == Some(session))
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore").finish_non_exhaustive()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn manifest_len(&self) -> usize {
        self.state.lock().await.manifest.len()
    }

    pub async fn live_records(&self) -> Vec<LiveRecord> {
        self.state.lock().await.live.values().cloned().collect()
    }
}

#[async_trait]
impl ManifestRepository for MemoryStore {
    async fn get_many(
        &self,
        ids: &[ListingId],
    ) -> Result<HashMap<ListingId, ManifestEntry>> {
        let state = self.state.lock().await;
        Ok(ids
            .iter()
            .filter_map(|id| state.manifest.get(id).map(|e| (id.clone(), e.clone())))
            .collect())
    }

    async fn upsert_many(&self, entries: &[ManifestEntry]) -> Result<u64> {
        let mut state = self.state.lock().await;
        for entry in entries {
            state.manifest.insert(entry.listing_id.clone(), entry.clone());
        }
        Ok(entries.len() as u64)
    }

    async fn session_entries(
        &self,
        session: SessionId,
    ) -> Result<Vec<ManifestEntry>> {
        let state = self.state.lock().await;
        let mut entries: Vec<_> = state
            .manifest
            .values()
            .filter(|entry| entry.seen_in_session == Some(session))
            .cloned()
            .collect();
        entries.sort_by(|a, b| a.listing_id.cmp(&b.listing_id));
        Ok(entries)
    }

    async fn count_in_session(&self, session: SessionId) -> Result<u64> {
        let state = self.state.lock().await;
        Ok(state
            .manifest
            .values()
            .filter(|entry| entry.seen_in_session == Some(session))
            .count() as u64)
    }

    async fn clear_flags(
        &self,
        ids: &[ListingId],
        flags: ManifestFlags,
    ) -> Result<u64> {
        let mut state = self.state.lock().await;
        let mut cleared = 0u64;
        for id in ids {
            if let Some(entry) = state.manifest.get_mut(id) {
                if flags.is_new {
                    entry.is_new = false;
                }
                if flags.price_changed {
                    entry.price_changed = false;
                }
                entry.needs_full_scrape = entry.is_new || entry.price_changed;
                cleared += 1;
            }
        }
        Ok(cleared)
    }

    async fn delete(&self, id: &ListingId) -> Result<bool> {
        Ok(self.state.lock().await.manifest.remove(id).is_some())
    }

    async fn stats(&self, now: DateTime<Utc>) -> Result<ManifestStats> {
        let state = self.state.lock().await;
        let mut stats = ManifestStats {
            total: state.manifest.len() as u64,
            ..ManifestStats::default()
        };
        let mut staleness_hours = 0.0;
        for entry in state.manifest.values() {
            stats.flagged_new += u64::from(entry.is_new);
            stats.needs_full_scrape += u64::from(entry.needs_full_scrape);
            stats.price_changed += u64::from(entry.price_changed);
            staleness_hours +=
                (now - entry.last_seen_at).num_seconds() as f64 / 3_600.0;
            stats.oldest_last_seen_at = Some(match stats.oldest_last_seen_at {
                Some(oldest) => oldest.min(entry.last_seen_at),
                None => entry.last_seen_at,
            });
        }
        if stats.total > 0 {
            stats.average_staleness_hours =
                Some(staleness_hours / stats.total as f64);
        }
        Ok(stats)
    }
}

#[async_trait]
impl LiveRecordRepository for MemoryStore {
    async fn get(&self, id: &ListingId) -> Result<Option<LiveRecord>> {
        Ok(self.state.lock().await.live.get(id).cloned())
    }

    async fn get_many(
        &self,
        ids: &[ListingId],
    ) -> Result<HashMap<ListingId, LiveRecord>> {
        let state = self.state.lock().await;
        Ok(ids
            .iter()
            .filter_map(|id| state.live.get(id).map(|r| (id.clone(), r.clone())))
            .collect())
    }

    async fn put(&self, record: &LiveRecord) -> Result<()> {
        self.state
            .lock()
            .await
            .live
            .insert(record.listing_id.clone(), record.clone());
        Ok(())
    }

    async fn active_count(&self) -> Result<u64> {
        let state = self.state.lock().await;
        Ok(state
            .live
            .values()
            .filter(|record| record.listing_status == ListingStatus::Active)
            .count() as u64)
    }

    async fn record_observations(
        &self,
        session: SessionId,
        now: DateTime<Utc>,
    ) -> Result<ObservationReport> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let mut report = ObservationReport::default();
        for record in state.live.values_mut() {
            let Some(entry) = state
                .manifest
                .get(&record.listing_id)
                .filter(|entry| entry.seen_in_session == Some(session))
            else {
                continue;
            };
            report.observed += 1;
            if record.listing_status == ListingStatus::Active {
                report.observed_active += 1;
            }
            if record.listing_status.is_off_market() {
                report.off_market.push(ObservedListing {
                    listing_id: record.listing_id.clone(),
                    url: record.url.clone(),
                    listing_status: record.listing_status,
                    previous_missing_count: record.consecutive_missing_count,
                });
            }
            record.consecutive_missing_count = 0;
            record.last_manifest_seen_at = Some(now);
            record.price_at_last_manifest = entry.price;
            record.updated_at = now;
        }
        report
            .off_market
            .sort_by(|a, b| a.listing_id.cmp(&b.listing_id));
        Ok(report)
    }

    async fn record_misses(
        &self,
        session: SessionId,
    ) -> Result<Vec<MissingListing>> {
        let mut guard = self.state.lock().await;
        let missing_ids: Vec<ListingId> = guard
            .live
            .values()
            .filter(|record| {
                record.listing_status == ListingStatus::Active
                    && !guard.observed_by(session, &record.listing_id)
            })
            .map(|record| record.listing_id.clone())
            .collect();

        let now = Utc::now();
        let mut missing = Vec::with_capacity(missing_ids.len());
        for id in missing_ids {
            if let Some(record) = guard.live.get_mut(&id) {
                record.consecutive_missing_count =
                    record.consecutive_missing_count.saturating_add(1);
                record.updated_at = now;
                missing.push(MissingListing {
                    listing_id: record.listing_id.clone(),
                    url: record.url.clone(),
                    consecutive_missing_count: record.consecutive_missing_count,
                });
            }
        }
        missing.sort_by(|a, b| a.listing_id.cmp(&b.listing_id));
        Ok(missing)
    }

    async fn apply_transition(&self, transition: &StatusTransition) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(record) = state.live.get_mut(&transition.listing_id) else {
            return Ok(false);
        };
        if record.listing_status != transition.from {
            return Ok(false);
        }
        record.listing_status = transition.to;
        record.consecutive_missing_count = transition.missing_count;
        record.updated_at = transition.at;
        if transition.to.is_off_market() {
            record.removed_at = Some(transition.at);
        } else if transition.from.is_off_market() {
            record.removed_at = None;
        }
        Ok(true)
    }

    async fn upsert_fetched(
        &self,
        id: &ListingId,
        record: &FullRecord,
        scrape_priority: u8,
        now: DateTime<Utc>,
    ) -> Result<LiveRecord> {
        let mut state = self.state.lock().await;
        let current = state.live.get(id).map(|r| r.listing_status);
        let status = status_after_full_fetch(current);
        let entry = state.live.entry(id.clone()).or_insert_with(|| LiveRecord {
            listing_id: id.clone(),
            url: record.url.clone(),
            price: None,
            title: None,
            listing_status: status,
            consecutive_missing_count: 0,
            last_manifest_seen_at: None,
            price_at_last_manifest: None,
            last_full_scrape_at: None,
            scrape_priority: None,
            removed_at: None,
            details: serde_json::Value::Null,
            created_at: now,
            updated_at: now,
        });
        entry.url = record.url.clone();
        entry.price = record.price;
        entry.title = record.title.clone();
        entry.details = record.details.clone();
        if !status.is_off_market() {
            entry.consecutive_missing_count = 0;
        }
        entry.listing_status = status;
        entry.last_full_scrape_at = Some(now);
        entry.scrape_priority = Some(scrape_priority);
        entry.updated_at = now;
        Ok(entry.clone())
    }

    async fn stale_active(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ListingRef>> {
        let state = self.state.lock().await;
        let mut stale: Vec<&LiveRecord> = state
            .live
            .values()
            .filter(|record| {
                record.listing_status == ListingStatus::Active
                    && record.last_full_scrape_at.is_none_or(|at| at < before)
            })
            .collect();
        // Never-fetched first, then oldest fetch.
        stale.sort_by(|a, b| {
            a.last_full_scrape_at
                .cmp(&b.last_full_scrape_at)
                .then_with(|| a.listing_id.cmp(&b.listing_id))
        });
        Ok(stale
            .into_iter()
            .take(limit)
            .map(|record| ListingRef {
                listing_id: record.listing_id.clone(),
                url: record.url.clone(),
            })
            .collect())
    }

    async fn sample_active(&self, limit: usize) -> Result<Vec<ListingRef>> {
        let state = self.state.lock().await;
        let mut active: Vec<ListingRef> = state
            .live
            .values()
            .filter(|record| record.listing_status == ListingStatus::Active)
            .map(|record| ListingRef {
                listing_id: record.listing_id.clone(),
                url: record.url.clone(),
            })
            .collect();
        active.shuffle(&mut rand::rng());
        active.truncate(limit);
        Ok(active)
    }

    async fn quality(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<QualityReport> {
        let state = self.state.lock().await;
        let mut report = QualityReport {
            generated_at: Some(now),
            total: state.live.len() as u64,
            ..QualityReport::default()
        };
        for record in state.live.values() {
            *report
                .by_status
                .entry(record.listing_status.as_str().to_string())
                .or_default() += 1;
            if record.listing_status == ListingStatus::Active {
                report.active += 1;
                if record.last_full_scrape_at.is_none_or(|at| at < stale_before)
                {
                    report.stale_active += 1;
                }
            }
        }
        Ok(report)
    }
}

#[async_trait]
impl SyncRunRepository for MemoryStore {
    async fn insert(&self, run: &SyncRun) -> Result<()> {
        self.state.lock().await.runs.push(run.clone());
        Ok(())
    }

    async fn get(&self, id: SyncRunId) -> Result<Option<SyncRun>> {
        let state = self.state.lock().await;
        Ok(state.runs.iter().find(|run| run.id == id).cloned())
    }

    async fn record_progress(
        &self,
        id: SyncRunId,
        counters: &SyncRunCounters,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(run) = state
            .runs
            .iter_mut()
            .find(|run| run.id == id && run.status == SyncRunStatus::Running)
        {
            run.counters = counters.clone();
        }
        Ok(())
    }

    async fn finalize(&self, run: &SyncRun) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(stored) = state
            .runs
            .iter_mut()
            .find(|stored| stored.id == run.id)
        else {
            return Ok(false);
        };
        if stored.status != SyncRunStatus::Running {
            return Ok(false);
        }
        let cancel_requested = stored.cancel_requested;
        *stored = run.clone();
        stored.cancel_requested |= cancel_requested;
        Ok(true)
    }

    async fn running(&self) -> Result<Option<SyncRun>> {
        let state = self.state.lock().await;
        Ok(state
            .runs
            .iter()
            .filter(|run| run.status == SyncRunStatus::Running)
            .max_by_key(|run| run.started_at)
            .cloned())
    }

    async fn latest_for_tier(&self, tier: Tier) -> Result<Option<SyncRun>> {
        let state = self.state.lock().await;
        Ok(state
            .runs
            .iter()
            .filter(|run| run.tier == tier)
            .max_by_key(|run| run.started_at)
            .cloned())
    }

    async fn history(&self, query: RunHistoryQuery) -> Result<Vec<SyncRun>> {
        let state = self.state.lock().await;
        let mut runs: Vec<SyncRun> = state
            .runs
            .iter()
            .filter(|run| query.tier.is_none_or(|tier| run.tier == tier))
            .filter(|run| query.since.is_none_or(|since| run.started_at >= since))
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(query.limit);
        Ok(runs)
    }

    async fn request_cancel(&self, id: SyncRunId) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state
            .runs
            .iter_mut()
            .find(|run| run.id == id && run.status == SyncRunStatus::Running)
        {
            Some(run) => {
                run.cancel_requested = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn is_cancel_requested(&self, id: SyncRunId) -> Result<bool> {
        let state = self.state.lock().await;
        Ok(state
            .runs
            .iter()
            .any(|run| run.id == id && run.cancel_requested))
    }

    async fn fail_abandoned(
        &self,
        started_before: DateTime<Utc>,
    ) -> Result<Vec<SyncRunId>> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let mut failed = Vec::new();
        for run in state.runs.iter_mut().filter(|run| {
            run.status == SyncRunStatus::Running && run.started_at < started_before
        }) {
            run.status = SyncRunStatus::Failed;
            run.completed_at = Some(now);
            run.error_summary = Some("abandoned".to_string());
            failed.push(run.id);
        }
        Ok(failed)
    }
}

/// Builds a fresh active record; used to seed stores.
pub fn active_record(
    listing_id: ListingId,
    url: impl Into<String>,
    price: Option<i64>,
    now: DateTime<Utc>,
) -> LiveRecord {
    LiveRecord {
        listing_id,
        url: url.into(),
        price,
        title: None,
        listing_status: ListingStatus::Active,
        consecutive_missing_count: 0,
        last_manifest_seen_at: None,
        price_at_last_manifest: None,
        last_full_scrape_at: Some(now),
        scrape_priority: None,
        removed_at: None,
        details: serde_json::Value::Null,
        created_at: now,
        updated_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, session: SessionId, now: DateTime<Utc>) -> ManifestEntry {
        ManifestEntry {
            listing_id: ListingId::from(id),
            url: format!("https://example.com/{id}"),
            price: Some(100),
            title: None,
            latitude: None,
            longitude: None,
            first_seen_at: now,
            last_seen_at: now,
            seen_in_session: Some(session),
            is_new: false,
            needs_full_scrape: false,
            price_changed: false,
        }
    }

    #[tokio::test]
    async fn observations_and_misses_partition_active_records() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let session = SessionId::new();
        for id in ["a", "b", "c"] {
            store
                .put(&active_record(ListingId::from(id), id, Some(1), now))
                .await
                .unwrap();
        }
        store.upsert_many(&[entry("a", session, now)]).await.unwrap();

        let report = store.record_observations(session, now).await.unwrap();
        let misses = store.record_misses(session).await.unwrap();

        assert_eq!(report.observed_active, 1);
        let missed: Vec<_> =
            misses.iter().map(|m| m.listing_id.as_str()).collect();
        assert_eq!(missed, vec!["b", "c"]);
        assert!(misses.iter().all(|m| m.consecutive_missing_count == 1));
    }

    #[tokio::test]
    async fn observations_record_the_manifest_price() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let session = SessionId::new();
        store
            .put(&active_record(ListingId::from("a"), "a", Some(100), now))
            .await
            .unwrap();
        let mut sighting = entry("a", session, now);
        sighting.price = Some(95);
        store.upsert_many(&[sighting]).await.unwrap();

        store.record_observations(session, now).await.unwrap();

        let record = LiveRecordRepository::get(&store, &ListingId::from("a"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.price_at_last_manifest, Some(95));
        assert_eq!(record.price, Some(100), "fetched price is untouched");
        assert_eq!(record.last_manifest_seen_at, Some(now));
    }

    #[tokio::test]
    async fn transitions_are_compare_and_set() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let id = ListingId::from("a");
        store
            .put(&active_record(id.clone(), "a", None, now))
            .await
            .unwrap();

        let removal = StatusTransition {
            listing_id: id.clone(),
            from: ListingStatus::Active,
            to: ListingStatus::ConfirmedRemoved,
            missing_count: 2,
            at: now,
        };
        assert!(store.apply_transition(&removal).await.unwrap());
        assert!(!store.apply_transition(&removal).await.unwrap());
        let record = LiveRecordRepository::get(&store, &id).await.unwrap().unwrap();
        assert_eq!(record.removed_at, Some(now));
    }

    #[tokio::test]
    async fn terminal_runs_are_never_rewritten() {
        let store = MemoryStore::new();
        let mut run = SyncRun::start(Tier::HotListings, "hot", Utc::now());
        store.insert(&run).await.unwrap();

        run.status = SyncRunStatus::Completed;
        assert!(store.finalize(&run).await.unwrap());
        run.status = SyncRunStatus::Failed;
        assert!(!store.finalize(&run).await.unwrap());
        let stored = SyncRunRepository::get(&store, run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SyncRunStatus::Completed);
    }

    #[tokio::test]
    async fn quality_counts_never_fetched_as_stale() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let mut fresh = active_record(ListingId::from("fresh"), "f", None, now);
        fresh.last_full_scrape_at = Some(now);
        let mut never = active_record(ListingId::from("never"), "n", None, now);
        never.last_full_scrape_at = None;
        store.put(&fresh).await.unwrap();
        store.put(&never).await.unwrap();

        let report = store
            .quality(now - chrono::Duration::days(30), now)
            .await
            .unwrap();
        assert_eq!(report.active, 2);
        assert_eq!(report.stale_active, 1);
        assert_eq!(report.by_status.get("active"), Some(&2));
        assert_eq!(store.live_records().await.len(), 2);
    }
}
