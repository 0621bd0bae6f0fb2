//! Manifest diffing.
//!
//! A scan session writes its entries into the manifest through
//! [`DiffEngine::ingest_scan`], which sets the `is_new` and `price_changed`
//! flags. The detections then read the session's entries back. Flags are
//! only cleared by the drain worker once a full fetch of the listing has
//! succeeded, so a queue item that fails for good leaves its listing
//! flagged and the next scan detects it again. `is_new` is recomputed on
//! every sighting from whether a live record exists.

use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    database::ports::{
        live_records::{LiveRecordRepository, StatusTransition},
        manifest::ManifestRepository,
    },
    error::{Result, SyncError},
    sync::{
        config::{DiffConfig, PriceChangeThreshold},
        lifecycle::{LifecycleEvent, LifecycleState, transition},
    },
    types::{
        ListingId, ListingRef, LiveRecord, ManifestEntry, MissingListing,
        ScannedEntry, SessionId,
    },
};

/// True when moving from `live` to `observed` is a significant price change:
/// `|observed - live| > min(relative% of live, absolute cap)`.
///
/// A missing observed price never flags. A live price that is missing or not
/// positive flags any difference.
pub fn price_change_exceeds(
    threshold: &PriceChangeThreshold,
    live: Option<i64>,
    observed: Option<i64>,
) -> bool {
    let (Some(live), Some(observed)) = (live, observed) else {
        return false;
    };
    let delta = observed.abs_diff(live);
    if live <= 0 {
        return delta > 0;
    }
    let relative = (live as f64) * threshold.relative_percent / 100.0;
    let limit = relative.min(threshold.absolute_cap as f64);
    (delta as f64) > limit
}

/// Builds the manifest row for one scanned entry.
///
/// `previous` is the stored row, if any, and `live` the materialized record.
pub fn classify_observation(
    previous: Option<&ManifestEntry>,
    live: Option<&LiveRecord>,
    scanned: &ScannedEntry,
    threshold: &PriceChangeThreshold,
    session: SessionId,
    now: DateTime<Utc>,
) -> ManifestEntry {
    let exceeds = |observed| {
        live.is_some_and(|record| {
            price_change_exceeds(threshold, record.price, observed)
        })
    };

    let (first_seen_at, is_new, price_changed, price, title) = match previous {
        None => (
            now,
            live.is_none(),
            exceeds(scanned.price),
            scanned.price,
            scanned.title.clone(),
        ),
        Some(prev) => {
            let moved = scanned.price.is_some() && scanned.price != prev.price;
            (
                prev.first_seen_at,
                live.is_none(),
                // Sticky until a fetch refreshes the live price.
                live.is_some()
                    && (prev.price_changed || (moved && exceeds(scanned.price))),
                scanned.price.or(prev.price),
                scanned.title.clone().or_else(|| prev.title.clone()),
            )
        }
    };

    ManifestEntry {
        listing_id: scanned.listing_id.clone(),
        url: scanned.url.clone(),
        price,
        title,
        latitude: scanned
            .latitude
            .or_else(|| previous.and_then(|p| p.latitude)),
        longitude: scanned
            .longitude
            .or_else(|| previous.and_then(|p| p.longitude)),
        first_seen_at,
        last_seen_at: now,
        seen_in_session: Some(session),
        is_new,
        needs_full_scrape: is_new || price_changed,
        price_changed,
    }
}

/// Collapses duplicate ids within one batch. An entry carrying a price wins
/// over one without; otherwise the later entry wins.
pub fn dedupe_entries(entries: Vec<ScannedEntry>) -> Vec<ScannedEntry> {
    let mut order = Vec::with_capacity(entries.len());
    let mut by_id: HashMap<ListingId, ScannedEntry> = HashMap::new();
    for entry in entries {
        match by_id.get(&entry.listing_id) {
            Some(existing)
                if existing.price.is_some() && entry.price.is_none() => {}
            Some(_) => {
                by_id.insert(entry.listing_id.clone(), entry);
            }
            None => {
                order.push(entry.listing_id.clone());
                by_id.insert(entry.listing_id.clone(), entry);
            }
        }
    }
    order
        .into_iter()
        .filter_map(|id| by_id.remove(&id))
        .collect()
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReport {
    pub written: u64,
    pub flagged_new: u64,
    pub flagged_price_changed: u64,
}

/// What resetting a session's observations found.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Reobservation {
    pub observed: u64,
    /// Previously active records the session observed.
    pub observed_active: u64,
    /// Off-market records reopened as relisted.
    pub relisted: Vec<ListingRef>,
}

/// Partition of the previously active population after a removal pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RemovalScan {
    pub expected_active: u64,
    pub reobserved: u64,
    /// Missed, but below the removal threshold.
    pub missing: Vec<MissingListing>,
    pub candidates: Vec<MissingListing>,
}

pub struct DiffEngine {
    manifest: Arc<dyn ManifestRepository>,
    live: Arc<dyn LiveRecordRepository>,
    config: DiffConfig,
}

impl std::fmt::Debug for DiffEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiffEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl DiffEngine {
    pub fn new(
        manifest: Arc<dyn ManifestRepository>,
        live: Arc<dyn LiveRecordRepository>,
        config: DiffConfig,
    ) -> Self {
        Self {
            manifest,
            live,
            config,
        }
    }

    pub fn config(&self) -> &DiffConfig {
        &self.config
    }

    /// Writes one batch of scanned entries into the manifest.
    pub async fn ingest_scan(
        &self,
        session: SessionId,
        entries: Vec<ScannedEntry>,
        now: DateTime<Utc>,
    ) -> Result<IngestReport> {
        let entries = dedupe_entries(entries);
        if entries.is_empty() {
            return Ok(IngestReport::default());
        }

        let ids: Vec<ListingId> =
            entries.iter().map(|e| e.listing_id.clone()).collect();
        let previous = self.manifest.get_many(&ids).await?;
        let live = self.live.get_many(&ids).await?;

        let rows: Vec<ManifestEntry> = entries
            .iter()
            .map(|scanned| {
                classify_observation(
                    previous.get(&scanned.listing_id),
                    live.get(&scanned.listing_id),
                    scanned,
                    &self.config.price_change,
                    session,
                    now,
                )
            })
            .collect();

        let report = IngestReport {
            written: self.manifest.upsert_many(&rows).await?,
            flagged_new: rows.iter().filter(|r| r.is_new).count() as u64,
            flagged_price_changed: rows
                .iter()
                .filter(|r| r.price_changed)
                .count() as u64,
        };
        debug!(
            target: "tiersync::diff",
            session = %session,
            written = report.written,
            "Ingested scan batch"
        );
        Ok(report)
    }

    /// Session entries that have no live record yet.
    pub async fn detect_new(&self, session: SessionId) -> Result<Vec<ManifestEntry>> {
        let entries = self.manifest.session_entries(session).await?;
        Ok(entries.into_iter().filter(|e| e.is_new).collect())
    }

    /// Session entries whose price moved past the threshold against their
    /// live record.
    pub async fn detect_price_changes(
        &self,
        session: SessionId,
    ) -> Result<Vec<ManifestEntry>> {
        let entries = self.manifest.session_entries(session).await?;
        Ok(entries
            .into_iter()
            .filter(|e| e.price_changed && !e.is_new)
            .collect())
    }

    /// Resets missing counts for everything the session observed and
    /// reopens off-market listings as relisted.
    pub async fn apply_reobservations(
        &self,
        session: SessionId,
        now: DateTime<Utc>,
    ) -> Result<Reobservation> {
        let report = self.live.record_observations(session, now).await?;
        let mut relisted = Vec::new();

        for observed in report.off_market {
            let next = transition(
                LifecycleState::new(
                    observed.listing_status,
                    observed.previous_missing_count,
                ),
                LifecycleEvent::Reobserved,
                self.config.min_missing_count_for_removal,
            )?;
            let applied = self
                .live
                .apply_transition(&StatusTransition {
                    listing_id: observed.listing_id.clone(),
                    from: observed.listing_status,
                    to: next.status,
                    missing_count: next.missing_count,
                    at: now,
                })
                .await?;
            if applied {
                info!(
                    target: "tiersync::diff",
                    listing_id = %observed.listing_id,
                    from = %observed.listing_status,
                    "Listing reappeared; marked relisted"
                );
                relisted.push(ListingRef {
                    listing_id: observed.listing_id,
                    url: observed.url,
                });
            }
        }

        Ok(Reobservation {
            observed: report.observed,
            observed_active: report.observed_active,
            relisted,
        })
    }

    /// Counts a miss against every active record the session did not
    /// observe and splits them into noise and removal candidates.
    ///
    /// `observed_active` comes from [`Self::apply_reobservations`] for the
    /// same session. When it covers less than the configured share of the
    /// active population nothing is written and `CoverageTooLow` is
    /// returned.
    pub async fn detect_removal_candidates(
        &self,
        session: SessionId,
        observed_active: u64,
    ) -> Result<RemovalScan> {
        let expected_active = self.live.active_count().await?;
        let threshold_percent = self.config.min_coverage_percent;
        if expected_active > 0
            && observed_active.saturating_mul(100)
                < expected_active.saturating_mul(u64::from(threshold_percent))
        {
            warn!(
                target: "tiersync::diff",
                session = %session,
                observed_active,
                expected_active,
                "Scan coverage below gate; skipping removal detection"
            );
            return Err(SyncError::CoverageTooLow {
                observed: observed_active,
                expected: expected_active,
                threshold_percent,
            });
        }

        let threshold = self.config.min_missing_count_for_removal;
        let (candidates, missing) = self
            .live
            .record_misses(session)
            .await?
            .into_iter()
            .partition::<Vec<_>, _>(|m| m.consecutive_missing_count >= threshold);

        info!(
            target: "tiersync::diff",
            session = %session,
            reobserved = observed_active,
            missing = missing.len(),
            candidates = candidates.len(),
            "Removal detection complete"
        );
        Ok(RemovalScan {
            expected_active,
            reobserved: observed_active,
            missing,
            candidates,
        })
    }
}
