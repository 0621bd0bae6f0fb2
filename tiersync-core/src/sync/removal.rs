//! Resolves removal candidates with a cheap existence probe.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::{
    database::ports::{
        live_records::{LiveRecordRepository, StatusTransition},
        manifest::ManifestRepository,
    },
    error::{Result, SyncError},
    sync::{
        fetch::{DetailFetcher, ProbeOutcome},
        lifecycle::{LifecycleEvent, LifecycleState, transition},
        pacing::Pacer,
    },
    types::{ListingId, ListingRef, ListingStatus, MissingListing},
};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConfirmationReport {
    pub removed: Vec<ListingId>,
    pub sold: Vec<ListingId>,
    /// Candidates the scan under-covered. Reset to active.
    pub still_present: Vec<ListingRef>,
    /// Left untouched for the next run.
    pub undecided: Vec<ListingId>,
}

impl ConfirmationReport {
    pub fn confirmed_absent(&self) -> u64 {
        (self.removed.len() + self.sold.len()) as u64
    }
}

pub struct RemovalConfirmation {
    live: Arc<dyn LiveRecordRepository>,
    manifest: Arc<dyn ManifestRepository>,
    detail: Arc<dyn DetailFetcher>,
    removal_threshold: u32,
}

impl std::fmt::Debug for RemovalConfirmation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemovalConfirmation")
            .field("removal_threshold", &self.removal_threshold)
            .finish_non_exhaustive()
    }
}

impl RemovalConfirmation {
    pub fn new(
        live: Arc<dyn LiveRecordRepository>,
        manifest: Arc<dyn ManifestRepository>,
        detail: Arc<dyn DetailFetcher>,
        removal_threshold: u32,
    ) -> Self {
        Self {
            live,
            manifest,
            detail,
            removal_threshold,
        }
    }

    /// Probes each candidate and applies the lifecycle outcome. Probes are
    /// spaced by `spacing`.
    pub async fn confirm(
        &self,
        candidates: &[MissingListing],
        spacing: Duration,
        now: DateTime<Utc>,
    ) -> Result<ConfirmationReport> {
        let mut report = ConfirmationReport::default();
        let mut pacer = Pacer::new(spacing);

        for candidate in candidates {
            pacer.wait().await;
            let outcome = self.detail.probe(&candidate.url).await;
            debug!(
                target: "tiersync::removal",
                listing_id = %candidate.listing_id,
                outcome = outcome.label(),
                "Probed removal candidate"
            );

            let event = match &outcome {
                ProbeOutcome::Exists => LifecycleEvent::ConfirmedPresent,
                ProbeOutcome::NotFound => {
                    LifecycleEvent::ConfirmedAbsent { sold: false }
                }
                ProbeOutcome::Sold => LifecycleEvent::ConfirmedAbsent { sold: true },
                ProbeOutcome::Ambiguous(reason) => {
                    debug!(
                        target: "tiersync::removal",
                        listing_id = %candidate.listing_id,
                        reason = %reason,
                        "Probe inconclusive; candidate kept for next run"
                    );
                    report.undecided.push(candidate.listing_id.clone());
                    continue;
                }
            };

            if !self.apply(candidate, event, now).await? {
                report.undecided.push(candidate.listing_id.clone());
                continue;
            }

            match outcome {
                ProbeOutcome::Exists => report.still_present.push(ListingRef {
                    listing_id: candidate.listing_id.clone(),
                    url: candidate.url.clone(),
                }),
                ProbeOutcome::Sold => {
                    self.manifest.delete(&candidate.listing_id).await?;
                    report.sold.push(candidate.listing_id.clone());
                }
                _ => {
                    self.manifest.delete(&candidate.listing_id).await?;
                    report.removed.push(candidate.listing_id.clone());
                }
            }
        }

        info!(
            target: "tiersync::removal",
            removed = report.removed.len(),
            sold = report.sold.len(),
            still_present = report.still_present.len(),
            undecided = report.undecided.len(),
            "Removal confirmation complete"
        );
        Ok(report)
    }

    /// Returns false when the record moved on since it was flagged.
    async fn apply(
        &self,
        candidate: &MissingListing,
        event: LifecycleEvent,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let state = LifecycleState::new(
            ListingStatus::Active,
            candidate.consecutive_missing_count,
        );
        let next = match transition(state, event, self.removal_threshold) {
            Ok(next) => next,
            Err(err @ SyncError::IllegalTransition { .. }) => {
                warn!(
                    target: "tiersync::removal",
                    listing_id = %candidate.listing_id,
                    error = %err,
                    "Skipping candidate"
                );
                return Ok(false);
            }
            Err(err) => return Err(err),
        };

        self.live
            .apply_transition(&StatusTransition {
                listing_id: candidate.listing_id.clone(),
                from: ListingStatus::Active,
                to: next.status,
                missing_count: next.missing_count,
                at: now,
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;

    use super::*;
    use crate::{
        database::infrastructure::memory::{MemoryStore, active_record},
        sync::fetch::FetchError,
        types::FullRecord,
    };

    struct ScriptedProbe(HashMap<String, ProbeOutcome>);

    #[async_trait]
    impl DetailFetcher for ScriptedProbe {
        async fn fetch_detail(&self, _url: &str) -> std::result::Result<FullRecord, FetchError> {
            Err(FetchError::Transient("unused".into()))
        }

        async fn probe(&self, url: &str) -> ProbeOutcome {
            self.0
                .get(url)
                .cloned()
                .unwrap_or(ProbeOutcome::Ambiguous("unscripted".into()))
        }
    }

    fn candidate(id: &str, count: u32) -> MissingListing {
        MissingListing {
            listing_id: ListingId::from(id),
            url: id.to_string(),
            consecutive_missing_count: count,
        }
    }

    #[tokio::test]
    async fn outcomes_map_to_lifecycle_changes() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        for id in ["gone", "sold", "here", "maybe"] {
            let mut record = active_record(ListingId::from(id), id, None, now);
            record.consecutive_missing_count = 2;
            store.put(&record).await.unwrap();
        }
        let probe = ScriptedProbe(HashMap::from([
            ("gone".to_string(), ProbeOutcome::NotFound),
            ("sold".to_string(), ProbeOutcome::Sold),
            ("here".to_string(), ProbeOutcome::Exists),
        ]));
        let confirmation =
            RemovalConfirmation::new(store.clone(), store.clone(), Arc::new(probe), 2);

        let report = confirmation
            .confirm(
                &[
                    candidate("gone", 2),
                    candidate("sold", 2),
                    candidate("here", 2),
                    candidate("maybe", 2),
                ],
                Duration::ZERO,
                now,
            )
            .await
            .unwrap();

        assert_eq!(report.removed, vec![ListingId::from("gone")]);
        assert_eq!(report.sold, vec![ListingId::from("sold")]);
        assert_eq!(report.still_present.len(), 1);
        assert_eq!(report.undecided, vec![ListingId::from("maybe")]);

        let status = |id: &str| {
            let store = store.clone();
            let id = ListingId::from(id);
            async move {
                LiveRecordRepository::get(store.as_ref(), &id)
                    .await
                    .unwrap()
                    .unwrap()
            }
        };
        assert_eq!(status("gone").await.listing_status, ListingStatus::ConfirmedRemoved);
        assert_eq!(status("sold").await.listing_status, ListingStatus::Sold);
        let here = status("here").await;
        assert_eq!(here.listing_status, ListingStatus::Active);
        assert_eq!(here.consecutive_missing_count, 0);
        let maybe = status("maybe").await;
        assert_eq!(maybe.listing_status, ListingStatus::Active);
        assert_eq!(maybe.consecutive_missing_count, 2);
    }

    #[tokio::test]
    async fn a_single_miss_never_changes_status() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        let mut record = active_record(ListingId::from("once"), "once", None, now);
        record.consecutive_missing_count = 1;
        store.put(&record).await.unwrap();
        let probe = ScriptedProbe(HashMap::from([(
            "once".to_string(),
            ProbeOutcome::NotFound,
        )]));
        let confirmation =
            RemovalConfirmation::new(store.clone(), store.clone(), Arc::new(probe), 2);

        let report = confirmation
            .confirm(&[candidate("once", 1)], Duration::ZERO, now)
            .await
            .unwrap();

        assert!(report.removed.is_empty());
        let stored = LiveRecordRepository::get(store.as_ref(), &ListingId::from("once"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.listing_status, ListingStatus::Active);
    }
}
