mod support;

use chrono::{Duration, Utc};
use support::{Harness, entry, listing_url, test_config};
use tiersync_core::{
    database::{
        LiveRecordRepository, ManifestRepository, SyncRunRepository,
        infrastructure::memory::active_record,
    },
    listing_id_for_url,
    sync::{
        EnqueueRequest, FetchError, ProbeOutcome, QueuePriority, QueueReason,
        QueueService, QueueStatus,
    },
    types::{FullRecord, ListingId, ListingStatus, SyncRunStatus, Tier},
};

fn id_of(slug: &str) -> ListingId {
    listing_id_for_url(&listing_url(slug)).unwrap()
}

async fn seed_active(harness: &Harness, slug: &str, price: Option<i64>) {
    let record = active_record(id_of(slug), listing_url(slug), price, Utc::now());
    LiveRecordRepository::put(harness.store.as_ref(), &record)
        .await
        .unwrap();
}

async fn live(harness: &Harness, slug: &str) -> tiersync_core::types::LiveRecord {
    LiveRecordRepository::get(harness.store.as_ref(), &id_of(slug))
        .await
        .unwrap()
        .expect("live record exists")
}

#[tokio::test]
async fn new_listing_flows_from_scan_to_live_record() {
    let harness = Harness::new();
    harness.scanner.set_listings(vec![entry("x123", Some(300_000))]);
    harness.detail.set_detail(
        &listing_url("x123"),
        Ok(FullRecord {
            url: listing_url("x123"),
            price: Some(300_000),
            title: Some("X123".into()),
            details: serde_json::json!({ "bedrooms": 3 }),
        }),
    );

    let run = harness.orchestrator.run(Tier::HotListings).await.unwrap();

    assert_eq!(run.status, SyncRunStatus::Completed);
    assert_eq!(run.counters.pages_scanned, 1);
    assert_eq!(run.counters.new_count, 1);
    assert_eq!(run.counters.queued_count, 1);
    assert_eq!(run.counters.scraped_count, 1);

    let record = live(&harness, "x123").await;
    assert_eq!(record.listing_status, ListingStatus::Active);
    assert_eq!(record.price, Some(300_000));
    assert_eq!(record.scrape_priority, Some(1));
    assert!(record.last_full_scrape_at.is_some());

    let items = harness.queue.items().await;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].reason, QueueReason::NewProperty);
    assert_eq!(items[0].priority, QueuePriority::P1);
    assert_eq!(items[0].status, QueueStatus::Completed);

    let manifest = ManifestRepository::get_many(harness.store.as_ref(), &[id_of("x123")])
        .await
        .unwrap();
    let row = &manifest[&id_of("x123")];
    assert!(!row.is_new);
    assert!(!row.needs_full_scrape);
}

#[tokio::test]
async fn listing_that_never_materializes_is_detected_again() {
    let harness = Harness::new();
    harness.scanner.set_listings(vec![entry("x123", Some(300_000))]);
    harness
        .detail
        .set_detail(&listing_url("x123"), Err(FetchError::NotFound));

    let first = harness.orchestrator.run(Tier::HotListings).await.unwrap();
    let second = harness.orchestrator.run(Tier::HotListings).await.unwrap();

    assert_eq!(first.counters.new_count, 1);
    // No live record exists, so the replay detects and queues it again.
    assert_eq!(second.counters.new_count, 1);
    assert_eq!(second.counters.queued_count, 1);
    let items = harness.queue.items().await;
    assert_eq!(items.len(), 2);
    assert!(items.iter().all(|item| item.status == QueueStatus::Failed));
    let manifest = ManifestRepository::get_many(harness.store.as_ref(), &[id_of("x123")])
        .await
        .unwrap();
    assert!(manifest[&id_of("x123")].is_new);
}

#[tokio::test]
async fn replay_while_queued_is_not_counted_twice() {
    let mut config = test_config();
    for settings in &mut config.tiers {
        settings.max_queue_items = 0;
    }
    let harness = Harness::with_config(config);
    harness.scanner.set_listings(vec![entry("x123", Some(300_000))]);

    let first = harness.orchestrator.run(Tier::HotListings).await.unwrap();
    let second = harness.orchestrator.run(Tier::HotListings).await.unwrap();

    assert_eq!(first.counters.new_count, 1);
    assert_eq!(second.counters.new_count, 0);
    assert_eq!(second.counters.queued_count, 0);
    let items = harness.queue.items().await;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].status, QueueStatus::Pending);
}

#[tokio::test]
async fn transient_failure_exhausting_attempts_recovers_on_later_runs() {
    let mut config = test_config();
    config.queue.retry_backoff_base_ms = 0;
    config.queue.retry_backoff_max_ms = 0;
    let harness = Harness::with_config(config);
    harness.scanner.set_listings(vec![entry("x123", Some(300_000))]);
    harness.detail.set_detail(
        &listing_url("x123"),
        Err(FetchError::Transient("503".into())),
    );

    let failed = harness.orchestrator.run(Tier::HotListings).await.unwrap();
    assert_eq!(failed.counters.new_count, 1);
    assert_eq!(failed.counters.scraped_count, 0);
    assert_eq!(harness.detail.fetched().len(), 3);
    let items = harness.queue.items().await;
    assert_eq!(items[0].status, QueueStatus::Failed);

    harness.detail.set_detail(
        &listing_url("x123"),
        Ok(FullRecord {
            url: listing_url("x123"),
            price: Some(300_000),
            title: Some("X123".into()),
            details: serde_json::json!({}),
        }),
    );
    for tier in Tier::ALL {
        harness.orchestrator.run(tier).await.unwrap();
    }

    let record = live(&harness, "x123").await;
    assert_eq!(record.listing_status, ListingStatus::Active);
    assert_eq!(record.price, Some(300_000));
    let manifest = ManifestRepository::get_many(harness.store.as_ref(), &[id_of("x123")])
        .await
        .unwrap();
    assert!(!manifest[&id_of("x123")].is_new);
}

#[tokio::test]
async fn transient_failure_is_retried_after_backoff_on_a_later_run() {
    let mut config = test_config();
    config.queue.retry_backoff_base_ms = 250;
    config.queue.retry_backoff_max_ms = 250;
    let harness = Harness::with_config(config);
    harness.scanner.set_listings(vec![entry("x123", Some(300_000))]);
    harness.detail.set_detail(
        &listing_url("x123"),
        Err(FetchError::Transient("503".into())),
    );

    let first = harness.orchestrator.run(Tier::HotListings).await.unwrap();
    assert_eq!(first.counters.scraped_count, 0);
    // The backoff keeps the same drain from hammering the source.
    assert_eq!(harness.detail.fetched().len(), 1);
    let items = harness.queue.items().await;
    assert_eq!(items[0].status, QueueStatus::Pending);
    assert_eq!(items[0].attempt_count, 1);

    harness.detail.set_detail(
        &listing_url("x123"),
        Ok(FullRecord {
            url: listing_url("x123"),
            price: Some(300_000),
            title: None,
            details: serde_json::json!({}),
        }),
    );
    tokio::time::sleep(std::time::Duration::from_millis(400)).await;
    let second = harness.orchestrator.run(Tier::HotListings).await.unwrap();

    assert_eq!(second.counters.new_count, 0, "already queued");
    assert_eq!(second.counters.scraped_count, 1);
    let items = harness.queue.items().await;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].status, QueueStatus::Completed);
    assert_eq!(items[0].attempt_count, 2);
    assert_eq!(live(&harness, "x123").await.price, Some(300_000));
}

#[tokio::test]
async fn removal_pass_partitions_active_records() {
    let harness = Harness::new();
    for slug in ["a", "b", "c", "d"] {
        seed_active(&harness, slug, Some(200_000)).await;
    }
    harness.scanner.set_listings(vec![
        entry("a", Some(200_000)),
        entry("b", Some(200_000)),
        entry("c", Some(200_000)),
    ]);

    let run = harness.orchestrator.run(Tier::WeeklyDeep).await.unwrap();

    assert_eq!(run.status, SyncRunStatus::Completed);
    assert_eq!(run.counters.removed_count, 0);
    for slug in ["a", "b", "c"] {
        let record = live(&harness, slug).await;
        assert_eq!(record.consecutive_missing_count, 0);
        assert!(record.last_manifest_seen_at.is_some());
    }
    let missed = live(&harness, "d").await;
    assert_eq!(missed.listing_status, ListingStatus::Active);
    assert_eq!(missed.consecutive_missing_count, 1);
    assert!(missed.is_likely_removed());
    assert!(harness.detail.probed().is_empty());
}

#[tokio::test]
async fn removal_needs_two_misses_and_a_probe() {
    let harness = Harness::new();
    for slug in ["a", "b", "c", "d"] {
        seed_active(&harness, slug, Some(200_000)).await;
    }
    harness.detail.set_probe(&listing_url("d"), ProbeOutcome::NotFound);

    harness.scanner.set_listings(
        ["a", "b", "c", "d"]
            .into_iter()
            .map(|slug| entry(slug, Some(200_000)))
            .collect(),
    );
    harness.orchestrator.run(Tier::WeeklyDeep).await.unwrap();
    assert_eq!(harness.store.manifest_len().await, 4);

    harness.scanner.set_listings(
        ["a", "b", "c"]
            .into_iter()
            .map(|slug| entry(slug, Some(200_000)))
            .collect(),
    );
    let first_miss = harness.orchestrator.run(Tier::WeeklyDeep).await.unwrap();
    assert_eq!(first_miss.counters.removed_count, 0);
    assert_eq!(live(&harness, "d").await.listing_status, ListingStatus::Active);
    assert!(harness.detail.probed().is_empty());

    let second_miss = harness.orchestrator.run(Tier::WeeklyDeep).await.unwrap();
    assert_eq!(second_miss.counters.removed_count, 1);
    let removed = live(&harness, "d").await;
    assert_eq!(removed.listing_status, ListingStatus::ConfirmedRemoved);
    assert!(removed.removed_at.is_some());
    assert_eq!(harness.detail.probed(), vec![listing_url("d")]);
    assert_eq!(harness.store.manifest_len().await, 3);
}

#[tokio::test]
async fn listing_missed_once_before_is_removed_when_gone_at_source() {
    let harness = Harness::new();
    for slug in ["a", "b", "c", "d"] {
        seed_active(&harness, slug, Some(200_000)).await;
    }
    harness.scanner.set_listings(
        ["a", "b", "c", "d"]
            .into_iter()
            .map(|slug| entry(slug, Some(200_000)))
            .collect(),
    );
    harness.orchestrator.run(Tier::WeeklyDeep).await.unwrap();

    let mut flaky = live(&harness, "d").await;
    flaky.consecutive_missing_count = 1;
    LiveRecordRepository::put(harness.store.as_ref(), &flaky)
        .await
        .unwrap();
    harness.detail.set_probe(&listing_url("d"), ProbeOutcome::NotFound);
    harness.scanner.set_listings(
        ["a", "b", "c"]
            .into_iter()
            .map(|slug| entry(slug, Some(200_000)))
            .collect(),
    );

    let run = harness.orchestrator.run(Tier::WeeklyDeep).await.unwrap();

    assert_eq!(run.status, SyncRunStatus::Completed);
    assert_eq!(run.counters.removed_count, 1);
    let removed = live(&harness, "d").await;
    assert_eq!(removed.listing_status, ListingStatus::ConfirmedRemoved);
    assert_eq!(removed.consecutive_missing_count, 2);
    assert!(removed.removed_at.is_some());
    assert_eq!(harness.detail.probed(), vec![listing_url("d")]);
    let manifest = ManifestRepository::get_many(harness.store.as_ref(), &[id_of("d")])
        .await
        .unwrap();
    assert!(manifest.is_empty(), "manifest row deleted");
}

#[tokio::test]
async fn probe_that_finds_the_listing_resets_and_verifies() {
    let harness = Harness::new();
    for slug in ["a", "b", "c", "d"] {
        seed_active(&harness, slug, Some(200_000)).await;
    }
    let mut flaky = live(&harness, "d").await;
    flaky.consecutive_missing_count = 1;
    LiveRecordRepository::put(harness.store.as_ref(), &flaky)
        .await
        .unwrap();
    harness.detail.set_probe(&listing_url("d"), ProbeOutcome::Exists);
    harness.scanner.set_listings(
        ["a", "b", "c"]
            .into_iter()
            .map(|slug| entry(slug, Some(200_000)))
            .collect(),
    );

    let run = harness.orchestrator.run(Tier::WeeklyDeep).await.unwrap();

    assert_eq!(run.counters.removed_count, 0);
    let record = live(&harness, "d").await;
    assert_eq!(record.listing_status, ListingStatus::Active);
    assert_eq!(record.consecutive_missing_count, 0);
    let items = harness.queue.items().await;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].reason, QueueReason::Verification);
    assert_eq!(items[0].priority, QueuePriority::P5);
}

#[tokio::test]
async fn sold_listing_seen_again_is_relisted_and_refetched() {
    let harness = Harness::new();
    let mut sold = active_record(
        id_of("x123"),
        listing_url("x123"),
        Some(300_000),
        Utc::now() - Duration::days(40),
    );
    sold.listing_status = ListingStatus::Sold;
    sold.removed_at = Some(Utc::now() - Duration::days(10));
    sold.consecutive_missing_count = 2;
    LiveRecordRepository::put(harness.store.as_ref(), &sold)
        .await
        .unwrap();
    harness.scanner.set_listings(vec![entry("x123", Some(300_000))]);

    let run = harness.orchestrator.run(Tier::HotListings).await.unwrap();

    assert_eq!(run.status, SyncRunStatus::Completed);
    assert_eq!(run.counters.relisted_count, 1);
    assert_eq!(run.counters.new_count, 0);
    let items = harness.queue.items().await;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].reason, QueueReason::Relisted);
    assert_eq!(items[0].priority, QueuePriority::P1);
    assert_eq!(items[0].status, QueueStatus::Completed);

    let record = live(&harness, "x123").await;
    assert_eq!(record.listing_status, ListingStatus::Active);
    assert_eq!(record.consecutive_missing_count, 0);
    assert!(record.removed_at.is_none());
}

#[tokio::test]
async fn price_change_threshold_is_exclusive() {
    let harness = Harness::new();
    seed_active(&harness, "steady", Some(100_000)).await;
    seed_active(&harness, "moved", Some(100_000)).await;
    harness.scanner.set_listings(vec![
        entry("steady", Some(101_000)),
        entry("moved", Some(101_001)),
    ]);

    let run = harness.orchestrator.run(Tier::DailySync).await.unwrap();

    assert_eq!(run.counters.changed_count, 1);
    let items = harness.queue.items().await;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].listing_id, id_of("moved"));
    assert_eq!(items[0].reason, QueueReason::PriceChange);
    assert_eq!(items[0].priority, QueuePriority::P2);

    let manifest = ManifestRepository::get_many(
        harness.store.as_ref(),
        &[id_of("steady"), id_of("moved")],
    )
    .await
    .unwrap();
    assert!(!manifest[&id_of("steady")].price_changed);
    assert!(!manifest[&id_of("moved")].price_changed);

    let steady = live(&harness, "steady").await;
    assert_eq!(steady.price_at_last_manifest, Some(101_000));
    assert_eq!(steady.price, Some(100_000));
}

#[tokio::test]
async fn hot_tier_ignores_price_changes() {
    let harness = Harness::new();
    seed_active(&harness, "moved", Some(100_000)).await;
    harness.scanner.set_listings(vec![entry("moved", Some(150_000))]);

    let run = harness.orchestrator.run(Tier::HotListings).await.unwrap();

    assert_eq!(run.counters.changed_count, 0);
    assert!(harness.queue.items().await.is_empty());
    // The flag stays set for the next tier that detects price changes.
    let manifest = ManifestRepository::get_many(harness.store.as_ref(), &[id_of("moved")])
        .await
        .unwrap();
    assert!(manifest[&id_of("moved")].price_changed);

    let daily = harness.orchestrator.run(Tier::DailySync).await.unwrap();
    assert_eq!(daily.counters.changed_count, 1);
}

#[tokio::test]
async fn low_coverage_skips_removal_without_writes() {
    let harness = Harness::new();
    let slugs: Vec<String> = (0..1000).map(|n| format!("home-{n}")).collect();
    for slug in &slugs {
        let mut record =
            active_record(id_of(slug), listing_url(slug), Some(150_000), Utc::now());
        record.consecutive_missing_count = 1;
        LiveRecordRepository::put(harness.store.as_ref(), &record)
            .await
            .unwrap();
    }
    harness.scanner.set_listings(
        slugs[..250]
            .iter()
            .map(|slug| entry(slug, Some(150_000)))
            .collect(),
    );

    let run = harness.orchestrator.run(Tier::WeeklyDeep).await.unwrap();

    assert_eq!(run.status, SyncRunStatus::Completed);
    assert_eq!(run.counters.removed_count, 0);
    assert!(run.alerts.iter().any(|alert| alert.starts_with("coverage alert")));
    assert!(harness.detail.probed().is_empty());

    let records = harness.store.live_records().await;
    assert!(
        records
            .iter()
            .all(|r| r.listing_status == ListingStatus::Active)
    );
    let observed = records
        .iter()
        .filter(|r| r.consecutive_missing_count == 0)
        .count();
    let untouched = records
        .iter()
        .filter(|r| r.consecutive_missing_count == 1)
        .count();
    assert_eq!(observed, 250);
    assert_eq!(untouched, 750);
}

#[tokio::test]
async fn page_that_recovers_on_retry_counts_as_scanned() {
    let harness = Harness::new();
    harness.scanner.set_listings(vec![entry("x123", Some(300_000))]);
    harness.scanner.fail_page(1, 2);

    let run = harness.orchestrator.run(Tier::HotListings).await.unwrap();

    assert_eq!(run.status, SyncRunStatus::Completed);
    assert_eq!(run.counters.pages_scanned, 1);
    assert_eq!(run.counters.pages_failed, 0);
    assert_eq!(run.counters.new_count, 1);
    assert_eq!(harness.scanner.calls(), 3);
}

#[tokio::test]
async fn too_many_failed_pages_fail_the_run_but_keep_the_manifest() {
    let harness = Harness::new();
    harness.scanner.set_pages(
        (0..10)
            .map(|n| vec![entry(&format!("page-{n}"), Some(100_000))])
            .collect(),
    );
    harness.scanner.break_page(2);
    harness.scanner.break_page(3);

    let run = harness.orchestrator.run(Tier::HotListings).await.unwrap();

    assert_eq!(run.status, SyncRunStatus::Failed);
    assert_eq!(run.counters.pages_failed, 2);
    assert!(
        run.error_summary
            .as_deref()
            .is_some_and(|summary| summary.contains("scan pages failed"))
    );
    assert!(run.alerts.iter().any(|alert| alert.starts_with("scan aborted")));
    assert_eq!(harness.store.manifest_len().await, 1);
    assert!(harness.queue.items().await.is_empty());

    let stored = SyncRunRepository::get(harness.store.as_ref(), run.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, SyncRunStatus::Failed);
}

#[tokio::test]
async fn one_failed_page_in_ten_is_tolerated() {
    let harness = Harness::new();
    harness.scanner.set_pages(
        (0..10)
            .map(|n| vec![entry(&format!("page-{n}"), Some(100_000))])
            .collect(),
    );
    harness.scanner.break_page(4);

    let run = harness.orchestrator.run(Tier::HotListings).await.unwrap();

    assert_eq!(run.status, SyncRunStatus::Completed);
    assert_eq!(run.counters.pages_scanned, 9);
    assert_eq!(run.counters.pages_failed, 1);
}

#[tokio::test]
async fn backpressure_suppresses_only_deferrable_work() {
    let mut config = test_config();
    config.queue.max_pending = 2;
    let harness = Harness::with_config(config);

    for slug in ["backlog-1", "backlog-2"] {
        harness
            .queue
            .enqueue(EnqueueRequest::new(
                id_of(slug),
                listing_url(slug),
                QueueReason::StaleData,
            ))
            .await
            .unwrap();
    }
    for slug in ["old-1", "old-2"] {
        let record = active_record(
            id_of(slug),
            listing_url(slug),
            Some(100_000),
            Utc::now() - Duration::days(60),
        );
        LiveRecordRepository::put(harness.store.as_ref(), &record)
            .await
            .unwrap();
    }
    harness.scanner.set_listings(vec![
        entry("old-1", Some(100_000)),
        entry("old-2", Some(100_000)),
        entry("fresh", Some(250_000)),
    ]);

    let run = harness.orchestrator.run(Tier::MonthlyRefresh).await.unwrap();

    assert_eq!(run.status, SyncRunStatus::Completed);
    assert_eq!(run.counters.new_count, 1);
    assert_eq!(run.counters.queued_count, 1);
    // Two stale listings plus a one-item random sample.
    assert_eq!(run.counters.suppressed_count, 3);

    let items = harness.queue.items().await;
    let reasons: Vec<QueueReason> = items
        .iter()
        .filter(|item| item.session_id == Some(run.session_id))
        .map(|item| item.reason)
        .collect();
    assert_eq!(reasons, vec![QueueReason::NewProperty]);
}

#[tokio::test]
async fn monthly_refresh_reports_quality() {
    let harness = Harness::new();
    seed_active(&harness, "a", Some(100_000)).await;
    harness.scanner.set_listings(vec![entry("a", Some(100_000))]);

    let run = harness.orchestrator.run(Tier::MonthlyRefresh).await.unwrap();

    assert_eq!(run.status, SyncRunStatus::Completed);
    assert_eq!(run.alerts.len(), 1);
    let stored = SyncRunRepository::get(harness.store.as_ref(), run.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.alerts, run.alerts);
}

#[tokio::test]
async fn cancel_request_finalizes_run_as_cancelled() {
    let harness = Harness::new();
    harness.scanner.set_pages(vec![
        vec![entry("a", Some(100_000))],
        vec![entry("b", Some(100_000))],
        vec![entry("c", Some(100_000))],
    ]);
    harness.scanner.cancel_on_page(1, harness.store.clone());

    let run = harness.orchestrator.run(Tier::HotListings).await.unwrap();

    assert_eq!(run.status, SyncRunStatus::Cancelled);
    assert!(run.error_summary.is_some());
    assert_eq!(run.counters.pages_scanned, 1);
    assert!(harness.queue.items().await.is_empty());

    let stored = SyncRunRepository::get(harness.store.as_ref(), run.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, SyncRunStatus::Cancelled);
    assert!(stored.cancel_requested);
    assert!(harness.store.running().await.unwrap().is_none());
}

#[tokio::test]
async fn url_variants_share_one_manifest_row() {
    let harness = Harness::new();
    harness.scanner.set_listings(vec![entry("x123", Some(300_000))]);
    harness.orchestrator.run(Tier::HotListings).await.unwrap();

    let variant = tiersync_core::types::ScannedEntry::from_url(
        "HTTPS://LISTINGS.EXAMPLE.COM/en/home/X123/?utm_source=feed#photos",
        Some(300_000),
        None,
    )
    .unwrap();
    assert_eq!(variant.listing_id, id_of("x123"));
    harness.scanner.set_listings(vec![variant]);
    let replay = harness.orchestrator.run(Tier::HotListings).await.unwrap();

    assert_eq!(replay.counters.new_count, 0);
    assert_eq!(harness.store.manifest_len().await, 1);
    assert_eq!(harness.queue.items().await.len(), 1);
}
