//! Engine configuration types.
//!
//! These structures are shared by the config loader, the CLI and the engine,
//! so they live here and derive serde with `#[serde(default)]`: a partial
//! TOML or JSON file only overrides the keys it names.

use serde::{Deserialize, Serialize};
use std::{collections::HashSet, time::Duration};

use crate::{
    error::{Result, SyncError},
    types::Tier,
};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Prefix used when deriving listing ids from urls.
    pub id_prefix: String,
    pub sources: SourcesConfig,
    pub diff: DiffConfig,
    pub queue: QueueConfig,
    /// Retry policy for individual scan pages.
    pub page_retry: RetryConfig,
    /// A run fails once more than this share of its scan pages failed.
    pub max_page_error_percent: u8,
    pub scheduler: SchedulerConfig,
    pub tiers: Vec<TierSettings>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            id_prefix: crate::listing_id::DEFAULT_ID_PREFIX.to_string(),
            sources: SourcesConfig::default(),
            diff: DiffConfig::default(),
            queue: QueueConfig::default(),
            page_retry: RetryConfig::default(),
            max_page_error_percent: 10,
            scheduler: SchedulerConfig::default(),
            tiers: Tier::ALL.into_iter().map(TierSettings::defaults).collect(),
        }
    }
}

impl SyncConfig {
    pub fn tier(&self, tier: Tier) -> Result<&TierSettings> {
        self.tiers
            .iter()
            .find(|settings| settings.tier == tier)
            .ok_or_else(|| {
                SyncError::InvalidConfig(format!("tier {tier} is not configured"))
            })
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(SyncError::InvalidConfig(msg));

        if self.queue.max_attempts == 0 {
            return invalid("queue.max_attempts must be at least 1".into());
        }
        if self.queue.claim_batch_size == 0 {
            return invalid("queue.claim_batch_size must be at least 1".into());
        }
        if self.queue.retry_backoff_max_ms < self.queue.retry_backoff_base_ms {
            return invalid(
                "queue.retry_backoff_max_ms must not be below the base".into(),
            );
        }
        if self.diff.min_missing_count_for_removal == 0 {
            return invalid(
                "diff.min_missing_count_for_removal must be at least 1".into(),
            );
        }
        if self.diff.min_coverage_percent > 100 {
            return invalid("diff.min_coverage_percent must be 0-100".into());
        }
        if self.max_page_error_percent > 100 {
            return invalid("max_page_error_percent must be 0-100".into());
        }
        if self.diff.price_change.relative_percent < 0.0
            || self.diff.price_change.absolute_cap < 0
        {
            return invalid("price_change thresholds must be positive".into());
        }
        if self.sources.sources.is_empty() {
            return invalid("at least one listing source is required".into());
        }
        url::Url::parse(&self.sources.base_url).map_err(|e| {
            SyncError::InvalidConfig(format!(
                "sources.base_url '{}' is invalid: {e}",
                self.sources.base_url
            ))
        })?;

        let mut seen = HashSet::new();
        for settings in &self.tiers {
            if !seen.insert(settings.tier) {
                return invalid(format!(
                    "tier {} is configured more than once",
                    settings.tier
                ));
            }
            if settings.frequency_hours == 0 {
                return invalid(format!(
                    "tier {} frequency_hours must be at least 1",
                    settings.tier
                ));
            }
            if let Some(percent) = settings.random_sample_percent
                && !(0.0..=100.0).contains(&percent)
            {
                return invalid(format!(
                    "tier {} random_sample_percent must be 0-100",
                    settings.tier
                ));
            }
        }
        Ok(())
    }
}

/// Where listing index pages live.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SourcesConfig {
    pub base_url: String,
    pub sources: Vec<ListingSource>,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            base_url: "https://listings.example.com".to_string(),
            sources: vec![
                ListingSource::new("sale", "/en/properties/for-sale"),
                ListingSource::new("rent", "/en/properties/for-rent"),
                ListingSource::new("foreclosure", "/en/properties/foreclosures"),
                ListingSource::new(
                    "new_construction",
                    "/en/properties/new-construction",
                ),
            ],
        }
    }
}

impl SourcesConfig {
    /// Url of page `page` (1-based) for `source`.
    pub fn page_url(&self, source: &ListingSource, page: u32) -> String {
        let base = self.base_url.trim_end_matches('/');
        let path = source.path.trim_start_matches('/');
        if page <= 1 {
            format!("{base}/{path}")
        } else {
            format!("{base}/{path}?page={page}")
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ListingSource {
    pub name: String,
    pub path: String,
}

impl ListingSource {
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffConfig {
    /// Consecutive misses before an active listing becomes a removal
    /// candidate.
    pub min_missing_count_for_removal: u32,
    /// Removal processing is skipped when a scan observed less than this
    /// share of the known active population.
    pub min_coverage_percent: u8,
    pub price_change: PriceChangeThreshold,
}

impl Default for DiffConfig {
    fn default() -> Self {
        Self {
            min_missing_count_for_removal: 2,
            min_coverage_percent: 50,
            price_change: PriceChangeThreshold::default(),
        }
    }
}

/// A price move is significant when it exceeds the smaller of a relative and
/// an absolute threshold.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PriceChangeThreshold {
    pub relative_percent: f64,
    pub absolute_cap: i64,
}

impl Default for PriceChangeThreshold {
    fn default() -> Self {
        Self {
            relative_percent: 1.0,
            absolute_cap: 1_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Claims allowed per item before it is marked failed.
    pub max_attempts: u16,
    /// Pending depth above which low-priority enqueues are suppressed.
    pub max_pending: u64,
    /// In-progress claims older than this are returned to pending.
    pub stale_claim_timeout_secs: u64,
    /// Completed and cancelled items older than this are purged.
    pub retention_days: u32,
    pub claim_batch_size: usize,
    /// Delay before the first re-claim of a retryably failed item. Doubles
    /// per attempt up to `retry_backoff_max_ms`.
    pub retry_backoff_base_ms: u64,
    pub retry_backoff_max_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_pending: 10_000,
            stale_claim_timeout_secs: 30 * 60,
            retention_days: 7,
            claim_batch_size: 10,
            retry_backoff_base_ms: 60_000,
            retry_backoff_max_ms: 60 * 60 * 1_000,
        }
    }
}

impl QueueConfig {
    pub fn stale_claim_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_claim_timeout_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(u64::from(self.retention_days) * 24 * 60 * 60)
    }

    /// Backoff applied to queue items, in the same shape as page retries.
    pub fn retry_backoff(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_attempts.saturating_sub(1),
            backoff_base_ms: self.retry_backoff_base_ms,
            backoff_max_ms: self.retry_backoff_max_ms,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first failed attempt.
    pub max_retries: u16,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl RetryConfig {
    /// Exponential delay before retry `attempt` (1-based), capped at
    /// `backoff_max_ms`.
    pub fn delay_for(&self, attempt: u16) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exp = i32::from(attempt.saturating_sub(1));
        let scaled = (self.backoff_base_ms as f64) * 2f64.powi(exp);
        let capped = scaled.min(self.backoff_max_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_ms: 1_000,
            backoff_max_ms: 30_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// A run still marked running after this long is treated as abandoned.
    pub abandoned_run_after_secs: u64,
    pub daemon_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            abandoned_run_after_secs: 12 * 60 * 60,
            daemon_interval_secs: 300,
        }
    }
}

impl SchedulerConfig {
    pub fn abandoned_run_after(&self) -> Duration {
        Duration::from_secs(self.abandoned_run_after_secs)
    }

    pub fn daemon_interval(&self) -> Duration {
        Duration::from_secs(self.daemon_interval_secs)
    }
}

/// Which diff detections a tier acts on.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionSet {
    pub new_listings: bool,
    pub price_changes: bool,
    pub removals: bool,
}

impl Default for DetectionSet {
    fn default() -> Self {
        Self {
            new_listings: true,
            price_changes: false,
            removals: false,
        }
    }
}

/// Enqueue listings whose last full fetch is older than `after_days`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct StalePolicy {
    pub after_days: u32,
    /// Per-run cap on stale enqueues.
    pub cap: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TierSettings {
    pub tier: Tier,
    pub name: String,
    pub frequency_hours: u32,
    /// Pages scanned per source; 0 scans until a source runs out of pages.
    pub max_pages_per_source: u32,
    /// Upper bound for unbounded scans.
    #[serde(default = "default_page_hard_cap")]
    pub page_hard_cap: u32,
    pub page_delay_ms: u64,
    pub detail_delay_ms: u64,
    /// Per-run cap on drained queue items.
    pub max_queue_items: usize,
    #[serde(default)]
    pub detections: DetectionSet,
    #[serde(default)]
    pub stale: Option<StalePolicy>,
    /// Share of active listings sampled for re-fetch each run.
    #[serde(default)]
    pub random_sample_percent: Option<f64>,
    /// Highest priority number this tier drains; `None` drains everything.
    #[serde(default)]
    pub drain_max_priority: Option<u8>,
}

fn default_page_hard_cap() -> u32 {
    5_000
}

impl TierSettings {
    pub fn defaults(tier: Tier) -> Self {
        let base = |frequency_hours,
                    max_pages_per_source,
                    page_delay_ms,
                    detail_delay_ms,
                    max_queue_items| TierSettings {
            tier,
            name: tier.default_name().to_string(),
            frequency_hours,
            max_pages_per_source,
            page_hard_cap: default_page_hard_cap(),
            page_delay_ms,
            detail_delay_ms,
            max_queue_items,
            detections: DetectionSet::default(),
            stale: None,
            random_sample_percent: None,
            drain_max_priority: None,
        };

        match tier {
            Tier::HotListings => TierSettings {
                drain_max_priority: Some(1),
                ..base(6, 10, 1_500, 500, 500)
            },
            Tier::DailySync => TierSettings {
                detections: DetectionSet {
                    new_listings: true,
                    price_changes: true,
                    removals: false,
                },
                drain_max_priority: Some(2),
                ..base(24, 100, 2_000, 1_000, 5_000)
            },
            Tier::WeeklyDeep => TierSettings {
                detections: DetectionSet {
                    new_listings: true,
                    price_changes: true,
                    removals: true,
                },
                stale: Some(StalePolicy {
                    after_days: 7,
                    cap: 5_000,
                }),
                ..base(168, 0, 2_000, 1_000, 10_000)
            },
            Tier::MonthlyRefresh => TierSettings {
                detections: DetectionSet {
                    new_listings: true,
                    price_changes: true,
                    removals: true,
                },
                stale: Some(StalePolicy {
                    after_days: 30,
                    cap: 10_000,
                }),
                random_sample_percent: Some(10.0),
                ..base(720, 0, 3_000, 1_500, 20_000)
            },
        }
    }

    pub fn frequency(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.frequency_hours))
    }

    pub fn page_delay(&self) -> Duration {
        Duration::from_millis(self.page_delay_ms)
    }

    pub fn detail_delay(&self) -> Duration {
        Duration::from_millis(self.detail_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate_and_cover_every_tier() {
        let config = SyncConfig::default();
        config.validate().expect("defaults are valid");
        for tier in Tier::ALL {
            assert_eq!(config.tier(tier).unwrap().tier, tier);
        }
        let weekly = config.tier(Tier::WeeklyDeep).unwrap();
        assert_eq!(weekly.stale.unwrap().cap, weekly.max_queue_items / 2);
    }

    #[test]
    fn duplicate_tiers_are_rejected() {
        let mut config = SyncConfig::default();
        config.tiers.push(TierSettings::defaults(Tier::HotListings));
        assert!(matches!(
            config.validate(),
            Err(SyncError::InvalidConfig(_))
        ));
    }

    #[test]
    fn backoff_doubles_until_capped() {
        let retry = RetryConfig {
            max_retries: 5,
            backoff_base_ms: 100,
            backoff_max_ms: 350,
        };
        assert_eq!(retry.delay_for(0), Duration::ZERO);
        assert_eq!(retry.delay_for(1), Duration::from_millis(100));
        assert_eq!(retry.delay_for(2), Duration::from_millis(200));
        assert_eq!(retry.delay_for(3), Duration::from_millis(350));
    }

    #[test]
    fn queue_backoff_follows_queue_settings() {
        let queue = QueueConfig {
            retry_backoff_base_ms: 1_000,
            retry_backoff_max_ms: 3_000,
            ..QueueConfig::default()
        };
        let backoff = queue.retry_backoff();
        assert_eq!(backoff.delay_for(1), Duration::from_secs(1));
        assert_eq!(backoff.delay_for(4), Duration::from_secs(3));

        let mut config = SyncConfig::default();
        config.queue.retry_backoff_max_ms = 0;
        assert!(matches!(
            config.validate(),
            Err(SyncError::InvalidConfig(_))
        ));
    }

    #[test]
    fn page_urls_use_query_pagination() {
        let sources = SourcesConfig::default();
        let sale = &sources.sources[0];
        assert_eq!(
            sources.page_url(sale, 1),
            "https://listings.example.com/en/properties/for-sale"
        );
        assert_eq!(
            sources.page_url(sale, 3),
            "https://listings.example.com/en/properties/for-sale?page=3"
        );
    }

    #[test]
    fn partial_json_overrides_only_named_keys() {
        let config: SyncConfig =
            serde_json::from_str(r#"{"queue": {"max_pending": 42}}"#).unwrap();
        assert_eq!(config.queue.max_pending, 42);
        assert_eq!(config.queue.max_attempts, 3);
        assert_eq!(config.tiers.len(), 4);
    }
}
