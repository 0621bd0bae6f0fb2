//! Operator-facing reports. None of these feed back into sync decisions.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ManifestStats {
    pub total: u64,
    pub flagged_new: u64,
    pub needs_full_scrape: u64,
    pub price_changed: u64,
    /// Mean hours since each entry was last seen by a scan.
    pub average_staleness_hours: Option<f64>,
    pub oldest_last_seen_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub generated_at: Option<DateTime<Utc>>,
    pub total: u64,
    pub by_status: BTreeMap<String, u64>,
    pub active: u64,
    /// Active records never fully fetched or fetched before the window.
    pub stale_active: u64,
}

impl QualityReport {
    pub fn stale_percent(&self) -> f64 {
        if self.active == 0 {
            0.0
        } else {
            (self.stale_active as f64 / self.active as f64) * 100.0
        }
    }

    pub fn summary_line(&self) -> String {
        format!(
            "quality: {} active, {} stale ({:.1}%), {} total",
            self.active,
            self.stale_active,
            self.stale_percent(),
            self.total
        )
    }
}
