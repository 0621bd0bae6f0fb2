use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

use super::ids::{ListingId, SessionId};

/// Lifecycle status of a materialized listing.
///
/// "Likely removed" is not a distinct status: it is an `Active` record with a
/// nonzero missing count (see [`LiveRecord::is_likely_removed`]).
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ListingStatus {
    #[default]
    Active,
    ConfirmedRemoved,
    Sold,
    Relisted,
}

impl ListingStatus {
    pub const ALL: [ListingStatus; 4] = [
        ListingStatus::Active,
        ListingStatus::ConfirmedRemoved,
        ListingStatus::Sold,
        ListingStatus::Relisted,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ListingStatus::Active => "active",
            ListingStatus::ConfirmedRemoved => "confirmed_removed",
            ListingStatus::Sold => "sold",
            ListingStatus::Relisted => "relisted",
        }
    }

    /// Statuses a re-observation reopens as `Relisted`.
    pub fn is_off_market(self) -> bool {
        matches!(self, ListingStatus::ConfirmedRemoved | ListingStatus::Sold)
    }
}

impl fmt::Display for ListingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ListingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ListingStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown listing status '{s}'"))
    }
}

/// One raw entry produced by the scan fetcher.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScannedEntry {
    pub listing_id: ListingId,
    pub url: String,
    pub price: Option<i64>,
    pub title: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl ScannedEntry {
    /// Builds an entry whose id is derived from the url.
    pub fn from_url(
        url: impl Into<String>,
        price: Option<i64>,
        title: Option<String>,
    ) -> crate::error::Result<Self> {
        let url = url.into();
        let listing_id = crate::listing_id::listing_id_for_url(&url)?;
        Ok(Self {
            listing_id,
            url,
            price,
            title,
            latitude: None,
            longitude: None,
        })
    }
}

/// Lightweight per-listing tracking record maintained by manifest scans.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub listing_id: ListingId,
    pub url: String,
    pub price: Option<i64>,
    pub title: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub seen_in_session: Option<SessionId>,
    pub is_new: bool,
    pub needs_full_scrape: bool,
    pub price_changed: bool,
}

/// The materialized listing served to consumers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LiveRecord {
    pub listing_id: ListingId,
    pub url: String,
    pub price: Option<i64>,
    pub title: Option<String>,
    pub listing_status: ListingStatus,
    pub consecutive_missing_count: u32,
    pub last_manifest_seen_at: Option<DateTime<Utc>>,
    /// Manifest price at the most recent sighting; `price` is the value
    /// from the last full fetch.
    #[serde(default)]
    pub price_at_last_manifest: Option<i64>,
    pub last_full_scrape_at: Option<DateTime<Utc>>,
    pub scrape_priority: Option<u8>,
    pub removed_at: Option<DateTime<Utc>>,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LiveRecord {
    pub fn is_likely_removed(&self) -> bool {
        self.listing_status == ListingStatus::Active
            && self.consecutive_missing_count > 0
    }
}

/// Result of a successful detail fetch.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FullRecord {
    pub url: String,
    pub price: Option<i64>,
    pub title: Option<String>,
    #[serde(default)]
    pub details: serde_json::Value,
}

/// Listing id plus the url needed to fetch or probe it.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ListingRef {
    pub listing_id: ListingId,
    pub url: String,
}

/// An active record that a scan session did not observe.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct MissingListing {
    pub listing_id: ListingId,
    pub url: String,
    pub consecutive_missing_count: u32,
}

/// A live record that a scan session did observe, with its status before the
/// observation reset its missing count.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ObservedListing {
    pub listing_id: ListingId,
    pub url: String,
    pub listing_status: ListingStatus,
    pub previous_missing_count: u32,
}
