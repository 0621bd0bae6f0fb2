//! reqwest-backed fetchers for sources that publish a JSON listing feed.
//!
//! Response bodies are handed to a [`PageParser`] or [`DetailParser`], so a
//! source with a different payload only needs its own parser.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode, header::LOCATION, redirect};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::{
    error::{Result, SyncError},
    listing_id::listing_id_with_prefix,
    sync::{
        config::{ListingSource, SourcesConfig},
        fetch::{
            DetailFetcher, FetchError, ProbeOutcome, ScanFetcher, ScanPage,
            classify_redirect,
        },
    },
    types::{FullRecord, ScannedEntry},
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpFetchConfig {
    pub user_agent: String,
    pub timeout_secs: u64,
    pub probe_timeout_secs: u64,
}

impl Default for HttpFetchConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("tiersync/{}", env!("CARGO_PKG_VERSION")),
            timeout_secs: 30,
            probe_timeout_secs: 10,
        }
    }
}

impl HttpFetchConfig {
    fn client(&self, timeout_secs: u64) -> Result<Client> {
        Client::builder()
            .user_agent(&self.user_agent)
            .timeout(Duration::from_secs(timeout_secs))
            // Redirects carry the removal signal, so they are never followed.
            .redirect(redirect::Policy::none())
            .build()
            .map_err(|e| {
                SyncError::InvalidConfig(format!("failed to build HTTP client: {e}"))
            })
    }
}

/// Turns a scan page body into entries.
pub trait PageParser: Send + Sync {
    fn parse_page(
        &self,
        page_url: &Url,
        body: &str,
        id_prefix: &str,
    ) -> std::result::Result<ScanPage, FetchError>;
}

/// Turns a listing detail body into a full record.
pub trait DetailParser: Send + Sync {
    fn parse_detail(
        &self,
        url: &str,
        body: &str,
    ) -> std::result::Result<FullRecord, FetchError>;
}

/// Parses feeds shaped like
/// `{"listings": [{"url", "price", "title", "latitude", "longitude"}], "has_more": bool}`
/// and detail documents carrying `price` and `title` next to arbitrary data.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonFeedParser;

#[derive(Debug, Deserialize)]
struct FeedPage {
    #[serde(default)]
    listings: Vec<FeedListing>,
    has_more: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct FeedListing {
    url: String,
    price: Option<i64>,
    title: Option<String>,
    latitude: Option<f64>,
    longitude: Option<f64>,
}

impl PageParser for JsonFeedParser {
    fn parse_page(
        &self,
        page_url: &Url,
        body: &str,
        id_prefix: &str,
    ) -> std::result::Result<ScanPage, FetchError> {
        let page: FeedPage = serde_json::from_str(body)
            .map_err(|e| FetchError::Parse(format!("{page_url}: {e}")))?;

        let mut entries = Vec::with_capacity(page.listings.len());
        for listing in page.listings {
            let url = match page_url.join(&listing.url) {
                Ok(url) => url.to_string(),
                Err(e) => {
                    warn!(
                        target: "tiersync::http",
                        page = %page_url,
                        url = %listing.url,
                        error = %e,
                        "Skipping feed entry with unusable url"
                    );
                    continue;
                }
            };
            let listing_id = listing_id_with_prefix(id_prefix, &url)
                .map_err(|e| FetchError::Parse(e.to_string()))?;
            entries.push(ScannedEntry {
                listing_id,
                url,
                price: listing.price,
                title: listing.title,
                latitude: listing.latitude,
                longitude: listing.longitude,
            });
        }

        // Feeds without the flag end at the first empty page.
        let has_more = page.has_more.unwrap_or(!entries.is_empty());
        Ok(ScanPage { entries, has_more })
    }
}

impl DetailParser for JsonFeedParser {
    fn parse_detail(
        &self,
        url: &str,
        body: &str,
    ) -> std::result::Result<FullRecord, FetchError> {
        let details: serde_json::Value = serde_json::from_str(body)
            .map_err(|e| FetchError::Parse(format!("{url}: {e}")))?;
        if !details.is_object() {
            return Err(FetchError::Parse(format!(
                "{url}: expected a JSON object"
            )));
        }
        Ok(FullRecord {
            url: url.to_string(),
            price: details.get("price").and_then(serde_json::Value::as_i64),
            title: details
                .get("title")
                .and_then(serde_json::Value::as_str)
                .map(str::to_string),
            details,
        })
    }
}

fn transport_error(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Transient(format!("timeout: {err}"))
    } else {
        FetchError::Transient(err.to_string())
    }
}

fn location_of(response: &Response) -> Option<String> {
    response
        .headers()
        .get(LOCATION)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

/// Maps a non-success status onto the fetch error taxonomy.
fn status_error(status: StatusCode, location: Option<String>) -> FetchError {
    match status {
        StatusCode::NOT_FOUND | StatusCode::GONE => FetchError::NotFound,
        StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS => {
            FetchError::Blocked(status.to_string())
        }
        s if s.is_redirection() => FetchError::Redirected {
            location: location.unwrap_or_default(),
        },
        s if s.is_server_error() => FetchError::Transient(s.to_string()),
        // 408 Request Timeout and 425 Too Early invite a retry.
        s if s == StatusCode::REQUEST_TIMEOUT || s.as_u16() == 425 => {
            FetchError::Transient(s.to_string())
        }
        s => FetchError::Parse(format!("unexpected status {s}")),
    }
}

async fn body_of(response: Response) -> std::result::Result<String, FetchError> {
    let status = response.status();
    if !status.is_success() {
        let location = location_of(&response);
        return Err(status_error(status, location));
    }
    response.text().await.map_err(transport_error)
}

pub struct HttpScanFetcher {
    client: Client,
    sources: SourcesConfig,
    id_prefix: String,
    parser: Arc<dyn PageParser>,
}

impl std::fmt::Debug for HttpScanFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpScanFetcher")
            .field("base_url", &self.sources.base_url)
            .field("sources", &self.sources.sources.len())
            .field("id_prefix", &self.id_prefix)
            .finish_non_exhaustive()
    }
}

impl HttpScanFetcher {
    pub fn new(
        config: &HttpFetchConfig,
        sources: SourcesConfig,
        id_prefix: impl Into<String>,
    ) -> Result<Self> {
        Self::with_parser(config, sources, id_prefix, Arc::new(JsonFeedParser))
    }

    pub fn with_parser(
        config: &HttpFetchConfig,
        sources: SourcesConfig,
        id_prefix: impl Into<String>,
        parser: Arc<dyn PageParser>,
    ) -> Result<Self> {
        Ok(Self {
            client: config.client(config.timeout_secs)?,
            sources,
            id_prefix: id_prefix.into(),
            parser,
        })
    }
}

#[async_trait]
impl ScanFetcher for HttpScanFetcher {
    async fn fetch_page(
        &self,
        source: &ListingSource,
        page: u32,
    ) -> std::result::Result<ScanPage, FetchError> {
        let raw = self.sources.page_url(source, page);
        let page_url = Url::parse(&raw)
            .map_err(|e| FetchError::Parse(format!("{raw}: {e}")))?;

        let response = self
            .client
            .get(page_url.clone())
            .send()
            .await
            .map_err(transport_error)?;
        let body = body_of(response).await?;
        let parsed = self.parser.parse_page(&page_url, &body, &self.id_prefix)?;

        debug!(
            target: "tiersync::http",
            source = %source.name,
            page,
            entries = parsed.entries.len(),
            has_more = parsed.has_more,
            "Fetched scan page"
        );
        Ok(parsed)
    }
}

pub struct HttpDetailFetcher {
    client: Client,
    probe_client: Client,
    parser: Arc<dyn DetailParser>,
}

impl std::fmt::Debug for HttpDetailFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpDetailFetcher").finish_non_exhaustive()
    }
}

impl HttpDetailFetcher {
    pub fn new(config: &HttpFetchConfig) -> Result<Self> {
        Self::with_parser(config, Arc::new(JsonFeedParser))
    }

    pub fn with_parser(
        config: &HttpFetchConfig,
        parser: Arc<dyn DetailParser>,
    ) -> Result<Self> {
        Ok(Self {
            client: config.client(config.timeout_secs)?,
            probe_client: config.client(config.probe_timeout_secs)?,
            parser,
        })
    }
}

/// Probe outcome for the status of a `HEAD` request.
pub fn probe_outcome(status: StatusCode, location: Option<&str>) -> ProbeOutcome {
    match status {
        StatusCode::OK => ProbeOutcome::Exists,
        StatusCode::NOT_FOUND | StatusCode::GONE => ProbeOutcome::NotFound,
        s if s.is_redirection() => match location {
            Some(location) => classify_redirect(location),
            None => ProbeOutcome::Ambiguous(format!("{s} without location")),
        },
        s => ProbeOutcome::Ambiguous(format!("status {s}")),
    }
}

#[async_trait]
impl DetailFetcher for HttpDetailFetcher {
    async fn fetch_detail(
        &self,
        url: &str,
    ) -> std::result::Result<FullRecord, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(transport_error)?;
        let body = body_of(response).await?;
        self.parser.parse_detail(url, &body)
    }

    async fn probe(&self, url: &str) -> ProbeOutcome {
        match self.probe_client.head(url).send().await {
            Ok(response) => {
                let location = location_of(&response);
                probe_outcome(response.status(), location.as_deref())
            }
            Err(err) => ProbeOutcome::Ambiguous(transport_error(err).to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page_url() -> Url {
        Url::parse("https://listings.example.com/en/properties/for-sale?page=2")
            .unwrap()
    }

    #[test]
    fn feed_entries_resolve_relative_urls_and_derive_ids() {
        let body = r#"{
            "listings": [
                {"url": "/en/home/casa-azul", "price": 250000, "title": "Casa Azul"},
                {"url": "https://listings.example.com/en/home/villa", "latitude": 38.7, "longitude": -9.1}
            ],
            "has_more": true
        }"#;

        let page = JsonFeedParser
            .parse_page(&page_url(), body, "listing")
            .unwrap();

        assert!(page.has_more);
        assert_eq!(page.entries.len(), 2);
        let first = &page.entries[0];
        assert_eq!(first.url, "https://listings.example.com/en/home/casa-azul");
        assert_eq!(first.price, Some(250_000));
        assert_eq!(
            first.listing_id,
            listing_id_with_prefix("listing", &first.url).unwrap()
        );
        assert_eq!(page.entries[1].latitude, Some(38.7));
        assert_eq!(page.entries[1].price, None);
    }

    #[test]
    fn feed_without_flag_ends_on_empty_page() {
        let page = JsonFeedParser
            .parse_page(&page_url(), r#"{"listings": []}"#, "listing")
            .unwrap();
        assert!(!page.has_more);
        assert!(page.entries.is_empty());
    }

    #[test]
    fn malformed_feed_is_a_parse_error() {
        let err = JsonFeedParser
            .parse_page(&page_url(), "<html>", "listing")
            .unwrap_err();
        assert!(matches!(err, FetchError::Parse(_)));
    }

    #[test]
    fn detail_document_keeps_payload() {
        let record = JsonFeedParser
            .parse_detail(
                "https://listings.example.com/en/home/x123",
                r#"{"price": 300000, "title": "X123", "bedrooms": 3}"#,
            )
            .unwrap();
        assert_eq!(record.price, Some(300_000));
        assert_eq!(record.title.as_deref(), Some("X123"));
        assert_eq!(record.details["bedrooms"], 3);

        assert!(matches!(
            JsonFeedParser.parse_detail("u", "[1, 2]"),
            Err(FetchError::Parse(_))
        ));
    }

    #[test]
    fn statuses_map_to_fetch_errors() {
        assert_eq!(status_error(StatusCode::NOT_FOUND, None), FetchError::NotFound);
        assert!(matches!(
            status_error(StatusCode::TOO_MANY_REQUESTS, None),
            FetchError::Blocked(_)
        ));
        assert!(matches!(
            status_error(StatusCode::BAD_GATEWAY, None),
            FetchError::Transient(_)
        ));
        for retryable in [408, 425] {
            let status = StatusCode::from_u16(retryable).unwrap();
            let err = status_error(status, None);
            assert!(matches!(err, FetchError::Transient(_)), "{retryable}");
            assert!(err.is_retryable());
        }
        assert!(matches!(
            status_error(StatusCode::UNPROCESSABLE_ENTITY, None),
            FetchError::Parse(_)
        ));
        assert_eq!(
            status_error(StatusCode::MOVED_PERMANENTLY, Some("/search".into())),
            FetchError::Redirected {
                location: "/search".into()
            }
        );
    }

    #[test]
    fn head_statuses_map_to_probe_outcomes() {
        assert_eq!(probe_outcome(StatusCode::OK, None), ProbeOutcome::Exists);
        assert_eq!(probe_outcome(StatusCode::GONE, None), ProbeOutcome::NotFound);
        assert_eq!(
            probe_outcome(StatusCode::FOUND, Some("/en/properties/for-sale")),
            ProbeOutcome::NotFound
        );
        assert_eq!(
            probe_outcome(StatusCode::FOUND, Some("/en/sold/x123")),
            ProbeOutcome::Sold
        );
        assert!(matches!(
            probe_outcome(StatusCode::SERVICE_UNAVAILABLE, None),
            ProbeOutcome::Ambiguous(_)
        ));
        assert!(matches!(
            probe_outcome(StatusCode::TOO_MANY_REQUESTS, None),
            ProbeOutcome::Ambiguous(_)
        ));
    }
}
