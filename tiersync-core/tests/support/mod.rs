//! Scripted fetchers and a memory-backed harness for engine tests.
#![allow(dead_code)]

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use tiersync_core::{
    database::{MemoryStore, SyncRunRepository},
    sync::{
        DetailFetcher, FetchError, ListingSource, MemoryQueueService,
        ProbeOutcome, RetryConfig, ScanFetcher, ScanPage, Scheduler, SyncConfig,
        SyncStores, TierOrchestrator,
    },
    types::{FullRecord, ScannedEntry},
};

pub const BASE_URL: &str = "https://listings.example.com";

pub fn listing_url(slug: &str) -> String {
    format!("{BASE_URL}/en/home/{slug}")
}

pub fn entry(slug: &str, price: Option<i64>) -> ScannedEntry {
    ScannedEntry::from_url(listing_url(slug), price, Some(slug.to_string()))
        .expect("valid listing url")
}

/// Defaults with one source and no pacing or backoff.
pub fn test_config() -> SyncConfig {
    let mut config = SyncConfig::default();
    config.sources.base_url = BASE_URL.to_string();
    config.sources.sources =
        vec![ListingSource::new("sale", "/en/properties/for-sale")];
    config.page_retry = RetryConfig {
        max_retries: 3,
        backoff_base_ms: 0,
        backoff_max_ms: 0,
    };
    for tier in &mut config.tiers {
        tier.page_delay_ms = 0;
        tier.detail_delay_ms = 0;
    }
    config
}

#[derive(Default)]
struct ScanScript {
    pages: BTreeMap<u32, Vec<ScannedEntry>>,
    transient_failures: HashMap<u32, u32>,
    broken: HashSet<u32>,
    cancel_on: Option<(u32, Arc<MemoryStore>)>,
    calls: u32,
}

/// Serves the same pages for every source.
#[derive(Default)]
pub struct ScriptedScanner {
    script: Mutex<ScanScript>,
}

impl ScriptedScanner {
    /// Everything on page 1.
    pub fn set_listings(&self, entries: Vec<ScannedEntry>) {
        self.set_pages(vec![entries]);
    }

    pub fn set_pages(&self, pages: Vec<Vec<ScannedEntry>>) {
        let mut script = self.script.lock().unwrap();
        script.pages = pages
            .into_iter()
            .enumerate()
            .map(|(index, entries)| (index as u32 + 1, entries))
            .collect();
    }

    /// `page` fails transiently `times` times before it succeeds.
    pub fn fail_page(&self, page: u32, times: u32) {
        self.script
            .lock()
            .unwrap()
            .transient_failures
            .insert(page, times);
    }

    /// `page` never succeeds.
    pub fn break_page(&self, page: u32) {
        self.script.lock().unwrap().broken.insert(page);
    }

    /// Requests cancellation of the running run while serving `page`.
    pub fn cancel_on_page(&self, page: u32, store: Arc<MemoryStore>) {
        self.script.lock().unwrap().cancel_on = Some((page, store));
    }

    pub fn calls(&self) -> u32 {
        self.script.lock().unwrap().calls
    }
}

#[async_trait]
impl ScanFetcher for ScriptedScanner {
    async fn fetch_page(
        &self,
        _source: &ListingSource,
        page: u32,
    ) -> Result<ScanPage, FetchError> {
        let (result, cancel) = {
            let mut script = self.script.lock().unwrap();
            script.calls += 1;
            let cancel = match &script.cancel_on {
                Some((at, store)) if *at == page => Some(store.clone()),
                _ => None,
            };
            let remaining = script.transient_failures.get(&page).copied().unwrap_or(0);
            let result = if script.broken.contains(&page) {
                Err(FetchError::Transient("connection reset".into()))
            } else if remaining > 0 {
                script.transient_failures.insert(page, remaining - 1);
                Err(FetchError::Transient("503 Service Unavailable".into()))
            } else {
                Ok(ScanPage {
                    entries: script.pages.get(&page).cloned().unwrap_or_default(),
                    has_more: script.pages.keys().any(|&p| p > page),
                })
            };
            (result, cancel)
        };

        if let Some(store) = cancel
            && let Some(run) = store.running().await.unwrap()
        {
            store.request_cancel(run.id).await.unwrap();
        }
        result
    }
}

#[derive(Default)]
pub struct ScriptedDetail {
    details: Mutex<HashMap<String, Result<FullRecord, FetchError>>>,
    probes: Mutex<HashMap<String, ProbeOutcome>>,
    fetched: Mutex<Vec<String>>,
    probed: Mutex<Vec<String>>,
}

impl ScriptedDetail {
    pub fn set_detail(&self, url: &str, result: Result<FullRecord, FetchError>) {
        self.details.lock().unwrap().insert(url.to_string(), result);
    }

    pub fn set_probe(&self, url: &str, outcome: ProbeOutcome) {
        self.probes.lock().unwrap().insert(url.to_string(), outcome);
    }

    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }

    pub fn probed(&self) -> Vec<String> {
        self.probed.lock().unwrap().clone()
    }
}

#[async_trait]
impl DetailFetcher for ScriptedDetail {
    async fn fetch_detail(&self, url: &str) -> Result<FullRecord, FetchError> {
        self.fetched.lock().unwrap().push(url.to_string());
        self.details
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .unwrap_or_else(|| {
                Ok(FullRecord {
                    url: url.to_string(),
                    price: None,
                    title: None,
                    details: serde_json::json!({ "source": "scripted" }),
                })
            })
    }

    async fn probe(&self, url: &str) -> ProbeOutcome {
        self.probed.lock().unwrap().push(url.to_string());
        self.probes
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .unwrap_or_else(|| ProbeOutcome::Ambiguous("unscripted".into()))
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub queue: Arc<MemoryQueueService>,
    pub scanner: Arc<ScriptedScanner>,
    pub detail: Arc<ScriptedDetail>,
    pub orchestrator: Arc<TierOrchestrator>,
    pub scheduler: Scheduler,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: SyncConfig) -> Self {
        let (stores, store, queue) = SyncStores::memory(&config.queue);
        let scanner = Arc::new(ScriptedScanner::default());
        let detail = Arc::new(ScriptedDetail::default());
        let orchestrator = Arc::new(TierOrchestrator::new(
            stores,
            scanner.clone(),
            detail.clone(),
            Arc::new(config),
        ));
        let scheduler = Scheduler::new(orchestrator.clone());
        Self {
            store,
            queue,
            scanner,
            detail,
            orchestrator,
            scheduler,
        }
    }
}
