//! # Tiersync Core
//!
//! Core library for keeping a local copy of a remote listing catalog in sync
//! through tiered, priority-driven scans.
//!
//! ## Overview
//!
//! `tiersync-core` decides what to fetch and when, offering:
//!
//! - **Manifest Diffing**: Cheap index scans classified into new, changed and missing listings
//! - **Removal Confirmation**: Two-signal removal with an existence probe
//! - **Priority Queue**: Durable full-fetch backlog with exclusive claims and retries
//! - **Tier Orchestration**: Four scan tiers of increasing depth with run bookkeeping
//! - **Scheduling**: Due-tier detection, single-tier exclusion and cooperative cancellation
//!
//! ## Feature Flags
//!
//! - `postgres`: PostgreSQL adapters for every store (SQLx)
//! - `http`: reqwest-backed scan and detail fetchers
//! - `postgres-tests`: Runs the `#[sqlx::test]` suite against `DATABASE_URL`
//!
//! ## Architecture
//!
//! - [`types`]: Listings, ids, tiers and sync run records
//! - [`database`]: Store ports plus the Postgres and in-memory adapters
//! - [`sync`]: Diff engine, removal confirmation, queue, orchestrator and scheduler
//! - [`listing_id`]: Deterministic ids derived from listing urls
//!
//! ## Examples
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use tiersync_core::{
//!     sync::{DetailFetcher, ScanFetcher, Scheduler, SyncConfig, SyncStores, TierOrchestrator},
//!     types::Tier,
//! };
//!
//! async fn run_hot_tier(
//!     scanner: Arc<dyn ScanFetcher>,
//!     detail: Arc<dyn DetailFetcher>,
//! ) -> tiersync_core::Result<()> {
//!     let config = Arc::new(SyncConfig::default());
//!     let (stores, _store, _queue) = SyncStores::memory(&config.queue);
//!     let orchestrator = TierOrchestrator::new(stores, scanner, detail, config);
//!     let scheduler = Scheduler::new(Arc::new(orchestrator));
//!
//!     let run = scheduler.run_tier(Tier::HotListings, false).await?;
//!     println!("{} finished {}", run.tier_name, run.status);
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

/// Store ports and adapters
pub mod database;

/// Error types shared by the engine and its adapters
pub mod error;

/// reqwest-backed fetchers
#[cfg(feature = "http")]
#[cfg_attr(docsrs, doc(cfg(feature = "http")))]
pub mod http;

/// Listing id derivation
pub mod listing_id;

/// The sync engine
pub mod sync;

/// Domain types
pub mod types;

pub use error::{Result, SyncError};
pub use listing_id::{listing_id_for_url, normalize_listing_url};
