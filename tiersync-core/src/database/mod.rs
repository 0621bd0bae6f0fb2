//! Storage ports and their adapters.
//!
//! The engine only talks to the traits in [`ports`]. Two adapters implement
//! them: Postgres for production and an in-memory store for tests and dry
//! runs.

pub mod infrastructure;
pub mod ports;

pub use infrastructure::memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use infrastructure::postgres::{
    PostgresLiveRecordRepository, PostgresManifestRepository,
    PostgresSyncRunRepository,
};
pub use ports::{
    live_records::{LiveRecordRepository, ObservationReport, StatusTransition},
    manifest::{ManifestFlags, ManifestRepository},
    sync_runs::{RunHistoryQuery, SyncRunRepository},
};
