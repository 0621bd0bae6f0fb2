//! Domain types shared by the engine, the store adapters and the CLI.

pub mod ids;
pub mod listing;
pub mod sync_run;
pub mod tier;

pub use ids::{ListingId, QueueItemId, SessionId, SyncRunId, WorkerId};
pub use listing::{
    FullRecord, ListingRef, ListingStatus, LiveRecord, ManifestEntry,
    MissingListing, ObservedListing, ScannedEntry,
};
pub use sync_run::{SyncRun, SyncRunCounters, SyncRunStatus};
pub use tier::Tier;
