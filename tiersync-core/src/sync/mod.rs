//! The sync engine: manifest diffing, removal confirmation, the priority
//! queue and the tier orchestration that ties them together.

pub mod config;
pub mod diff;
pub mod drain;
pub mod fetch;
pub mod lifecycle;
pub mod orchestrator;
pub mod pacing;
pub mod queue;
pub mod removal;
pub mod scheduler;
pub mod stats;

pub use config::{
    DiffConfig, ListingSource, PriceChangeThreshold, QueueConfig, RetryConfig,
    SchedulerConfig, SourcesConfig, SyncConfig, TierSettings,
};
pub use diff::{DiffEngine, IngestReport, RemovalScan};
pub use drain::{DrainOptions, DrainReport, DrainStop, QueueDrainer, StopSignal};
pub use fetch::{
    DetailFetcher, FetchError, ProbeOutcome, ScanFetcher, ScanPage,
    classify_redirect,
};
pub use lifecycle::{LifecycleEvent, LifecycleState, transition};
pub use orchestrator::{SyncStores, TierOrchestrator};
pub use queue::{
    ClaimRequest, CompletionOutcome, EnqueueOutcome, EnqueueRequest, QueueItem,
    QueuePriority, QueueReason, QueueService, QueueStats, QueueStatus,
    memory::MemoryQueueService,
};
#[cfg(feature = "postgres")]
pub use queue::persistence::PostgresQueueService;
pub use removal::{ConfirmationReport, RemovalConfirmation};
pub use scheduler::{ScheduleStatus, Scheduler, TierSchedule, TierSummary};
pub use stats::{ManifestStats, QualityReport};
