use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

use super::{
    ids::{SessionId, SyncRunId},
    tier::Tier,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncRunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SyncRunStatus {
    pub const ALL: [SyncRunStatus; 4] = [
        SyncRunStatus::Running,
        SyncRunStatus::Completed,
        SyncRunStatus::Failed,
        SyncRunStatus::Cancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SyncRunStatus::Running => "running",
            SyncRunStatus::Completed => "completed",
            SyncRunStatus::Failed => "failed",
            SyncRunStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, SyncRunStatus::Running)
    }
}

impl fmt::Display for SyncRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncRunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SyncRunStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown sync run status '{s}'"))
    }
}

/// Aggregated counters recorded on a sync run.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncRunCounters {
    pub pages_scanned: u64,
    pub pages_failed: u64,
    /// Distinct manifest entries written by this run's scan.
    pub manifest_size: u64,
    pub new_count: u64,
    pub changed_count: u64,
    pub removed_count: u64,
    pub relisted_count: u64,
    pub queued_count: u64,
    /// Low-priority enqueues skipped because the queue was over its ceiling.
    pub suppressed_count: u64,
    pub scraped_count: u64,
    pub error_count: u64,
}

impl SyncRunCounters {
    pub fn absorb(&mut self, other: &SyncRunCounters) {
        self.pages_scanned += other.pages_scanned;
        self.pages_failed += other.pages_failed;
        self.manifest_size += other.manifest_size;
        self.new_count += other.new_count;
        self.changed_count += other.changed_count;
        self.removed_count += other.removed_count;
        self.relisted_count += other.relisted_count;
        self.queued_count += other.queued_count;
        self.suppressed_count += other.suppressed_count;
        self.scraped_count += other.scraped_count;
        self.error_count += other.error_count;
    }
}

/// One tier execution. Append-only once it leaves `Running`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncRun {
    pub id: SyncRunId,
    pub tier: Tier,
    pub tier_name: String,
    pub status: SyncRunStatus,
    pub session_id: SessionId,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub counters: SyncRunCounters,
    pub error_summary: Option<String>,
    pub alerts: Vec<String>,
    pub cancel_requested: bool,
}

impl SyncRun {
    pub fn start(
        tier: Tier,
        tier_name: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: SyncRunId::new(),
            tier,
            tier_name: tier_name.into(),
            status: SyncRunStatus::Running,
            session_id: SessionId::new(),
            started_at,
            completed_at: None,
            counters: SyncRunCounters::default(),
            error_summary: None,
            alerts: Vec::new(),
            cancel_requested: false,
        }
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        self.completed_at.map(|done| done - self.started_at)
    }
}
