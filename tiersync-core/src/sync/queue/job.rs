use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

use crate::types::{ListingId, QueueItemId, SessionId, WorkerId};

/// Priority bands; lower numbers are claimed first.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum QueuePriority {
    P1 = 1,
    P2 = 2,
    P3 = 3,
    P4 = 4,
    P5 = 5,
}

impl QueuePriority {
    pub const ALL: [QueuePriority; 5] = [
        QueuePriority::P1,
        QueuePriority::P2,
        QueuePriority::P3,
        QueuePriority::P4,
        QueuePriority::P5,
    ];

    pub fn value(self) -> u8 {
        self as u8
    }
}

impl From<QueuePriority> for u8 {
    fn from(priority: QueuePriority) -> Self {
        priority.value()
    }
}

impl TryFrom<u8> for QueuePriority {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        QueuePriority::ALL
            .into_iter()
            .find(|priority| priority.value() == value)
            .ok_or_else(|| format!("queue priority must be 1-5, got {value}"))
    }
}

impl fmt::Display for QueuePriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value())
    }
}

/// Why a listing needs a full fetch. The priority is a fixed function of the
/// reason.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueReason {
    NewProperty,
    PriceChange,
    Relisted,
    StaleData,
    Verification,
    RandomSample,
}

impl QueueReason {
    pub const ALL: [QueueReason; 6] = [
        QueueReason::NewProperty,
        QueueReason::PriceChange,
        QueueReason::Relisted,
        QueueReason::StaleData,
        QueueReason::Verification,
        QueueReason::RandomSample,
    ];

    pub fn priority(self) -> QueuePriority {
        match self {
            QueueReason::NewProperty | QueueReason::Relisted => QueuePriority::P1,
            QueueReason::PriceChange => QueuePriority::P2,
            QueueReason::StaleData => QueuePriority::P4,
            QueueReason::Verification | QueueReason::RandomSample => {
                QueuePriority::P5
            }
        }
    }

    /// Reasons that backpressure may suppress.
    pub fn is_deferrable(self) -> bool {
        matches!(
            self,
            QueueReason::StaleData
                | QueueReason::Verification
                | QueueReason::RandomSample
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            QueueReason::NewProperty => "new_property",
            QueueReason::PriceChange => "price_change",
            QueueReason::Relisted => "relisted",
            QueueReason::StaleData => "stale_data",
            QueueReason::Verification => "verification",
            QueueReason::RandomSample => "random_sample",
        }
    }
}

impl fmt::Display for QueueReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QueueReason::ALL
            .into_iter()
            .find(|reason| reason.as_str() == s)
            .ok_or_else(|| format!("unknown queue reason '{s}'"))
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl QueueStatus {
    pub const ALL: [QueueStatus; 5] = [
        QueueStatus::Pending,
        QueueStatus::InProgress,
        QueueStatus::Completed,
        QueueStatus::Failed,
        QueueStatus::Cancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::InProgress => "in_progress",
            QueueStatus::Completed => "completed",
            QueueStatus::Failed => "failed",
            QueueStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_purgeable(self) -> bool {
        matches!(self, QueueStatus::Completed | QueueStatus::Cancelled)
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QueueStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown queue status '{s}'"))
    }
}

/// Persisted queue row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: QueueItemId,
    /// Insertion order; breaks ties between equal `queued_at` stamps.
    pub seq: i64,
    pub listing_id: ListingId,
    pub url: String,
    pub priority: QueuePriority,
    pub reason: QueueReason,
    pub status: QueueStatus,
    pub queued_at: DateTime<Utc>,
    /// Earliest instant the item may be claimed. Pushed forward by the
    /// retry backoff after a retryable failure.
    pub available_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub claimed_by: Option<WorkerId>,
    pub completed_at: Option<DateTime<Utc>>,
    pub attempt_count: u16,
    pub last_error: Option<String>,
    pub session_id: Option<SessionId>,
}

/// Request to queue one listing for a full fetch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnqueueRequest {
    pub listing_id: ListingId,
    pub url: String,
    pub reason: QueueReason,
    pub session_id: Option<SessionId>,
}

impl EnqueueRequest {
    pub fn new(
        listing_id: ListingId,
        url: impl Into<String>,
        reason: QueueReason,
    ) -> Self {
        Self {
            listing_id,
            url: url.into(),
            reason,
            session_id: None,
        }
    }

    pub fn with_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn priority(&self) -> QueuePriority {
        self.reason.priority()
    }
}

/// Result of an enqueue; a pending item for the listing is never duplicated
/// or re-ranked.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EnqueueOutcome {
    Inserted(QueueItemId),
    AlreadyPending(QueueItemId),
}

impl EnqueueOutcome {
    pub fn item_id(&self) -> QueueItemId {
        match self {
            EnqueueOutcome::Inserted(id) | EnqueueOutcome::AlreadyPending(id) => {
                *id
            }
        }
    }

    pub fn inserted(&self) -> bool {
        matches!(self, EnqueueOutcome::Inserted(_))
    }
}

/// Batch reservation request.
#[derive(Clone, Debug)]
pub struct ClaimRequest {
    pub limit: usize,
    pub worker: WorkerId,
    /// Only claim items whose priority number is at most this.
    pub max_priority: Option<QueuePriority>,
}

impl ClaimRequest {
    pub fn new(limit: usize, worker: WorkerId) -> Self {
        Self {
            limit,
            worker,
            max_priority: None,
        }
    }

    pub fn with_max_priority(mut self, max: Option<QueuePriority>) -> Self {
        self.max_priority = max;
        self
    }

    pub fn admits(&self, priority: QueuePriority) -> bool {
        self.max_priority.is_none_or(|max| priority <= max)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CompletionOutcome {
    Succeeded,
    Failed { error: String, retryable: bool },
}

impl CompletionOutcome {
    pub fn retryable(error: impl Into<String>) -> Self {
        CompletionOutcome::Failed {
            error: error.into(),
            retryable: true,
        }
    }

    pub fn permanent(error: impl Into<String>) -> Self {
        CompletionOutcome::Failed {
            error: error.into(),
            retryable: false,
        }
    }
}

/// Status a failed attempt lands in: back to pending while attempts remain
/// and the failure is retryable, failed otherwise.
pub fn status_after_failure(
    attempt_count: u16,
    max_attempts: u16,
    retryable: bool,
) -> QueueStatus {
    if retryable && attempt_count < max_attempts {
        QueueStatus::Pending
    } else {
        QueueStatus::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_priority_mapping_is_fixed() {
        assert_eq!(QueueReason::NewProperty.priority(), QueuePriority::P1);
        assert_eq!(QueueReason::Relisted.priority(), QueuePriority::P1);
        assert_eq!(QueueReason::PriceChange.priority(), QueuePriority::P2);
        assert_eq!(QueueReason::StaleData.priority(), QueuePriority::P4);
        assert_eq!(QueueReason::Verification.priority(), QueuePriority::P5);
        assert_eq!(QueueReason::RandomSample.priority(), QueuePriority::P5);
    }

    #[test]
    fn only_low_priority_reasons_are_deferrable() {
        let deferrable: Vec<_> = QueueReason::ALL
            .into_iter()
            .filter(|reason| reason.is_deferrable())
            .collect();
        assert_eq!(
            deferrable,
            vec![
                QueueReason::StaleData,
                QueueReason::Verification,
                QueueReason::RandomSample
            ]
        );
    }

    #[test]
    fn failure_status_respects_attempt_cap() {
        assert_eq!(status_after_failure(1, 3, true), QueueStatus::Pending);
        assert_eq!(status_after_failure(3, 3, true), QueueStatus::Failed);
        assert_eq!(status_after_failure(1, 3, false), QueueStatus::Failed);
    }

    #[test]
    fn reason_round_trips_through_its_column_text() {
        for reason in QueueReason::ALL {
            assert_eq!(reason.as_str().parse::<QueueReason>(), Ok(reason));
        }
    }
}
