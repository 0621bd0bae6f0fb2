//! Listing lifecycle state machine.
//!
//! ```text
//! active --miss--> active (count + 1)
//! active (count >= threshold) --confirmed absent--> confirmed_removed | sold
//! active (count >= threshold) --confirmed present--> active (count 0)
//! confirmed_removed | sold --re-observed--> relisted (count 0)
//! relisted --full fetch--> active
//! ```
//!
//! Every status change the engine makes goes through [`transition`] and is
//! then written with a compare-and-set on the previous status.

use serde::{Deserialize, Serialize};

use crate::{
    error::{Result, SyncError},
    types::ListingStatus,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum LifecycleEvent {
    /// An active listing was absent from a scan.
    Missed,
    /// The existence probe reported the listing gone.
    ConfirmedAbsent { sold: bool },
    /// The existence probe found the listing; the scan under-covered it.
    ConfirmedPresent,
    /// A manifest scan observed the listing.
    Reobserved,
    /// A queued full fetch succeeded.
    FullFetchCompleted,
}

impl LifecycleEvent {
    pub fn name(self) -> &'static str {
        match self {
            LifecycleEvent::Missed => "missed",
            LifecycleEvent::ConfirmedAbsent { .. } => "confirmed_absent",
            LifecycleEvent::ConfirmedPresent => "confirmed_present",
            LifecycleEvent::Reobserved => "reobserved",
            LifecycleEvent::FullFetchCompleted => "full_fetch_completed",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct LifecycleState {
    pub status: ListingStatus,
    pub missing_count: u32,
}

impl LifecycleState {
    pub fn new(status: ListingStatus, missing_count: u32) -> Self {
        Self {
            status,
            missing_count,
        }
    }

    /// Initial state of a newly materialized listing.
    pub fn materialized() -> Self {
        Self::new(ListingStatus::Active, 0)
    }
}

/// Applies `event` to `state`. `removal_threshold` is the missing count at
/// which an active listing becomes a removal candidate.
pub fn transition(
    state: LifecycleState,
    event: LifecycleEvent,
    removal_threshold: u32,
) -> Result<LifecycleState> {
    use ListingStatus::*;

    let illegal = || SyncError::IllegalTransition {
        from: state.status,
        event: event.name(),
    };

    match (state.status, event) {
        (Active, LifecycleEvent::Missed) => Ok(LifecycleState::new(
            Active,
            state.missing_count.saturating_add(1),
        )),
        (Active, LifecycleEvent::ConfirmedAbsent { sold })
            if state.missing_count >= removal_threshold =>
        {
            let status = if sold { Sold } else { ConfirmedRemoved };
            Ok(LifecycleState::new(status, state.missing_count))
        }
        (Active, LifecycleEvent::ConfirmedPresent)
            if state.missing_count >= removal_threshold =>
        {
            Ok(LifecycleState::new(Active, 0))
        }
        (Active | Relisted, LifecycleEvent::Reobserved) => {
            Ok(LifecycleState::new(state.status, 0))
        }
        (ConfirmedRemoved | Sold, LifecycleEvent::Reobserved) => {
            Ok(LifecycleState::new(Relisted, 0))
        }
        (Active | Relisted, LifecycleEvent::FullFetchCompleted) => {
            Ok(LifecycleState::new(Active, 0))
        }
        // Off-market listings only reopen through a scan re-observation.
        (ConfirmedRemoved | Sold, LifecycleEvent::FullFetchCompleted) => {
            Ok(state)
        }
        _ => Err(illegal()),
    }
}

/// Status a record should carry after a successful full fetch, given its
/// current status (`None` for a listing not yet materialized).
pub fn status_after_full_fetch(current: Option<ListingStatus>) -> ListingStatus {
    match current {
        None => LifecycleState::materialized().status,
        Some(status) => transition(
            LifecycleState::new(status, 0),
            LifecycleEvent::FullFetchCompleted,
            u32::MAX,
        )
        .map(|next| next.status)
        .unwrap_or(status),
    }
}
