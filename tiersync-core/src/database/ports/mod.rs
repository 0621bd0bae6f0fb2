//! Repository ports (interfaces) consumed by the sync engine. Every mutating
//! method is a single atomic step in the backing store.

pub mod live_records;
pub mod manifest;
pub mod sync_runs;
