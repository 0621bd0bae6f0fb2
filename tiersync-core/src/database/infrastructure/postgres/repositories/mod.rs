pub mod live_records;
pub mod manifest;
pub mod sync_runs;
