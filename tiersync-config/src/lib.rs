//! Configuration loading for tiersync.
//!
//! Engine settings come from a TOML or JSON file (or inline JSON in the
//! environment); the database url comes from `DATABASE_URL`, a secret file,
//! or its individual parts.

pub mod engine;
pub mod loader;

pub use engine::{EngineConfig, EngineConfigEnv, EngineConfigSource};
pub use loader::{
    ConfigLoad, ConfigLoader, ConfigLoaderOptions, db_url::resolve_database_url,
    error::ConfigLoadError,
};
