pub mod db_url;
pub mod error;

use std::path::PathBuf;

use tracing::{debug, info};

use crate::engine::{EngineConfig, EngineConfigEnv, EngineConfigSource};
use db_url::{DatabaseEnv, resolve_database_url};
use error::ConfigLoadError;

#[derive(Debug, Default, Clone)]
pub struct ConfigLoaderOptions {
    pub config_path: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
}

/// Resolved configuration plus where it came from.
#[derive(Debug, Clone)]
pub struct ConfigLoad {
    pub engine: EngineConfig,
    pub source: EngineConfigSource,
    pub database_url: Option<String>,
    pub env_file_loaded: bool,
}

#[derive(Debug, Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ConfigLoaderOptions) -> Self {
        Self { options }
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.env_file = Some(path.into());
        self
    }

    /// Loads the env file, resolves the engine configuration and the
    /// database url, then validates the result.
    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let env_file_loaded = match &self.options.env_file {
            Some(path) => dotenvy::from_path(path).map(|_| true).or_else(
                |err| match err {
                    dotenvy::Error::Io(_) => Ok(false),
                    _ => Err(err),
                },
            )?,
            None => {
                dotenvy::dotenv().map(|_| true).or_else(|err| match err {
                    dotenvy::Error::Io(_) => Ok(false),
                    _ => Err(err),
                })?
            }
        };

        let (engine, source) = match &self.options.config_path {
            Some(path) => (
                EngineConfig::load_from_file(path)?,
                EngineConfigSource::Explicit(path.clone()),
            ),
            None => EngineConfig::resolve(
                &EngineConfigEnv::gather(),
                std::path::Path::new("."),
            )?,
        };
        engine.sync.validate()?;

        let database_url = resolve_database_url(&DatabaseEnv::gather())?;

        info!(
            target: "tiersync::config",
            source = %source,
            env_file_loaded,
            "Configuration loaded"
        );
        debug!(
            target: "tiersync::config",
            sources = engine.sync.sources.sources.len(),
            tiers = engine.sync.tiers.len(),
            database_url_set = database_url.is_some(),
            "Resolved engine settings"
        );

        Ok(ConfigLoad {
            engine,
            source,
            database_url,
            env_file_loaded,
        })
    }
}
