use std::{
    env, fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tiersync_core::{http::HttpFetchConfig, sync::SyncConfig};

use crate::loader::error::ConfigLoadError;

pub const CONFIG_PATH_VAR: &str = "TIERSYNC_CONFIG_PATH";
pub const CONFIG_JSON_VAR: &str = "TIERSYNC_CONFIG_JSON";

const DEFAULT_CANDIDATES: &[&str] = &[
    "tiersync.toml",
    "tiersync.json",
    "config/tiersync.toml",
    "config/tiersync.json",
];

/// Source that produced the engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum EngineConfigSource {
    #[default]
    Default,
    /// Path given on the command line.
    Explicit(PathBuf),
    EnvPath(PathBuf),
    EnvInline,
    File(PathBuf),
}

impl std::fmt::Display for EngineConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineConfigSource::Default => f.write_str("built-in defaults"),
            EngineConfigSource::Explicit(path) => write!(f, "{}", path.display()),
            EngineConfigSource::EnvPath(path) => {
                write!(f, "{} ({CONFIG_PATH_VAR})", path.display())
            }
            EngineConfigSource::EnvInline => f.write_str(CONFIG_JSON_VAR),
            EngineConfigSource::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Everything the engine and its HTTP fetchers need. Keys missing from a
/// file keep their defaults.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    pub sync: SyncConfig,
    pub http: HttpFetchConfig,
}

/// The environment inputs [`EngineConfig::resolve`] looks at.
#[derive(Debug, Clone, Default)]
pub struct EngineConfigEnv {
    pub config_path: Option<PathBuf>,
    pub config_json: Option<String>,
}

impl EngineConfigEnv {
    pub fn gather() -> Self {
        Self {
            config_path: env::var(CONFIG_PATH_VAR)
                .ok()
                .filter(|value| !value.trim().is_empty())
                .map(PathBuf::from),
            config_json: env::var(CONFIG_JSON_VAR)
                .ok()
                .filter(|value| !value.trim().is_empty()),
        }
    }
}

impl EngineConfig {
    /// Evaluation order:
    /// 1) `$TIERSYNC_CONFIG_PATH` (TOML or JSON file),
    /// 2) `$TIERSYNC_CONFIG_JSON` (inline JSON),
    /// 3) the first default file found in the working directory,
    /// 4) defaults.
    pub fn load_from_env()
    -> Result<(Self, EngineConfigSource), ConfigLoadError> {
        Self::resolve(&EngineConfigEnv::gather(), Path::new("."))
    }

    /// Same order as [`Self::load_from_env`], with default files looked up
    /// under `root`.
    pub fn resolve(
        env: &EngineConfigEnv,
        root: &Path,
    ) -> Result<(Self, EngineConfigSource), ConfigLoadError> {
        if let Some(path) = &env.config_path {
            let config = Self::load_from_file(path)?;
            return Ok((config, EngineConfigSource::EnvPath(path.clone())));
        }

        if let Some(raw) = &env.config_json {
            let config = Self::parse_json(raw, CONFIG_JSON_VAR)?;
            return Ok((config, EngineConfigSource::EnvInline));
        }

        if let Some(path) = Self::find_default_file(root) {
            let config = Self::load_from_file(&path)?;
            return Ok((config, EngineConfigSource::File(path)));
        }

        Ok((Self::default(), EngineConfigSource::Default))
    }

    pub fn load_from_file(path: &Path) -> Result<Self, ConfigLoadError> {
        if !path.exists() {
            return Err(ConfigLoadError::MissingConfig {
                path: path.to_path_buf(),
            });
        }
        let contents =
            fs::read_to_string(path).map_err(|source| ConfigLoadError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        let origin = path.display().to_string();

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::parse_json(&contents, &origin),
            Some("toml") => toml::from_str(&contents).map_err(|err| {
                ConfigLoadError::Parse {
                    origin,
                    message: err.to_string(),
                }
            }),
            _ => Self::parse_from_str(&contents, &origin),
        }
    }

    pub fn parse_from_str(
        contents: &str,
        origin: &str,
    ) -> Result<Self, ConfigLoadError> {
        // Try TOML first, then JSON.
        toml::from_str(contents).or_else(|toml_err| {
            serde_json::from_str(contents).map_err(|json_err| {
                ConfigLoadError::Parse {
                    origin: origin.to_string(),
                    message: format!(
                        "toml error: {toml_err}; json error: {json_err}"
                    ),
                }
            })
        })
    }

    pub fn parse_json(raw: &str, origin: &str) -> Result<Self, ConfigLoadError> {
        serde_json::from_str(raw).map_err(|err| ConfigLoadError::Parse {
            origin: origin.to_string(),
            message: err.to_string(),
        })
    }

    fn find_default_file(root: &Path) -> Option<PathBuf> {
        DEFAULT_CANDIDATES
            .iter()
            .map(|candidate| root.join(candidate))
            .find(|path| path.exists())
    }
}

#[cfg(test)]
mod tests {
    use tiersync_core::types::Tier;

    use super::*;

    #[test]
    fn partial_toml_overrides_only_named_keys() {
        let config = EngineConfig::parse_from_str(
            r#"
            [sync.queue]
            max_pending = 250

            [http]
            timeout_secs = 5
            "#,
            "inline",
        )
        .unwrap();

        assert_eq!(config.sync.queue.max_pending, 250);
        assert_eq!(config.sync.queue.max_attempts, 3);
        assert_eq!(config.http.timeout_secs, 5);
        assert_eq!(config.sync.tiers.len(), 4);
    }

    #[test]
    fn json_is_accepted_when_toml_fails() {
        let config = EngineConfig::parse_from_str(
            r#"{"sync": {"diff": {"min_coverage_percent": 60}}}"#,
            "inline",
        )
        .unwrap();
        assert_eq!(config.sync.diff.min_coverage_percent, 60);
    }

    #[test]
    fn garbage_reports_both_parsers() {
        let err = EngineConfig::parse_from_str("{{ nope", "inline").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("inline"));
        assert!(matches!(err, ConfigLoadError::Parse { .. }));
    }

    #[test]
    fn env_path_beats_inline_json_and_default_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("tiersync.toml"),
            "[sync]\nmax_page_error_percent = 20\n",
        )
        .unwrap();
        let explicit = dir.path().join("custom.json");
        fs::write(&explicit, r#"{"sync": {"max_page_error_percent": 30}}"#).unwrap();

        let env = EngineConfigEnv {
            config_path: Some(explicit.clone()),
            config_json: Some(r#"{"sync": {"max_page_error_percent": 40}}"#.into()),
        };
        let (config, source) = EngineConfig::resolve(&env, dir.path()).unwrap();
        assert_eq!(config.sync.max_page_error_percent, 30);
        assert_eq!(source, EngineConfigSource::EnvPath(explicit));

        let env = EngineConfigEnv {
            config_path: None,
            config_json: Some(r#"{"sync": {"max_page_error_percent": 40}}"#.into()),
        };
        let (config, source) = EngineConfig::resolve(&env, dir.path()).unwrap();
        assert_eq!(config.sync.max_page_error_percent, 40);
        assert_eq!(source, EngineConfigSource::EnvInline);

        let (config, source) =
            EngineConfig::resolve(&EngineConfigEnv::default(), dir.path()).unwrap();
        assert_eq!(config.sync.max_page_error_percent, 20);
        assert_eq!(
            source,
            EngineConfigSource::File(dir.path().join("tiersync.toml"))
        );
    }

    #[test]
    fn defaults_when_nothing_is_configured() {
        let dir = tempfile::tempdir().unwrap();
        let (config, source) =
            EngineConfig::resolve(&EngineConfigEnv::default(), dir.path()).unwrap();
        assert_eq!(source, EngineConfigSource::Default);
        assert_eq!(
            config.sync.tier(Tier::WeeklyDeep).unwrap().frequency_hours,
            168
        );
    }

    #[test]
    fn missing_env_path_is_an_error() {
        let env = EngineConfigEnv {
            config_path: Some(PathBuf::from("/nonexistent/tiersync.toml")),
            config_json: None,
        };
        assert!(matches!(
            EngineConfig::resolve(&env, Path::new(".")),
            Err(ConfigLoadError::MissingConfig { .. })
        ));
    }
}
