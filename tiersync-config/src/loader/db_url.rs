use std::{
    fs::read_to_string,
    path::{Path, PathBuf},
};

use url::Url;

use super::error::ConfigLoadError;

/// Database settings taken from the environment.
#[derive(Debug, Default, Clone)]
pub struct DatabaseEnv {
    pub database_url: Option<String>,
    pub database_url_file: Option<PathBuf>,
    pub database_host: Option<String>,
    pub database_port: Option<u16>,
    pub database_user: Option<String>,
    pub database_password: Option<String>,
    pub database_name: Option<String>,
}

impl DatabaseEnv {
    pub fn gather() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL").ok(),
            database_url_file: std::env::var("DATABASE_URL_FILE")
                .ok()
                .map(PathBuf::from),
            database_host: std::env::var("DATABASE_HOST").ok(),
            database_port: std::env::var("DATABASE_PORT")
                .ok()
                .and_then(|s| s.parse().ok()),
            database_user: std::env::var("DATABASE_USER").ok(),
            database_password: std::env::var("DATABASE_PASSWORD").ok(),
            database_name: std::env::var("DATABASE_NAME").ok(),
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.clone().filter(|value| !value.trim().is_empty())
}

/// Resolves the PostgreSQL URL: `DATABASE_URL`, then the file named by
/// `DATABASE_URL_FILE`, then a URL assembled from the individual parts.
pub fn resolve_database_url(
    env: &DatabaseEnv,
) -> Result<Option<String>, ConfigLoadError> {
    if let Some(url) = non_empty(&env.database_url) {
        return Ok(Some(url));
    }

    if let Some(path) = env.database_url_file.as_ref()
        && let Some(url) = read_secret_file(path)?
    {
        return Ok(Some(url));
    }

    let (Some(host), Some(user), Some(name)) = (
        non_empty(&env.database_host),
        non_empty(&env.database_user),
        non_empty(&env.database_name),
    ) else {
        return Ok(None);
    };

    let port = env.database_port.unwrap_or(5432);
    let mut url = Url::parse(&format!("postgresql://{host}:{port}/{name}"))
        .map_err(|source| ConfigLoadError::InvalidDatabaseUrl { source })?;
    url.set_username(&user).map_err(|_| {
        ConfigLoadError::InvalidDatabaseUsername {
            username: user.clone(),
        }
    })?;
    if let Some(password) = non_empty(&env.database_password) {
        url.set_password(Some(&password))
            .map_err(|_| ConfigLoadError::InvalidDatabasePassword)?;
    }
    Ok(Some(url.to_string()))
}

pub fn read_secret_file(path: &Path) -> Result<Option<String>, ConfigLoadError> {
    let contents =
        read_to_string(path).map_err(|source| ConfigLoadError::SecretFileIo {
            path: path.to_path_buf(),
            source,
        })?;
    let trimmed = contents.trim();
    if trimmed.is_empty() {
        Ok(None)
    } else {
        Ok(Some(trimmed.to_string()))
    }
}
