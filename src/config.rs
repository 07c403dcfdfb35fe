use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::app::{FailurePolicy, RetrievalOptions, RetrievalRequest};
use crate::domain::{BoundingBox, DateRange, VariableSelection, parse_date};
use crate::error::GpmError;
use crate::granule::RetryPolicy;

pub const CONFIG_FILE: &str = "gpmdap.json";
pub const CREDENTIALS_FILE: &str = ".earthdata_credentials";
pub const USERNAME_ENV: &str = "EARTHDATA_USERNAME";
pub const PASSWORD_ENV: &str = "EARTHDATA_PASSWORD";

#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub mission: Option<String>,
    pub product: String,
    #[serde(default)]
    pub version: Option<u32>,
    pub variables: VariableSelection,
    pub start_date: String,
    pub end_date: String,
    #[serde(default)]
    pub bbox: Option<BoundingBox>,
    #[serde(default)]
    pub cache_dir: Option<String>,
    #[serde(default)]
    pub registry: Option<String>,
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub listing_concurrency: Option<usize>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub retry_delay_secs: Option<u64>,
    #[serde(default)]
    pub deadline_secs: Option<u64>,
    #[serde(default)]
    pub failure_policy: Option<FailurePolicy>,
    #[serde(default)]
    pub cache_full_product: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub request: RetrievalRequest,
    pub options: RetrievalOptions,
    pub cache_dir: Option<Utf8PathBuf>,
    pub registry: Option<PathBuf>,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, GpmError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Err(GpmError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| GpmError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| GpmError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, GpmError> {
        let schema_version = config.schema_version.unwrap_or(1);
        let dates = DateRange::new(
            parse_date(&config.start_date)?,
            parse_date(&config.end_date)?,
        )?;
        let bbox = config.bbox.unwrap_or_else(BoundingBox::global);
        bbox.validate()?;

        let defaults = RetrievalOptions::default();
        let retry = RetryPolicy {
            max_attempts: config.max_attempts.unwrap_or(defaults.retry.max_attempts),
            delay: config
                .retry_delay_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.retry.delay),
        };
        let options = RetrievalOptions {
            concurrency: config.concurrency.unwrap_or(defaults.concurrency),
            listing_concurrency: config
                .listing_concurrency
                .unwrap_or(defaults.listing_concurrency),
            retry,
            deadline: config.deadline_secs.map(Duration::from_secs),
            failure_policy: config.failure_policy.unwrap_or(defaults.failure_policy),
            cache_full_product: config
                .cache_full_product
                .unwrap_or(defaults.cache_full_product),
        };

        Ok(ResolvedConfig {
            schema_version,
            request: RetrievalRequest {
                mission: config.mission.unwrap_or_else(|| "gpm".to_string()),
                product: config.product,
                version: config.version,
                variables: config.variables,
                dates,
                bbox,
            },
            options,
            cache_dir: config.cache_dir.map(Utf8PathBuf::from),
            registry: config.registry.map(PathBuf::from),
        })
    }
}

#[derive(Clone, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

impl Credentials {
    pub fn load(path: Option<&Path>) -> Result<Self, GpmError> {
        if let (Ok(username), Ok(password)) = (env::var(USERNAME_ENV), env::var(PASSWORD_ENV)) {
            if !username.is_empty() {
                return Ok(Self { username, password });
            }
        }
        let path = path.unwrap_or(Path::new(CREDENTIALS_FILE));
        Self::from_file(path)
    }

    pub fn from_file(path: &Path) -> Result<Self, GpmError> {
        let content =
            fs::read_to_string(path).map_err(|_| GpmError::ConfigRead(path.to_path_buf()))?;
        let credentials: Credentials = serde_json::from_str(&content)
            .map_err(|err| GpmError::ConfigParse(format!("{}: {err}", path.display())))?;
        if credentials.username.trim().is_empty() {
            return Err(GpmError::ConfigParse(format!(
                "{}: empty username",
                path.display()
            )));
        }
        Ok(credentials)
    }
}
