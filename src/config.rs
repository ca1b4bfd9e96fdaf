use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::download::DEFAULT_WORKERS;
use crate::error::OneError;
use crate::fs_util::{self, LockSettings};
use crate::sync::Mode;

pub const CONFIG_FILE: &str = "one.json";

/// On-disk shape of `one.json`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub data_server: Option<String>,
    #[serde(default)]
    pub object_store_url: Option<String>,
    #[serde(default)]
    pub cache_dir: Option<Utf8PathBuf>,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub cache_expiry_secs: Option<u64>,
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub lock_timeout_secs: Option<u64>,
    #[serde(default)]
    pub lock_stale_secs: Option<u64>,
    #[serde(default)]
    pub record_loaded: Option<bool>,
}

impl Config {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            data_server: None,
            object_store_url: None,
            cache_dir: None,
            mode: None,
            cache_expiry_secs: None,
            workers: None,
            tag: None,
            lock_timeout_secs: None,
            lock_stale_secs: None,
            record_loaded: None,
        }
    }
}

/// Values taken from the environment, applied over the file.
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    pub base_url: Option<String>,
    pub cache_dir: Option<String>,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        let read = |name: &str| {
            std::env::var(name)
                .ok()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        Self {
            base_url: read("ONE_BASE_URL"),
            cache_dir: read("ONE_CACHE_DIR"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub base_url: String,
    pub data_server: String,
    pub object_store_url: Option<String>,
    pub cache_dir: Utf8PathBuf,
    pub mode: Mode,
    pub cache_expiry: Duration,
    pub workers: usize,
    pub tag: Option<String>,
    pub lock: LockSettings,
    pub record_loaded: bool,
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Reads the parameter file from `path`, `ONE_CONFIG`, or the user config dir.
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, OneError> {
        let explicit = path
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("ONE_CONFIG").map(PathBuf::from));
        let config_path = match &explicit {
            Some(path) => path.clone(),
            None => Self::default_path()?.into_std_path_buf(),
        };

        if explicit.is_none() && !config_path.exists() {
            return Err(OneError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| OneError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| OneError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config, EnvOverrides::from_env())
    }

    pub fn resolve_config(
        config: Config,
        overrides: EnvOverrides,
    ) -> Result<ResolvedConfig, OneError> {
        let base_url = overrides
            .base_url
            .unwrap_or(config.base_url)
            .trim()
            .trim_end_matches('/')
            .to_string();
        if base_url.is_empty() {
            return Err(OneError::Configuration(
                "base_url is not set; run `one setup`".to_string(),
            ));
        }

        let cache_dir = match overrides.cache_dir.map(Utf8PathBuf::from).or(config.cache_dir) {
            Some(dir) => dir,
            None => default_cache_dir()?,
        };
        let mode = config
            .mode
            .as_deref()
            .map(str::parse::<Mode>)
            .transpose()?
            .unwrap_or_default();
        let workers = config.workers.unwrap_or(DEFAULT_WORKERS);
        if workers == 0 {
            return Err(OneError::Configuration(
                "workers must be at least 1".to_string(),
            ));
        }
        let defaults = LockSettings::default();
        let lock = LockSettings {
            timeout: config
                .lock_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            stale_after: config
                .lock_stale_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.stale_after),
            ..defaults
        };

        Ok(ResolvedConfig {
            data_server: config
                .data_server
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or_else(|| base_url.clone()),
            base_url,
            object_store_url: config.object_store_url,
            cache_dir,
            mode,
            cache_expiry: Duration::from_secs(config.cache_expiry_secs.unwrap_or(24 * 60 * 60)),
            workers,
            tag: config.tag.filter(|tag| !tag.trim().is_empty()),
            lock,
            record_loaded: config.record_loaded.unwrap_or(false),
        })
    }

    pub fn default_path() -> Result<Utf8PathBuf, OneError> {
        BaseDirs::new()
            .and_then(|dirs| {
                Utf8PathBuf::from_path_buf(dirs.config_dir().join("one").join(CONFIG_FILE)).ok()
            })
            .ok_or_else(|| {
                OneError::Configuration("unable to resolve config directory".to_string())
            })
    }

    /// Writes a parameter file, as done by `one setup`.
    pub fn write(path: &Utf8Path, config: &Config) -> Result<(), OneError> {
        let content = serde_json::to_vec_pretty(config)
            .map_err(|err| OneError::ConfigParse(err.to_string()))?;
        fs_util::write_atomic(path, &content)
    }
}

pub fn default_cache_dir() -> Result<Utf8PathBuf, OneError> {
    BaseDirs::new()
        .and_then(|dirs| Utf8PathBuf::from_path_buf(dirs.cache_dir().join("one")).ok())
        .ok_or_else(|| OneError::Configuration("unable to resolve cache directory".to_string()))
}
