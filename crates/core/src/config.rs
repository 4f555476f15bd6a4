use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::Error as _;
use serde::{Deserialize, Serialize};

use crate::pool::{PoolConfig, RetryPolicy};
use crate::{Error, Result};

pub const SETTINGS_SCHEMA_VERSION: u32 = 1;

pub const CONFIG_DIR_ENV: &str = "SEEDFERRY_CONFIG_DIR";
pub const DATA_DIR_ENV: &str = "SEEDFERRY_DATA_DIR";

const READ_BUFFER_MIN: usize = 4 * 1024;
const READ_BUFFER_MAX: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub version: u32,
    #[serde(default)]
    pub pool: Pool,
    #[serde(default)]
    pub retry: Retry,
    #[serde(default)]
    pub fetch: Fetch,
    #[serde(default)]
    pub store: Store,
    #[serde(default)]
    pub upload: Upload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool {
    pub workers: u32,
    pub per_job: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Retry {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fetch {
    #[serde(default)]
    pub seed_dir: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Store {
    #[serde(default)]
    pub root: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Upload {
    pub read_buffer_bytes: u32,
}

impl Default for Pool {
    fn default() -> Self {
        Self {
            workers: 4,
            per_job: 2,
        }
    }
}

impl Default for Retry {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

impl Default for Upload {
    fn default() -> Self {
        Self {
            read_buffer_bytes: 64 * 1024,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: SETTINGS_SCHEMA_VERSION,
            pool: Pool::default(),
            retry: Retry::default(),
            fetch: Fetch::default(),
            store: Store::default(),
            upload: Upload::default(),
        }
    }
}

impl Settings {
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            workers: self.pool.workers as usize,
            per_job: self.pool.per_job as usize,
            retry: RetryPolicy {
                max_retries: self.retry.max_retries,
                base_delay: Duration::from_millis(self.retry.base_delay_ms),
                max_delay: Duration::from_millis(self.retry.max_delay_ms),
            },
            read_buffer_bytes: self.upload.read_buffer_bytes as usize,
        }
    }

    pub fn seed_dir(&self, data_dir: &Path) -> PathBuf {
        non_empty_path(&self.fetch.seed_dir).unwrap_or_else(|| data_dir.join("seeds"))
    }

    pub fn store_root(&self, data_dir: &Path) -> PathBuf {
        non_empty_path(&self.store.root).unwrap_or_else(|| data_dir.join("store"))
    }
}

fn non_empty_path(raw: &str) -> Option<PathBuf> {
    let raw = raw.trim();
    (!raw.is_empty()).then(|| PathBuf::from(raw))
}

pub fn default_config_dir() -> PathBuf {
    home_dir().join(".config").join("seedferry")
}

pub fn default_data_dir() -> PathBuf {
    home_dir().join(".local").join("share").join("seedferry")
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Resolves a directory from an explicit value, then `env`, then `default`.
pub fn resolve_dir(explicit: Option<PathBuf>, env: &str, default: fn() -> PathBuf) -> PathBuf {
    explicit
        .or_else(|| std::env::var_os(env).map(PathBuf::from))
        .unwrap_or_else(default)
}

pub fn config_path(config_dir: &Path) -> PathBuf {
    config_dir.join("config.toml")
}

pub fn load_settings(config_dir: &Path) -> Result<Settings> {
    let path = config_path(config_dir);
    if !path.exists() {
        return Ok(Settings::default());
    }

    let text = std::fs::read_to_string(&path).map_err(|e| Error::InvalidConfig {
        message: format!("config read failed: {e}"),
    })?;

    parse_settings(&text).map_err(|e| Error::InvalidConfig {
        message: format!("config invalid: {e}"),
    })
}

pub fn parse_settings(text: &str) -> std::result::Result<Settings, toml::de::Error> {
    let raw: toml::Value = toml::from_str(text)?;
    let version = raw
        .get("version")
        .and_then(|v| v.as_integer())
        .and_then(|v| u32::try_from(v).ok());

    match version {
        Some(SETTINGS_SCHEMA_VERSION) => toml::from_str::<Settings>(text),
        Some(other) => Err(toml::de::Error::custom(format!(
            "unsupported settings schema version: {other} (expected {SETTINGS_SCHEMA_VERSION})"
        ))),
        None => Err(toml::de::Error::custom("settings.version is required")),
    }
}

pub fn to_toml(settings: &Settings) -> Result<String> {
    validate_settings(settings)?;
    toml::to_string(settings).map_err(|e| Error::InvalidConfig {
        message: format!("config encode failed: {e}"),
    })
}

pub fn save_settings(config_dir: &Path, settings: &Settings) -> Result<()> {
    let text = to_toml(settings)?;

    let path = config_path(config_dir);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::InvalidConfig {
            message: format!("config dir create failed: {e}"),
        })?;
    }

    atomic_write(&path, text.as_bytes()).map_err(|e| Error::InvalidConfig {
        message: format!("config write failed: {e}"),
    })?;
    Ok(())
}

pub fn validate_settings(settings: &Settings) -> Result<()> {
    if settings.version != SETTINGS_SCHEMA_VERSION {
        return Err(invalid(format!(
            "settings.version must be {SETTINGS_SCHEMA_VERSION} (got {})",
            settings.version
        )));
    }

    if settings.pool.workers < 1 {
        return Err(invalid("pool.workers must be >= 1"));
    }
    if settings.pool.per_job < 1 || settings.pool.per_job > settings.pool.workers {
        return Err(invalid(format!(
            "pool.per_job must satisfy 1 <= per_job <= workers (got {} with workers={})",
            settings.pool.per_job, settings.pool.workers
        )));
    }

    if settings.retry.base_delay_ms < 1 {
        return Err(invalid("retry.base_delay_ms must be >= 1"));
    }
    if settings.retry.max_delay_ms < settings.retry.base_delay_ms {
        return Err(invalid("retry.max_delay_ms must be >= retry.base_delay_ms"));
    }

    let buf = settings.upload.read_buffer_bytes as usize;
    if !(READ_BUFFER_MIN..=READ_BUFFER_MAX).contains(&buf) {
        return Err(invalid(format!(
            "upload.read_buffer_bytes out of bounds (min={READ_BUFFER_MIN}, max={READ_BUFFER_MAX}, got {buf})"
        )));
    }

    Ok(())
}

fn invalid(message: impl Into<String>) -> Error {
    Error::InvalidConfig {
        message: message.into(),
    }
}

fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(tmp, path)?;
    Ok(())
}
