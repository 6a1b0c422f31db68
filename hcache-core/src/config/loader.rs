//! # Configuration Loader
//!
//! Loads and merges configuration from multiple sources:
//! 1. Default values (lowest priority)
//! 2. Configuration file (middle priority)
//! 3. Environment variables (highest priority)

use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::units::{parse_duration, parse_size, parse_time_of_day};
use super::{CacheSettings, Config};
use crate::error::{CacheError, Result};

/// Configuration loader with support for file and environment variable overrides
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    /// Path to configuration file
    config_path: PathBuf,

    /// Environment variable prefix
    env_prefix: String,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self {
            config_path: Self::default_config_path(),
            env_prefix: "HCACHE".to_string(),
        }
    }
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a config loader with a specific config file path
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: path.into(),
            env_prefix: "HCACHE".to_string(),
        }
    }

    /// Override the environment variable prefix
    pub fn env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    fn default_config_path() -> PathBuf {
        if let Ok(config_path) = env::var("HCACHE_CONFIG") {
            return PathBuf::from(config_path);
        }

        let possible_paths = [
            PathBuf::from("hcache.toml"),
            dirs::config_dir()
                .map(|d| d.join("hcache").join("config.toml"))
                .unwrap_or_else(|| PathBuf::from("/etc/hcache/config.toml")),
            PathBuf::from("/etc/hcache/config.toml"),
        ];

        for path in &possible_paths {
            if path.exists() {
                return path.clone();
            }
        }

        possible_paths[0].clone()
    }

    /// Load configuration with full hierarchy
    pub fn load(&self) -> Result<Config> {
        let mut config = Config::default();

        if self.config_path.exists() {
            let content = std::fs::read_to_string(&self.config_path).map_err(|e| {
                CacheError::configuration(format!(
                    "Failed to read config file '{}': {}",
                    self.config_path.display(),
                    e
                ))
            })?;
            let file = parse_file(&content).map_err(|e| {
                CacheError::configuration(format!(
                    "Failed to parse config file '{}': {}",
                    self.config_path.display(),
                    e
                ))
            })?;
            config = merge_file_config(config, file)?;
        } else {
            tracing::debug!(
                "Config file {} not found, using defaults",
                self.config_path.display()
            );
        }

        config = self.merge_env_config(config)?;

        config.validate()?;
        Ok(config)
    }

    /// 只解析给定的 TOML 文本，不读取环境变量
    pub fn from_toml_str(content: &str) -> Result<Config> {
        let file = parse_file(content)?;
        let config = merge_file_config(Config::default(), file)?;
        config.validate()?;
        Ok(config)
    }

    fn merge_env_config(&self, mut config: Config) -> Result<Config> {
        let prefix = &self.env_prefix;

        if let Ok(val) = env::var(format!("{}_CACHE_DIRECTORY", prefix)) {
            config.directory = PathBuf::from(val);
        }
        if let Ok(val) = env::var(format!("{}_H2_CACHE_SIZE", prefix)) {
            let kib = val.trim().parse::<u64>().map_err(|_| {
                CacheError::configuration(format!("{}_H2_CACHE_SIZE: invalid number {:?}", prefix, val))
            })?;
            config.h2_cache_size = Some(kib);
        }
        if let Ok(val) = env::var(format!("{}_PRUNE_ON_STARTUP", prefix)) {
            config.pruning.prune_on_startup = parse_bool(&val, "PRUNE_ON_STARTUP")?;
        }

        Ok(config)
    }
}

fn parse_file(content: &str) -> Result<FileConfig> {
    toml::from_str(content).map_err(|e| CacheError::configuration(e.to_string()))
}

fn merge_file_config(mut base: Config, file: FileConfig) -> Result<Config> {
    if let Some(cache) = file.cache {
        if let Some(dir) = cache.directory {
            base.directory = dir;
        }
        if let Some(kib) = cache.h2_cache_size {
            base.h2_cache_size = Some(kib);
        }
        if let Some(auto_server) = cache.h2_auto_server {
            base.h2_auto_server = auto_server;
        }
        if let Some(max) = cache.h2_max_invalidated {
            base.h2_max_invalidated = max;
        }
        if let Some(capacity) = cache.write_behind_queue {
            base.write_behind_queue = capacity;
        }
        if let Some(grace) = cache.shutdown_grace_period {
            base.shutdown_grace_period = grace.duration()?;
        }

        for (name, entry) in cache.caches {
            let ttl = match (entry.max_age, entry.expire_after_write) {
                (Some(age), _) => Some(age.duration()?),
                (None, Some(ttl)) => Some(ttl.duration()?),
                (None, None) => None,
            };
            let settings = CacheSettings {
                memory_limit: entry.memory_limit,
                expire_after_write: ttl,
                refresh_after_write: entry
                    .refresh_after_write
                    .map(|v| v.duration())
                    .transpose()?,
                disk_limit: entry.disk_limit.map(|v| v.bytes()).transpose()?,
                version: entry.version,
            };
            base.caches.insert(name, settings);
        }
    }

    if let Some(pruning) = file.cache_pruning {
        if let Some(on_startup) = pruning.prune_on_startup {
            base.pruning.prune_on_startup = on_startup;
        }
        if let Some(delay) = pruning.startup_delay {
            base.pruning.startup_delay = delay.duration()?;
        }
        if let Some(interval) = pruning.interval {
            base.pruning.interval = interval.duration()?;
        }
        if let Some(start) = pruning.start_time {
            base.pruning.start_time = Some(parse_time_of_day(&start)?);
        }
    }

    Ok(base)
}

fn parse_bool(val: &str, name: &str) -> Result<bool> {
    match val.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(CacheError::configuration(format!(
            "Invalid boolean for {}: {:?}",
            name, val
        ))),
    }
}

// File configuration structures (with Option fields for merging)

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    cache: Option<FileCacheSection>,
    #[serde(rename = "cachePruning")]
    cache_pruning: Option<FilePruningSection>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileCacheSection {
    directory: Option<PathBuf>,
    h2_cache_size: Option<u64>,
    h2_auto_server: Option<bool>,
    h2_max_invalidated: Option<usize>,
    write_behind_queue: Option<usize>,
    shutdown_grace_period: Option<DurationValue>,
    #[serde(default)]
    caches: BTreeMap<String, FileCacheEntry>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileCacheEntry {
    memory_limit: Option<u64>,
    max_age: Option<DurationValue>,
    expire_after_write: Option<DurationValue>,
    refresh_after_write: Option<DurationValue>,
    disk_limit: Option<SizeValue>,
    version: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FilePruningSection {
    prune_on_startup: Option<bool>,
    startup_delay: Option<DurationValue>,
    interval: Option<DurationValue>,
    start_time: Option<String>,
}

/// 整数按秒计，字符串带单位
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DurationValue {
    Seconds(u64),
    Text(String),
}

impl DurationValue {
    fn duration(&self) -> Result<std::time::Duration> {
        match self {
            DurationValue::Seconds(secs) => Ok(std::time::Duration::from_secs(*secs)),
            DurationValue::Text(text) => parse_duration(text),
        }
    }
}

/// 整数按字节计，字符串带单位
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SizeValue {
    Bytes(u64),
    Text(String),
}

impl SizeValue {
    fn bytes(&self) -> Result<u64> {
        match self {
            SizeValue::Bytes(bytes) => Ok(*bytes),
            SizeValue::Text(text) => parse_size(text),
        }
    }
}
