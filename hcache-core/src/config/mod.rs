//! # hcache Configuration
//!
//! ## Configuration Hierarchy
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         Environment Variables           │
//! │    HCACHE_CACHE_DIRECTORY=/var/cache    │
//! ├─────────────────────────────────────────┤
//! │         Config File (hcache.toml)       │
//! │    [cache]                              │
//! │    directory = "/var/cache/app"         │
//! ├─────────────────────────────────────────┤
//! │         Default Values                  │
//! └─────────────────────────────────────────┘
//! ```
//!
//! 单个缓存的覆盖项放在 `[cache.caches.<name>]`，注册时合并到代码中的定义上。

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::NaiveTime;

use crate::cache::definition::validate_name;
use crate::cache::write_behind::DEFAULT_QUEUE_CAPACITY;
use crate::error::{CacheError, Result};
use crate::storage::ConnectionOptions;

mod loader;
mod units;

pub use loader::ConfigLoader;
pub use units::{parse_duration, parse_size, parse_time_of_day};

/// 默认批量失效上限
pub const DEFAULT_MAX_INVALIDATED: usize = 5000;

/// 默认关闭宽限期
pub const DEFAULT_SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(30);

/// 全局配置
#[derive(Debug, Clone)]
pub struct Config {
    /// 缓存文件目录
    pub directory: PathBuf,
    /// SQLite 页缓存 (KiB)
    pub h2_cache_size: Option<u64>,
    /// 允许其他进程同时打开缓存文件
    pub h2_auto_server: bool,
    /// 批量失效超过该数量时改为清空整个缓存
    pub h2_max_invalidated: usize,
    /// 写后队列容量
    pub write_behind_queue: usize,
    /// 关闭时等待写后队列排空的时间
    pub shutdown_grace_period: Duration,
    /// 按缓存名的覆盖项
    pub caches: BTreeMap<String, CacheSettings>,
    /// 定时回收
    pub pruning: PruningConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            directory: default_directory(),
            h2_cache_size: None,
            h2_auto_server: false,
            h2_max_invalidated: DEFAULT_MAX_INVALIDATED,
            write_behind_queue: DEFAULT_QUEUE_CAPACITY,
            shutdown_grace_period: DEFAULT_SHUTDOWN_GRACE_PERIOD,
            caches: BTreeMap::new(),
            pruning: PruningConfig::default(),
        }
    }
}

impl Config {
    pub fn with_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.directory = directory.into();
        self
    }

    pub fn with_write_behind_queue(mut self, capacity: usize) -> Self {
        self.write_behind_queue = capacity;
        self
    }

    pub fn with_shutdown_grace_period(mut self, grace: Duration) -> Self {
        self.shutdown_grace_period = grace;
        self
    }

    pub fn with_max_invalidated(mut self, max: usize) -> Self {
        self.h2_max_invalidated = max;
        self
    }

    pub fn with_cache(mut self, name: impl Into<String>, settings: CacheSettings) -> Self {
        self.caches.insert(name.into(), settings);
        self
    }

    pub fn with_pruning(mut self, pruning: PruningConfig) -> Self {
        self.pruning = pruning;
        self
    }

    /// 测试用：不在启动时 prune，关闭宽限期较短
    pub fn for_testing(directory: impl Into<PathBuf>) -> Self {
        Self::default()
            .with_directory(directory)
            .with_shutdown_grace_period(Duration::from_secs(5))
            .with_pruning(PruningConfig::disabled_on_startup())
    }

    pub fn settings_for(&self, name: &str) -> Option<&CacheSettings> {
        self.caches.get(name)
    }

    /// 每个数据库句柄的连接参数
    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            cache_size_kib: self.h2_cache_size,
            auto_server: self.h2_auto_server,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.directory.as_os_str().is_empty() {
            return Err(CacheError::configuration("cache.directory must be set"));
        }
        if self.write_behind_queue == 0 {
            return Err(CacheError::configuration(
                "cache.writeBehindQueue must be > 0",
            ));
        }
        if self.h2_max_invalidated == 0 {
            return Err(CacheError::configuration(
                "cache.h2MaxInvalidated must be > 0",
            ));
        }
        if self.pruning.interval.is_zero() {
            return Err(CacheError::configuration(
                "cachePruning.interval must be > 0",
            ));
        }
        for (name, settings) in &self.caches {
            validate_name(name)?;
            if settings.memory_limit == Some(0) {
                return Err(CacheError::configuration(format!(
                    "cache.caches.{}.memoryLimit must be > 0",
                    name
                )));
            }
        }
        Ok(())
    }
}

/// 单个缓存的覆盖项，`None` 表示沿用代码中的定义
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheSettings {
    pub memory_limit: Option<u64>,
    pub expire_after_write: Option<Duration>,
    pub refresh_after_write: Option<Duration>,
    pub disk_limit: Option<u64>,
    pub version: Option<u32>,
}

/// 定时回收配置
#[derive(Debug, Clone, PartialEq)]
pub struct PruningConfig {
    /// 启动后执行一次
    pub prune_on_startup: bool,
    /// 启动回收前的延迟
    pub startup_delay: Duration,
    /// 周期
    pub interval: Duration,
    /// 首次周期执行对齐到的 UTC 时刻，`None` 表示启动后一个周期
    pub start_time: Option<NaiveTime>,
}

impl Default for PruningConfig {
    fn default() -> Self {
        Self {
            prune_on_startup: true,
            startup_delay: Duration::from_secs(60),
            interval: Duration::from_secs(24 * 3600),
            start_time: NaiveTime::from_hms_opt(1, 0, 0),
        }
    }
}

impl PruningConfig {
    pub fn disabled_on_startup() -> Self {
        Self {
            prune_on_startup: false,
            ..Default::default()
        }
    }
}

fn default_directory() -> PathBuf {
    dirs::cache_dir()
        .map(|d| d.join("hcache"))
        .unwrap_or_else(|| PathBuf::from(".hcache"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.h2_max_invalidated, DEFAULT_MAX_INVALIDATED);
        assert_eq!(config.write_behind_queue, DEFAULT_QUEUE_CAPACITY);
        assert_eq!(
            config.pruning.start_time,
            NaiveTime::from_hms_opt(1, 0, 0)
        );
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(Config::default().with_write_behind_queue(0).validate().is_err());
        assert!(Config::default().with_max_invalidated(0).validate().is_err());

        let config = Config::default().with_cache(
            "diff",
            CacheSettings {
                memory_limit: Some(0),
                ..Default::default()
            },
        );
        assert!(config.validate().is_err());

        let config = Config::default().with_cache("bad name", CacheSettings::default());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_connection_options() {
        let mut config = Config::default();
        config.h2_cache_size = Some(16384);
        config.h2_auto_server = true;
        let options = config.connection_options();
        assert_eq!(options.cache_size_kib, Some(16384));
        assert!(options.auto_server);
    }
}
