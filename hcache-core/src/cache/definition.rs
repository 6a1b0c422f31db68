//! # Cache Definition
//!
//! 一个持久化缓存的全部静态描述：名字、键值编解码、容量、过期策略、
//! 版本号与可选的加载器。
//!
//! ## 示例
//!
//! ```rust,no_run
//! use hcache_core::cache::CacheDefinition;
//! use hcache_core::codec::{KeyCodec, StringSerializer};
//! use std::time::Duration;
//!
//! # fn example() -> hcache_core::Result<()> {
//! let def = CacheDefinition::<String, String>::builder("accounts")
//!     .key_codec(KeyCodec::string())
//!     .value_serializer(StringSerializer)
//!     .memory_limit(4096)
//!     .disk_limit(64 * 1024 * 1024)
//!     .expire_after_write(Duration::from_secs(3600))
//!     .version(2)
//!     .build()?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use super::loader::CacheLoader;
use super::memory::Weigher;
use crate::codec::{CacheSerializer, KeyCodec};
use crate::config::CacheSettings;
use crate::error::{CacheError, Result};

/// 默认内存上限（条目权重之和）
pub const DEFAULT_MEMORY_LIMIT: u64 = 1024;

/// 默认磁盘上限 128 MiB
pub const DEFAULT_DISK_LIMIT: u64 = 128 * 1024 * 1024;

/// 缓存名最大长度
pub const MAX_NAME_LEN: usize = 64;

/// 缓存定义
pub struct CacheDefinition<K, V> {
    pub(crate) name: String,
    pub(crate) key_codec: KeyCodec<K>,
    pub(crate) value_serializer: Arc<dyn CacheSerializer<V>>,
    pub(crate) memory_limit: u64,
    pub(crate) weigher: Option<Weigher<K, V>>,
    pub(crate) disk_limit: u64,
    pub(crate) expire_after_write: Option<Duration>,
    pub(crate) refresh_after_write: Option<Duration>,
    pub(crate) version: u32,
    pub(crate) loader: Option<Arc<dyn CacheLoader<K, V>>>,
}

impl<K, V> CacheDefinition<K, V> {
    pub fn builder(name: impl Into<String>) -> CacheDefinitionBuilder<K, V> {
        CacheDefinitionBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn memory_limit(&self) -> u64 {
        self.memory_limit
    }

    pub fn disk_limit(&self) -> u64 {
        self.disk_limit
    }

    pub fn expire_after_write(&self) -> Option<Duration> {
        self.expire_after_write
    }

    pub fn refresh_after_write(&self) -> Option<Duration> {
        self.refresh_after_write
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn has_loader(&self) -> bool {
        self.loader.is_some()
    }

    /// 用配置文件中的 `[cache.caches.<name>]` 覆盖代码里的默认值
    pub fn with_overrides(mut self, settings: &CacheSettings) -> Result<Self> {
        if let Some(limit) = settings.memory_limit {
            self.memory_limit = limit;
        }
        if let Some(limit) = settings.disk_limit {
            self.disk_limit = limit;
        }
        if let Some(ttl) = settings.expire_after_write {
            self.expire_after_write = Some(ttl);
        }
        if let Some(refresh) = settings.refresh_after_write {
            self.refresh_after_write = Some(refresh);
        }
        if let Some(version) = settings.version {
            self.version = version;
        }
        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> Result<()> {
        validate_name(&self.name)?;

        if self.memory_limit == 0 {
            return Err(CacheError::configuration(format!(
                "cache {}: memoryLimit must be > 0",
                self.name
            )));
        }
        if self.expire_after_write == Some(Duration::ZERO) {
            return Err(CacheError::configuration(format!(
                "cache {}: maxAge must be > 0",
                self.name
            )));
        }
        if self.refresh_after_write == Some(Duration::ZERO) {
            return Err(CacheError::configuration(format!(
                "cache {}: refreshAfterWrite must be > 0",
                self.name
            )));
        }
        if let (Some(refresh), Some(ttl)) = (self.refresh_after_write, self.expire_after_write) {
            if refresh >= ttl {
                return Err(CacheError::configuration(format!(
                    "cache {}: refreshAfterWrite ({:?}) must be shorter than maxAge ({:?})",
                    self.name, refresh, ttl
                )));
            }
        }
        Ok(())
    }
}

/// 名字只能包含字母、数字、`_` 与 `-`，它同时是文件名与表名
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(CacheError::configuration(format!(
            "cache name must be 1..={} characters: {:?}",
            MAX_NAME_LEN, name
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(CacheError::configuration(format!(
            "cache name may only contain [A-Za-z0-9_-]: {:?}",
            name
        )));
    }
    Ok(())
}

/// 缓存定义构建器
pub struct CacheDefinitionBuilder<K, V> {
    name: String,
    key_codec: Option<KeyCodec<K>>,
    value_serializer: Option<Arc<dyn CacheSerializer<V>>>,
    memory_limit: u64,
    weigher: Option<Weigher<K, V>>,
    disk_limit: u64,
    expire_after_write: Option<Duration>,
    refresh_after_write: Option<Duration>,
    version: u32,
    loader: Option<Arc<dyn CacheLoader<K, V>>>,
}

impl<K, V> CacheDefinitionBuilder<K, V> {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key_codec: None,
            value_serializer: None,
            memory_limit: DEFAULT_MEMORY_LIMIT,
            weigher: None,
            disk_limit: DEFAULT_DISK_LIMIT,
            expire_after_write: None,
            refresh_after_write: None,
            version: 0,
            loader: None,
        }
    }

    pub fn key_codec(mut self, codec: KeyCodec<K>) -> Self {
        self.key_codec = Some(codec);
        self
    }

    pub fn value_serializer<S>(mut self, serializer: S) -> Self
    where
        S: CacheSerializer<V> + 'static,
    {
        self.value_serializer = Some(Arc::new(serializer));
        self
    }

    pub fn memory_limit(mut self, limit: u64) -> Self {
        self.memory_limit = limit;
        self
    }

    /// 条目权重，默认每个条目为 1
    pub fn weigher<F>(mut self, weigher: F) -> Self
    where
        F: Fn(&K, &V) -> u64 + Send + Sync + 'static,
    {
        self.weigher = Some(Arc::new(weigher));
        self
    }

    pub fn disk_limit(mut self, limit: u64) -> Self {
        self.disk_limit = limit;
        self
    }

    pub fn expire_after_write(mut self, ttl: Duration) -> Self {
        self.expire_after_write = Some(ttl);
        self
    }

    pub fn refresh_after_write(mut self, refresh: Duration) -> Self {
        self.refresh_after_write = Some(refresh);
        self
    }

    /// 值格式变更时递增，旧版本的表会在 prune 时删除
    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn loader<L>(mut self, loader: L) -> Self
    where
        L: CacheLoader<K, V> + 'static,
    {
        self.loader = Some(Arc::new(loader));
        self
    }

    pub fn build(self) -> Result<CacheDefinition<K, V>> {
        let key_codec = self.key_codec.ok_or_else(|| {
            CacheError::configuration(format!("cache {}: no key codec", self.name))
        })?;
        let value_serializer = self.value_serializer.ok_or_else(|| {
            CacheError::configuration(format!("cache {}: no value serializer", self.name))
        })?;

        let def = CacheDefinition {
            name: self.name,
            key_codec,
            value_serializer,
            memory_limit: self.memory_limit,
            weigher: self.weigher,
            disk_limit: self.disk_limit,
            expire_after_write: self.expire_after_write,
            refresh_after_write: self.refresh_after_write,
            version: self.version,
            loader: self.loader,
        };
        def.validate()?;
        Ok(def)
    }
}
