//! # Cache Registry
//!
//! 应用持有的缓存注册表：创建缓存、统一启动与关闭、驱动定时回收。
//!
//! ```text
//! CacheRegistry
//! ├── WriteBehindExecutor (共享，单 worker)
//! ├── PruningScheduler
//! └── caches: name → HybridCache<K, V>
//! ```
//!
//! ## 生命周期
//!
//! ```rust,no_run
//! use hcache_core::{CacheDefinition, CacheRegistry, Config, KeyCodec, StringSerializer};
//!
//! # async fn example() -> hcache_core::Result<()> {
//! let registry = CacheRegistry::new(Config::default())?;
//! let accounts = registry
//!     .register(
//!         CacheDefinition::<String, String>::builder("accounts")
//!             .key_codec(KeyCodec::string())
//!             .value_serializer(StringSerializer)
//!             .build()?,
//!     )
//!     .await?;
//! registry.start().await;
//!
//! accounts.put("alice".to_string(), "Alice".to_string()).await;
//!
//! registry.stop().await;
//! # Ok(())
//! # }
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::cache::{CacheDefinition, HybridCache, PersistentCache, WriteBehindExecutor};
use crate::config::Config;
use crate::error::{CacheError, Result};
use crate::scheduler::PruningScheduler;
use crate::types::{DiskStats, PruneSummary};

struct RegisteredCache {
    erased: Arc<dyn PersistentCache>,
    typed: Arc<dyn Any + Send + Sync>,
}

type CacheMap = Arc<RwLock<HashMap<String, RegisteredCache>>>;

/// 缓存注册表
pub struct CacheRegistry {
    config: Config,
    executor: Arc<WriteBehindExecutor>,
    caches: CacheMap,
    pruning: Mutex<Option<PruningScheduler>>,
    started: AtomicBool,
}

impl CacheRegistry {
    /// 校验配置并启动写后执行器，必须在 tokio runtime 内调用
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let executor = WriteBehindExecutor::start(config.write_behind_queue);

        info!(
            "Cache registry created at {} (write-behind queue {})",
            config.directory.display(),
            config.write_behind_queue
        );

        Ok(Self {
            config,
            executor,
            caches: Arc::new(RwLock::new(HashMap::new())),
            pruning: Mutex::new(None),
            started: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn executor(&self) -> &Arc<WriteBehindExecutor> {
        &self.executor
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// 注册缓存
    ///
    /// 先合并配置文件中同名的覆盖项；名字重复时返回 `AlreadyExists`。
    /// 注册表已启动时立即打开磁盘层。
    pub async fn register<K, V>(&self, def: CacheDefinition<K, V>) -> Result<Arc<HybridCache<K, V>>>
    where
        K: Hash + Eq + Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        if self.executor.is_closed() {
            return Err(CacheError::closed("cache registry has been stopped"));
        }

        let def = match self.config.settings_for(def.name()) {
            Some(settings) => def.with_overrides(settings)?,
            None => def,
        };
        let name = def.name().to_string();

        if self.caches.read().contains_key(&name) {
            return Err(CacheError::already_exists(format!("cache {}", name)));
        }

        std::fs::create_dir_all(&self.config.directory)?;

        let cache = Arc::new(HybridCache::new(
            def,
            &self.config.directory,
            self.config.connection_options(),
            Arc::clone(&self.executor),
            self.config.h2_max_invalidated,
        ));

        {
            let mut caches = self.caches.write();
            if caches.contains_key(&name) {
                return Err(CacheError::already_exists(format!("cache {}", name)));
            }
            caches.insert(
                name.clone(),
                RegisteredCache {
                    erased: cache.clone() as Arc<dyn PersistentCache>,
                    typed: cache.clone() as Arc<dyn Any + Send + Sync>,
                },
            );
        }

        if self.is_started() {
            cache.start().await;
        }

        debug!("Registered cache {}", name);
        Ok(cache)
    }

    /// 注销并关闭缓存，返回它此前是否存在
    pub async fn unregister(&self, name: &str) -> bool {
        let removed = self.caches.write().remove(name);
        match removed {
            Some(entry) => {
                // 让已排队的写入先落盘
                self.executor.flush().await;
                entry.erased.stop().await;
                debug!("Unregistered cache {}", name);
                true
            }
            None => false,
        }
    }

    /// 取得类型化的缓存句柄；名字不存在或类型不符时返回 `None`
    pub fn cache<K, V>(&self, name: &str) -> Option<Arc<HybridCache<K, V>>>
    where
        K: Hash + Eq + Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        let typed = self.caches.read().get(name).map(|c| Arc::clone(&c.typed))?;
        typed.downcast::<HybridCache<K, V>>().ok()
    }

    /// 所有缓存的类型擦除句柄，按名字排序
    pub fn caches(&self) -> Vec<Arc<dyn PersistentCache>> {
        snapshot(&self.caches)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.caches.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// 打开所有磁盘层并启动定时回收
    pub async fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let caches = self.caches();
        for cache in &caches {
            cache.start().await;
        }

        let source = Arc::clone(&self.caches);
        let scheduler =
            PruningScheduler::start(self.config.pruning.clone(), move || snapshot(&source));
        *self.pruning.lock() = Some(scheduler);

        info!("Cache registry started with {} caches", caches.len());
    }

    /// 立即回收所有缓存
    pub async fn prune_all(&self) -> Vec<(String, Option<PruneSummary>)> {
        let mut results = Vec::new();
        for cache in self.caches() {
            let summary = cache.prune().await;
            results.push((cache.name().to_string(), summary));
        }
        results
    }

    pub async fn disk_stats(&self) -> Vec<(String, DiskStats)> {
        let mut results = Vec::new();
        for cache in self.caches() {
            let stats = cache.disk_stats().await;
            results.push((cache.name().to_string(), stats));
        }
        results
    }

    /// 等待写后队列中已提交的任务完成
    pub async fn flush(&self) -> bool {
        self.executor.flush().await
    }

    /// 关闭：取消回收，在宽限期内排空写后队列，落盘未持久化条目，关闭磁盘层
    ///
    /// 关闭后注册表不能再次启动。
    pub async fn stop(&self) {
        let scheduler = self.pruning.lock().take();
        if let Some(mut scheduler) = scheduler {
            scheduler.stop();
        }

        let grace = self.config.shutdown_grace_period;
        if !self.executor.shutdown(grace).await {
            warn!("Write-behind queue abandoned after {:?}", grace);
        }

        let caches = self.caches();
        for cache in &caches {
            cache.stop().await;
        }

        self.started.store(false, Ordering::SeqCst);
        info!("Cache registry stopped ({} caches)", caches.len());
    }
}

fn snapshot(caches: &CacheMap) -> Vec<Arc<dyn PersistentCache>> {
    let guard = caches.read();
    let mut entries: Vec<(&String, &RegisteredCache)> = guard.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    entries
        .into_iter()
        .map(|(_, entry)| Arc::clone(&entry.erased))
        .collect()
}
