//! # Hybrid Cache
//!
//! 内存层 + 磁盘层的组合。
//!
//! ```text
//! get(key)
//!   ├─ 内存命中 ──────────────────────────────► 返回
//!   └─ 未命中 (同一键只有一个加载者)
//!        ├─ Bloom filter 说不在磁盘 ──┐
//!        ├─ 磁盘命中 ─► 装入内存 ──────┼──────► 返回
//!        └─ 磁盘未命中 ───────────────┘
//!             └─ loader ─► 装入内存 ─► 写后队列 ─► 返回
//! ```
//!
//! 写入磁盘永远经由写后队列，调用方不等待磁盘。
//! 存储层的错误不会传到调用方，只有 loader 的错误原样返回。

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;

use super::definition::CacheDefinition;
use super::loader::{CacheLoader, SharedLoadError};
use super::memory::MemoryTier;
use super::write_behind::WriteBehindExecutor;
use crate::storage::{ConnectionOptions, PersistentStore, StoreSettings};
use crate::types::{DiskStats, MemoryStats, PruneSummary, ValueHolder};

/// 类型擦除后的缓存句柄，供注册表与调度器统一管理
#[async_trait]
pub trait PersistentCache: Send + Sync {
    fn name(&self) -> &str;

    fn stats(&self) -> MemoryStats;

    async fn disk_stats(&self) -> DiskStats;

    async fn invalidate_all(&self);

    /// 打开磁盘层（建表、构建 Bloom filter）
    async fn start(&self);

    /// 回收磁盘空间，在写后队列上执行
    async fn prune(&self) -> Option<PruneSummary>;

    /// 落盘未持久化的条目并关闭磁盘层
    async fn stop(&self);
}

/// 内存 + 磁盘两级缓存
pub struct HybridCache<K, V>
where
    K: Hash + Eq,
{
    name: String,
    memory: Arc<MemoryTier<K, V>>,
    store: Arc<PersistentStore<K, V>>,
    executor: Arc<WriteBehindExecutor>,
    loader: Option<Arc<dyn CacheLoader<K, V>>>,
    refresh_after_write: Option<Duration>,
    max_invalidated: usize,
    /// 正在后台重载的键
    refreshing: Arc<DashMap<K, ()>>,
}

impl<K, V> std::fmt::Debug for HybridCache<K, V>
where
    K: Hash + Eq,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HybridCache")
            .field("name", &self.name)
            .field("store", &self.store)
            .field("refresh_after_write", &self.refresh_after_write)
            .field("max_invalidated", &self.max_invalidated)
            .finish_non_exhaustive()
    }
}

impl<K, V> HybridCache<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(
        def: CacheDefinition<K, V>,
        directory: &Path,
        options: ConnectionOptions,
        executor: Arc<WriteBehindExecutor>,
        max_invalidated: usize,
    ) -> Self {
        let memory = Arc::new(MemoryTier::new(
            def.memory_limit,
            def.expire_after_write,
            def.weigher,
        ));
        let store = Arc::new(PersistentStore::new(
            directory,
            StoreSettings {
                name: def.name.clone(),
                version: def.version,
                disk_limit: def.disk_limit,
                expire_after_write: def.expire_after_write,
                bloom_filter: true,
            },
            def.key_codec,
            def.value_serializer,
            options,
        ));

        Self {
            name: def.name,
            memory,
            store,
            executor,
            loader: def.loader,
            refresh_after_write: def.refresh_after_write,
            max_invalidated,
            refreshing: Arc::new(DashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 读取，不触发加载
    pub async fn get_if_present(&self, key: &K) -> Option<V> {
        if let Some(holder) = self.memory.get_if_present(key) {
            return Some(holder.value.clone());
        }

        let holder = Arc::new(self.load_from_disk(key).await?);
        let value = holder.value.clone();
        self.memory.put(key.clone(), holder);
        Some(value)
    }

    /// 读取；未命中时依次查磁盘、调用 `loader`
    ///
    /// 同一键的并发调用只执行一次加载；加载失败时每个等待者都拿到
    /// 同一个错误的副本。
    pub async fn get<F, Fut, E>(&self, key: K, loader: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
        E: Clone + Send + Sync + 'static,
    {
        let key_ref = &key;
        let holder = self
            .memory
            .get(key.clone(), || async move {
                if let Some(found) = self.load_from_disk(key_ref).await {
                    return Ok(Arc::new(found));
                }
                let value = loader().await?;
                let holder = Arc::new(ValueHolder::new(value, Utc::now()));
                self.write_behind(key_ref.clone(), Arc::clone(&holder)).await;
                Ok::<_, E>(holder)
            })
            .await?;
        Ok(holder.value.clone())
    }

    /// 使用定义中绑定的加载器读取
    ///
    /// 命中的值超过 refresh-after-write 时仍然返回当前值，同时在后台重载一次。
    pub async fn get_loaded(&self, key: K) -> anyhow::Result<V> {
        let loader = match &self.loader {
            Some(loader) => Arc::clone(loader),
            None => anyhow::bail!("cache {} has no loader", self.name),
        };

        let key_ref = &key;
        let loader_ref = &loader;
        let holder = self
            .memory
            .get(key.clone(), || async move {
                if let Some(found) = self.load_from_disk(key_ref).await {
                    return Ok(Arc::new(found));
                }
                let value = loader_ref
                    .load(key_ref)
                    .await
                    .map_err(SharedLoadError::new)?;
                let holder = Arc::new(ValueHolder::new(value, Utc::now()));
                self.write_behind(key_ref.clone(), Arc::clone(&holder)).await;
                Ok::<_, SharedLoadError>(holder)
            })
            .await?;

        if self.needs_refresh(&holder) {
            self.spawn_refresh(key, loader);
        }
        Ok(holder.value.clone())
    }

    /// 批量读取，任一键加载失败即返回错误
    pub async fn get_all<I>(&self, keys: I) -> anyhow::Result<HashMap<K, V>>
    where
        I: IntoIterator<Item = K>,
    {
        let mut result = HashMap::new();
        for key in keys {
            let value = self.get_loaded(key.clone()).await?;
            result.insert(key, value);
        }
        Ok(result)
    }

    /// 写入内存，磁盘写入进入写后队列
    pub async fn put(&self, key: K, value: V) {
        let holder = Arc::new(ValueHolder::new(value, Utc::now()));
        self.memory.put(key.clone(), Arc::clone(&holder));
        self.write_behind(key, holder).await;
    }

    /// 立即移出内存；磁盘删除进入写后队列，且仅在键可能存在时执行
    pub async fn invalidate(&self, key: K) {
        self.memory.invalidate(&key);

        let store = Arc::clone(&self.store);
        self.executor
            .submit(move || {
                if store.might_contain(&key) {
                    store.invalidate(&key);
                }
            })
            .await;
    }

    /// 批量失效；数量超过 `h2MaxInvalidated` 时整个缓存清空
    pub async fn invalidate_many<I>(&self, keys: I)
    where
        I: IntoIterator<Item = K>,
    {
        let keys: Vec<K> = keys.into_iter().collect();
        if keys.len() > self.max_invalidated {
            tracing::info!(
                "Invalidating {} keys of cache {} exceeds h2MaxInvalidated ({}), clearing it",
                keys.len(),
                self.name,
                self.max_invalidated
            );
            self.invalidate_all().await;
            return;
        }

        for key in &keys {
            self.memory.invalidate(key);
        }

        let store = Arc::clone(&self.store);
        self.executor
            .submit(move || {
                for key in &keys {
                    if store.might_contain(key) {
                        store.invalidate(key);
                    }
                }
            })
            .await;
    }

    /// 清空两级缓存，磁盘部分立即执行
    ///
    /// 此前已排队但尚未执行的写入不会再落盘。
    pub async fn invalidate_all(&self) {
        let store = Arc::clone(&self.store);
        if let Err(e) = tokio::task::spawn_blocking(move || store.invalidate_all()).await {
            tracing::warn!("Cannot invalidate cache {}: {}", self.name, e);
        }
        self.memory.invalidate_all();
    }

    /// 等待已提交的磁盘操作完成
    pub async fn flush(&self) -> bool {
        self.executor.flush().await
    }

    pub fn stats(&self) -> MemoryStats {
        self.memory.stats()
    }

    pub async fn disk_stats(&self) -> DiskStats {
        let store = Arc::clone(&self.store);
        match tokio::task::spawn_blocking(move || store.disk_stats()).await {
            Ok(stats) => stats,
            Err(e) => {
                tracing::warn!("Cannot get DiskStats for {}: {}", self.name, e);
                DiskStats::default()
            }
        }
    }

    /// 内存中的条目数
    pub fn size(&self) -> usize {
        self.memory.len()
    }

    async fn load_from_disk(&self, key: &K) -> Option<ValueHolder<V>> {
        let store = Arc::clone(&self.store);
        let key = key.clone();
        let lookup = tokio::task::spawn_blocking(move || {
            if store.might_contain(&key) {
                store.get_if_present(&key)
            } else {
                None
            }
        });

        match lookup.await {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!("Disk lookup for cache {} failed: {}", self.name, e);
                None
            }
        }
    }

    async fn write_behind(&self, key: K, holder: Arc<ValueHolder<V>>) {
        let store = Arc::clone(&self.store);
        let generation = store.generation();
        let submitted = self
            .executor
            .submit(move || store.put_if_current(&key, &holder, generation))
            .await;
        if !submitted {
            tracing::debug!("Write-behind closed, {} entry kept in memory only", self.name);
        }
    }

    fn needs_refresh(&self, holder: &ValueHolder<V>) -> bool {
        match self.refresh_after_write {
            Some(threshold) => holder.age(Utc::now()) > threshold,
            None => false,
        }
    }

    fn spawn_refresh(&self, key: K, loader: Arc<dyn CacheLoader<K, V>>) {
        if self.refreshing.insert(key.clone(), ()).is_some() {
            return;
        }

        let name = self.name.clone();
        let memory = Arc::clone(&self.memory);
        let store = Arc::clone(&self.store);
        let executor = Arc::clone(&self.executor);
        let refreshing = Arc::clone(&self.refreshing);

        tokio::spawn(async move {
            let generation = store.generation();
            match loader.load(&key).await {
                Ok(_) if store.generation() != generation => {
                    tracing::debug!("Cache {} was cleared during reload, dropping value", name);
                }
                Ok(value) => {
                    let holder = Arc::new(ValueHolder::new(value, Utc::now()));
                    memory.put(key.clone(), Arc::clone(&holder));
                    let write_key = key.clone();
                    executor
                        .submit(move || store.put_if_current(&write_key, &holder, generation))
                        .await;
                    tracing::debug!("Reloaded entry of cache {}", name);
                }
                Err(e) => {
                    tracing::warn!("Unable to reload cache value for {}: {:#}", name, e);
                }
            }
            refreshing.remove(&key);
        });
    }
}

#[async_trait]
impl<K, V> PersistentCache for HybridCache<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn stats(&self) -> MemoryStats {
        self.memory.stats()
    }

    async fn disk_stats(&self) -> DiskStats {
        HybridCache::disk_stats(self).await
    }

    async fn invalidate_all(&self) {
        HybridCache::invalidate_all(self).await
    }

    async fn start(&self) {
        let store = Arc::clone(&self.store);
        match tokio::task::spawn_blocking(move || store.open()).await {
            Ok(()) => tracing::debug!("Opened cache {}", self.name),
            Err(e) => tracing::warn!("Cannot open cache {}: {}", self.name, e),
        }
    }

    async fn prune(&self) -> Option<PruneSummary> {
        let store = Arc::clone(&self.store);
        let memory = Arc::clone(&self.memory);
        self.executor
            .run(move || store.prune(&|key: &K| memory.contains(key)))
            .await
    }

    async fn stop(&self) {
        let dirty = self.memory.dirty_entries();
        let store = Arc::clone(&self.store);
        let name = self.name.clone();

        let flushed = tokio::task::spawn_blocking(move || {
            for (key, holder) in &dirty {
                store.put(key, holder);
            }
            store.close();
            dirty.len()
        })
        .await;

        match flushed {
            Ok(0) => tracing::debug!("Closed cache {}", name),
            Ok(count) => tracing::debug!("Flushed {} entries and closed cache {}", count, name),
            Err(e) => tracing::warn!("Cannot stop cache {}: {}", name, e),
        }
    }
}
