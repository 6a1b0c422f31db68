//! # Memory Tier
//!
//! 有容量上限的 LRU 内存层。
//!
//! ## 特性
//!
//! - 按权重淘汰：每个条目的权重由 weigher 计算，默认 1
//! - TTL 以 `ValueHolder::created` 为起点 (expire after write)
//! - 同一个键的并发加载合并为一次 (single-flight)
//! - 命中、未命中、淘汰计数

use std::any::{Any, TypeId};
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::OnceCell;

use crate::types::{MemoryStats, ValueHolder};

/// 条目权重计算
pub type Weigher<K, V> = Arc<dyn Fn(&K, &V) -> u64 + Send + Sync>;

/// 内存层统计
#[derive(Debug, Default)]
struct MemoryMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl MemoryMetrics {
    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }
}

struct Slot<V> {
    holder: Arc<ValueHolder<V>>,
    weight: u64,
}

struct MemoryState<K: Hash + Eq, V> {
    entries: lru::LruCache<K, Slot<V>>,
    total_weight: u64,
}

impl<K: Hash + Eq, V> MemoryState<K, V> {
    fn remove(&mut self, key: &K) -> Option<Slot<V>> {
        let slot = self.entries.pop(key)?;
        self.total_weight = self.total_weight.saturating_sub(slot.weight);
        Some(slot)
    }
}

/// 一次加载的结果，所有等待者共享
type LoadCell<V, E> = OnceCell<Result<Arc<ValueHolder<V>>, E>>;

/// 进行中的加载按 (键, 错误类型) 区分，cell 擦除类型后存放
type LoadingKey<K> = (K, TypeId);

/// 内存层
pub struct MemoryTier<K: Hash + Eq, V> {
    max_weight: u64,
    expire_after_write: Option<Duration>,
    weigher: Option<Weigher<K, V>>,
    state: Mutex<MemoryState<K, V>>,
    /// 进行中的加载
    loading: DashMap<LoadingKey<K>, Arc<dyn Any + Send + Sync>>,
    metrics: MemoryMetrics,
}

impl<K, V> MemoryTier<K, V>
where
    K: Hash + Eq + Clone,
{
    pub fn new(
        max_weight: u64,
        expire_after_write: Option<Duration>,
        weigher: Option<Weigher<K, V>>,
    ) -> Self {
        Self {
            max_weight,
            expire_after_write,
            weigher,
            state: Mutex::new(MemoryState {
                entries: lru::LruCache::unbounded(),
                total_weight: 0,
            }),
            loading: DashMap::new(),
            metrics: MemoryMetrics::default(),
        }
    }

    /// 读取，过期条目会被移除
    pub fn get_if_present(&self, key: &K) -> Option<Arc<ValueHolder<V>>> {
        let mut state = self.state.lock();
        let fresh = match state.entries.get(key) {
            Some(slot) if !self.is_expired(&slot.holder) => Some(Arc::clone(&slot.holder)),
            Some(_) => None,
            None => {
                self.metrics.record_miss();
                return None;
            }
        };

        match fresh {
            Some(holder) => {
                self.metrics.record_hit();
                Some(holder)
            }
            None => {
                state.remove(key);
                self.metrics.record_miss();
                None
            }
        }
    }

    /// 未过期的驻留值（不影响 LRU 顺序与统计）
    fn peek_fresh(&self, key: &K) -> Option<Arc<ValueHolder<V>>> {
        let state = self.state.lock();
        state
            .entries
            .peek(key)
            .filter(|slot| !self.is_expired(&slot.holder))
            .map(|slot| Arc::clone(&slot.holder))
    }

    /// 是否驻留（不影响 LRU 顺序与统计）
    pub fn contains(&self, key: &K) -> bool {
        let state = self.state.lock();
        state
            .entries
            .peek(key)
            .map_or(false, |slot| !self.is_expired(&slot.holder))
    }

    /// 写入，超出权重上限时从最久未使用的一端淘汰
    pub fn put(&self, key: K, holder: Arc<ValueHolder<V>>) {
        let weight = self.weigh(&key, &holder.value);
        let mut state = self.state.lock();

        if let Some(old) = state.entries.put(key, Slot { holder, weight }) {
            state.total_weight = state.total_weight.saturating_sub(old.weight);
        }
        state.total_weight += weight;

        while state.total_weight > self.max_weight {
            match state.entries.pop_lru() {
                Some((_, slot)) => {
                    state.total_weight = state.total_weight.saturating_sub(slot.weight);
                    self.metrics.record_eviction();
                }
                None => break,
            }
        }
    }

    /// 读取；未命中时执行 `init`，同一键的并发调用只执行一次
    ///
    /// 等待者与加载者拿到同一个结果：成功时是同一个值，失败时是同一个
    /// 错误的副本。错误不会缓存，下一次调用重新加载。
    pub async fn get<F, Fut, E>(&self, key: K, init: F) -> Result<Arc<ValueHolder<V>>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<ValueHolder<V>>, E>>,
        V: Send + Sync + 'static,
        E: Clone + Send + Sync + 'static,
    {
        if let Some(holder) = self.get_if_present(&key) {
            return Ok(holder);
        }

        let loading_key = (key.clone(), TypeId::of::<E>());
        let erased = self
            .loading
            .entry(loading_key.clone())
            .or_insert_with(|| Arc::new(LoadCell::<V, E>::new()) as Arc<dyn Any + Send + Sync>)
            .value()
            .clone();
        let cell = Arc::clone(&erased)
            .downcast::<LoadCell<V, E>>()
            .unwrap_or_else(|_| Arc::new(LoadCell::new()));

        let load_key = key;
        let outcome = cell
            .get_or_init(|| async move {
                // 上一轮加载可能在本次未命中之后才结束
                if let Some(holder) = self.peek_fresh(&load_key) {
                    return Ok(holder);
                }
                let holder = init().await?;
                self.put(load_key, Arc::clone(&holder));
                Ok(holder)
            })
            .await
            .clone();

        self.loading
            .remove_if(&loading_key, |_, current| Arc::ptr_eq(current, &erased));

        outcome
    }

    pub fn invalidate(&self, key: &K) {
        self.state.lock().remove(key);
    }

    pub fn invalidate_all(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.total_weight = 0;
    }

    /// 尚未落盘的条目
    pub fn dirty_entries(&self) -> Vec<(K, Arc<ValueHolder<V>>)> {
        let state = self.state.lock();
        state
            .entries
            .iter()
            .filter(|(_, slot)| !slot.holder.is_durable())
            .map(|(key, slot)| (key.clone(), Arc::clone(&slot.holder)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> MemoryStats {
        let (size, weight) = {
            let state = self.state.lock();
            (state.entries.len() as u64, state.total_weight)
        };
        MemoryStats {
            size,
            weight,
            hits: self.metrics.hits.load(Ordering::Relaxed),
            misses: self.metrics.misses.load(Ordering::Relaxed),
            evictions: self.metrics.evictions.load(Ordering::Relaxed),
        }
    }

    fn weigh(&self, key: &K, value: &V) -> u64 {
        match &self.weigher {
            Some(weigher) => weigher(key, value),
            None => 1,
        }
    }

    fn is_expired(&self, holder: &ValueHolder<V>) -> bool {
        holder.is_older_than(self.expire_after_write, Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn holder(value: &str) -> Arc<ValueHolder<String>> {
        Arc::new(ValueHolder::new(value.to_string(), Utc::now()))
    }

    #[test]
    fn test_lru_eviction_by_count() {
        let tier: MemoryTier<String, String> = MemoryTier::new(2, None, None);
        tier.put("a".into(), holder("1"));
        tier.put("b".into(), holder("2"));
        // a 变为最近使用
        assert!(tier.get_if_present(&"a".to_string()).is_some());
        tier.put("c".into(), holder("3"));

        assert!(tier.contains(&"a".to_string()));
        assert!(!tier.contains(&"b".to_string()));
        assert!(tier.contains(&"c".to_string()));
        assert_eq!(tier.stats().evictions, 1);
    }

    #[test]
    fn test_weigher_bounds_total_weight() {
        let weigher: Weigher<String, String> = Arc::new(|_, v| v.len() as u64);
        let tier = MemoryTier::new(10, None, Some(weigher));
        tier.put("a".into(), holder("12345"));
        tier.put("b".into(), holder("12345"));
        assert_eq!(tier.stats().weight, 10);

        tier.put("c".into(), holder("123"));
        let stats = tier.stats();
        assert!(stats.weight <= 10);
        assert!(!tier.contains(&"a".to_string()));
    }

    #[test]
    fn test_replacing_entry_adjusts_weight() {
        let weigher: Weigher<String, String> = Arc::new(|_, v| v.len() as u64);
        let tier = MemoryTier::new(100, None, Some(weigher));
        tier.put("a".into(), holder("1234567890"));
        tier.put("a".into(), holder("12"));
        assert_eq!(tier.stats().weight, 2);
        assert_eq!(tier.len(), 1);
    }

    #[test]
    fn test_expired_entries_are_misses() {
        let tier: MemoryTier<String, String> =
            MemoryTier::new(10, Some(Duration::from_secs(60)), None);
        let old = Arc::new(ValueHolder::new(
            "old".to_string(),
            Utc::now() - chrono::Duration::seconds(120),
        ));
        tier.put("k".into(), old);

        assert!(!tier.contains(&"k".to_string()));
        assert!(tier.get_if_present(&"k".to_string()).is_none());
        assert!(tier.is_empty());
        assert_eq!(tier.stats().misses, 1);
    }

    #[test]
    fn test_dirty_entries() {
        let tier: MemoryTier<String, String> = MemoryTier::new(10, None, None);
        let clean = holder("clean");
        clean.mark_durable();
        tier.put("clean".into(), clean);
        tier.put("dirty".into(), holder("dirty"));

        let dirty = tier.dirty_entries();
        assert_eq!(dirty.len(), 1);
        assert_eq!(dirty[0].0, "dirty");
    }

    #[tokio::test]
    async fn test_concurrent_loads_run_once() {
        let tier: Arc<MemoryTier<String, String>> = Arc::new(MemoryTier::new(10, None, None));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let tier = Arc::clone(&tier);
            let calls = Arc::clone(&calls);
            tasks.push(tokio::spawn(async move {
                tier.get("k".to_string(), || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok::<_, String>(holder("loaded"))
                })
                .await
            }));
        }

        for task in tasks {
            let value = task.await.unwrap().unwrap();
            assert_eq!(value.value, "loaded");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(tier.contains(&"k".to_string()));
    }

    #[tokio::test]
    async fn test_failed_load_is_shared_by_waiters() {
        let tier: Arc<MemoryTier<String, String>> = Arc::new(MemoryTier::new(10, None, None));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let tier = Arc::clone(&tier);
            let calls = Arc::clone(&calls);
            tasks.push(tokio::spawn(async move {
                tier.get("x".to_string(), || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Err::<Arc<ValueHolder<String>>, _>("backend down".to_string())
                })
                .await
            }));
        }

        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap_err(), "backend down");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!tier.contains(&"x".to_string()));
    }

    #[tokio::test]
    async fn test_load_after_completed_load_reuses_value() {
        let tier: MemoryTier<String, String> = MemoryTier::new(10, None, None);
        tier.get("k".to_string(), || async { Ok::<_, String>(holder("first")) })
            .await
            .unwrap();

        let again = tier
            .get("k".to_string(), || async { Ok::<_, String>(holder("second")) })
            .await
            .unwrap();
        assert_eq!(again.value, "first");
    }

    #[tokio::test]
    async fn test_load_errors_propagate_and_are_not_cached() {
        let tier: MemoryTier<String, String> = MemoryTier::new(10, None, None);

        let err = tier
            .get("k".to_string(), || async { Err::<Arc<ValueHolder<String>>, _>("boom") })
            .await
            .unwrap_err();
        assert_eq!(err, "boom");
        assert!(!tier.contains(&"k".to_string()));

        let ok = tier
            .get("k".to_string(), || async { Ok::<_, &str>(holder("v")) })
            .await
            .unwrap();
        assert_eq!(ok.value, "v");
    }
}
