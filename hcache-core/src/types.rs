//! 共享类型：值容器与统计快照

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// 缓存值容器
///
/// `durable` 为 `true` 表示该值已经写入磁盘，后续的持久化请求可以跳过。
/// 内存层与写后队列共享同一个 `Arc<ValueHolder<V>>`，所以标记对两边同时可见。
#[derive(Debug)]
pub struct ValueHolder<V> {
    pub value: V,
    pub created: DateTime<Utc>,
    durable: AtomicBool,
}

impl<V> ValueHolder<V> {
    /// 新值，尚未落盘
    pub fn new(value: V, created: DateTime<Utc>) -> Self {
        Self {
            value,
            created,
            durable: AtomicBool::new(false),
        }
    }

    /// 从磁盘读出的值
    pub fn durable(value: V, created: DateTime<Utc>) -> Self {
        Self {
            value,
            created,
            durable: AtomicBool::new(true),
        }
    }

    pub fn is_durable(&self) -> bool {
        self.durable.load(Ordering::Acquire)
    }

    pub fn mark_durable(&self) {
        self.durable.store(true, Ordering::Release);
    }

    /// 自创建以来经过的时间，创建时间在未来时为零
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created).to_std().unwrap_or(Duration::ZERO)
    }

    /// 是否超过 `ttl`
    pub fn is_older_than(&self, ttl: Option<Duration>, now: DateTime<Utc>) -> bool {
        ttl.map_or(false, |ttl| self.age(now) > ttl)
    }
}

/// 内存层统计快照
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MemoryStats {
    pub size: u64,
    pub weight: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl MemoryStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}

/// 磁盘层统计快照
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DiskStats {
    /// 行数
    pub size: u64,
    /// `SUM(space)`，即键与值的字节数之和
    pub space: u64,
    pub hits: u64,
    pub misses: u64,
}

/// 单次 prune 的结果
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PruneSummary {
    /// 删除的行数
    pub deleted: u64,
    /// 因仍在内存中而被续期的行数
    pub touched: u64,
    /// 删除的旧版本表
    pub dropped_tables: Vec<String>,
    /// prune 后的 `SUM(space)`
    pub remaining_space: u64,
}
