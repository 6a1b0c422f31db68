//! 数据库句柄池
//!
//! 每个持久化缓存一个池，复用已打开的 [`SqlHandle`]。
//!
//! ## 行为
//!
//! - `acquire` 从不等待：有空闲句柄就复用，否则新开一个
//! - 守卫 drop 时归还；空闲数达到容量时直接关闭
//! - 使用中出错的句柄调用 [`PooledHandle::discard`] 丢弃，不回池
//! - 容量为 `min(CPU 核数, 16)`

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::connection::{ConnectionOptions, SqlHandle};
use crate::error::{CacheError, Result};

/// 池容量上限
pub const MAX_POOL_SIZE: usize = 16;

/// 数据库句柄池
pub struct ConnectionPool {
    /// 数据库文件路径
    path: PathBuf,
    /// 连接参数
    options: ConnectionOptions,
    /// 最大空闲句柄数
    capacity: usize,
    /// 空闲句柄
    available: Mutex<VecDeque<SqlHandle>>,
    /// 累计打开的句柄数
    opened: AtomicU64,
    /// 是否已关闭
    closed: AtomicBool,
}

impl ConnectionPool {
    pub fn new(path: PathBuf, options: ConnectionOptions) -> Arc<Self> {
        Self::with_capacity(path, options, Self::default_capacity())
    }

    pub fn with_capacity(path: PathBuf, options: ConnectionOptions, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            path,
            options,
            capacity: capacity.max(1),
            available: Mutex::new(VecDeque::new()),
            opened: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    pub fn default_capacity() -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(MAX_POOL_SIZE)
    }

    /// 获取句柄
    ///
    /// 池已关闭时返回 `CacheError::Closed`。
    pub fn acquire(self: &Arc<Self>) -> Result<PooledHandle> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CacheError::closed(format!(
                "pool for {} is closed",
                self.path.display()
            )));
        }

        let reused = self.available.lock().pop_front();
        let handle = match reused {
            Some(handle) => handle,
            None => {
                let handle = SqlHandle::open(&self.path, &self.options)?;
                self.opened.fetch_add(1, Ordering::Relaxed);
                handle
            }
        };

        Ok(PooledHandle {
            pool: Arc::clone(self),
            handle: Some(handle),
        })
    }

    /// 归还句柄
    fn release(&self, handle: SqlHandle) {
        if self.closed.load(Ordering::Acquire) {
            handle.close();
            return;
        }

        let mut available = self.available.lock();
        if available.len() < self.capacity {
            available.push_back(handle);
        } else {
            drop(available);
            handle.close();
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 当前空闲句柄数
    pub fn idle_count(&self) -> usize {
        self.available.lock().len()
    }

    /// 累计打开的句柄数
    pub fn opened_count(&self) -> u64 {
        self.opened.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// 关闭池
    ///
    /// 关闭所有空闲句柄；使用中的句柄在归还时关闭。
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let drained: Vec<SqlHandle> = self.available.lock().drain(..).collect();
        for handle in drained {
            handle.close();
        }

        tracing::debug!("ConnectionPool closed: {}", self.path.display());
    }
}

/// 池句柄守卫
///
/// drop 时自动归还。
pub struct PooledHandle {
    pool: Arc<ConnectionPool>,
    handle: Option<SqlHandle>,
}

impl PooledHandle {
    /// 丢弃句柄（出错后调用），不归还到池中
    pub fn discard(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.close();
        }
    }
}

impl Drop for PooledHandle {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.pool.release(handle);
        }
    }
}

impl std::ops::Deref for PooledHandle {
    type Target = rusqlite::Connection;

    fn deref(&self) -> &Self::Target {
        // handle 只在 discard / drop 中被取走
        match &self.handle {
            Some(handle) => handle.conn(),
            None => unreachable!("pooled handle used after release"),
        }
    }
}
