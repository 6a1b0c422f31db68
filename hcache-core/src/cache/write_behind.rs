//! # Write-Behind Executor
//!
//! 单 worker 的有界队列，所有缓存共享。磁盘写入、单键删除与 prune
//! 都在这里按提交顺序执行，调用方不等待磁盘。
//!
//! ## 功能
//!
//! - FIFO：任务按提交顺序在阻塞线程上逐个执行
//! - 背压：队列满时 `submit` 等待空位
//! - `flush` 屏障：等待此前提交的任务全部完成
//! - 有期限的关闭：超时后放弃剩余任务

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// 默认队列容量
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// 写后执行器
pub struct WriteBehindExecutor {
    capacity: usize,
    tx: Mutex<Option<mpsc::Sender<Job>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl WriteBehindExecutor {
    /// 启动 worker，必须在 tokio runtime 内调用
    pub fn start(capacity: usize) -> Arc<Self> {
        let capacity = capacity.max(1);
        let (tx, mut rx) = mpsc::channel::<Job>(capacity);

        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                if let Err(e) = tokio::task::spawn_blocking(job).await {
                    tracing::error!("Write-behind task failed: {}", e);
                }
            }
            tracing::debug!("Write-behind worker stopped");
        });

        Arc::new(Self {
            capacity,
            tx: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
        })
    }

    /// 提交任务
    ///
    /// 执行器已关闭时返回 `false`，任务被丢弃。
    pub async fn submit<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let tx = match self.tx.lock().clone() {
            Some(tx) => tx,
            None => {
                tracing::debug!("Write-behind executor is closed, dropping task");
                return false;
            }
        };
        tx.send(Box::new(job)).await.is_ok()
    }

    /// 提交任务并等待其结果
    pub async fn run<F, T>(&self, job: F) -> Option<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        let submitted = self
            .submit(move || {
                let _ = result_tx.send(job());
            })
            .await;
        if !submitted {
            return None;
        }
        result_rx.await.ok()
    }

    /// 等待此前提交的任务全部完成
    pub async fn flush(&self) -> bool {
        self.run(|| ()).await.is_some()
    }

    /// 排队中的任务数
    pub fn pending(&self) -> usize {
        match self.tx.lock().as_ref() {
            Some(tx) => self.capacity - tx.capacity(),
            None => 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.tx.lock().is_none()
    }

    /// 停止接收新任务，并在 `grace` 内等待队列排空
    ///
    /// 排空返回 `true`；超时后剩余任务被放弃。
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.tx.lock().take();

        let handle = match self.handle.lock().take() {
            Some(handle) => handle,
            None => return true,
        };
        let abort = handle.abort_handle();

        match tokio::time::timeout(grace, handle).await {
            Ok(_) => true,
            Err(_) => {
                tracing::warn!(
                    "Write-behind queue not drained within {:?}, abandoning remaining tasks",
                    grace
                );
                abort.abort();
                false
            }
        }
    }
}

impl Drop for WriteBehindExecutor {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.get_mut().take() {
            handle.abort();
        }
    }
}
