//! 磁盘回收调度
//!
//! ```text
//! start ──(startupDelay)──► prune all ──► ... ──(startTime)──► prune all ──(interval)──► ...
//! ```
//!
//! 每轮对当前注册的所有缓存调用 `prune()`，回收本身在写后队列上执行。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::cache::PersistentCache;
use crate::config::PruningConfig;

/// 定时回收任务句柄，drop 或 `stop()` 时立即取消
pub struct PruningScheduler {
    handle: Option<JoinHandle<()>>,
}

impl PruningScheduler {
    /// 启动调度；`source` 在每轮执行时给出当前的缓存列表
    pub fn start<F>(config: PruningConfig, source: F) -> Self
    where
        F: Fn() -> Vec<Arc<dyn PersistentCache>> + Send + Sync + 'static,
    {
        let first = initial_delay(&config, Utc::now());
        info!(
            "Cache pruning scheduled every {:?}, first periodic run in {:?}",
            config.interval, first
        );

        let handle = tokio::spawn(async move {
            if config.prune_on_startup {
                tokio::time::sleep(config.startup_delay).await;
                prune_all(&source()).await;
            }

            let start = Instant::now() + first.saturating_sub(startup_elapsed(&config));
            let mut ticker = tokio::time::interval_at(start, config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                prune_all(&source()).await;
            }
        });

        Self {
            handle: Some(handle),
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().map_or(false, |h| !h.is_finished())
    }

    /// 取消调度；正在执行的回收作业已在写后队列中，不受影响
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            debug!("Cache pruning cancelled");
        }
    }
}

impl Drop for PruningScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

/// 依次回收每个缓存
pub async fn prune_all(caches: &[Arc<dyn PersistentCache>]) {
    for cache in caches {
        match cache.prune().await {
            Some(summary) => info!(
                "Pruned cache {}: {} deleted, {} touched, {} bytes remaining",
                cache.name(),
                summary.deleted,
                summary.touched,
                summary.remaining_space
            ),
            None => debug!("Prune of cache {} skipped, executor closed", cache.name()),
        }
    }
}

/// 距离首次周期执行的时间
///
/// 配置了 `start_time` 时对齐到下一个该 UTC 时刻，否则为一个周期。
pub fn initial_delay(config: &PruningConfig, now: DateTime<Utc>) -> Duration {
    let Some(start_time) = config.start_time else {
        return config.interval;
    };

    let mut next = Utc.from_utc_datetime(&now.date_naive().and_time(start_time));
    if next <= now {
        next += chrono::Duration::days(1);
    }
    (next - now).to_std().unwrap_or(config.interval)
}

// 启动回收已经等待的时间，周期对齐从调度启动时算起
fn startup_elapsed(config: &PruningConfig) -> Duration {
    if config.prune_on_startup {
        config.startup_delay
    } else {
        Duration::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DiskStats, MemoryStats, PruneSummary};
    use async_trait::async_trait;
    use chrono::NaiveTime;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, h, m, 0).unwrap()
    }

    #[test]
    fn test_initial_delay_later_today() {
        let config = PruningConfig::default();
        let delay = initial_delay(&config, at(0, 30));
        assert_eq!(delay, Duration::from_secs(30 * 60));
    }

    #[test]
    fn test_initial_delay_rolls_to_tomorrow() {
        let config = PruningConfig::default();
        assert_eq!(
            initial_delay(&config, at(1, 0)),
            Duration::from_secs(24 * 3600)
        );
        assert_eq!(
            initial_delay(&config, at(13, 0)),
            Duration::from_secs(12 * 3600)
        );
    }

    #[test]
    fn test_initial_delay_without_start_time() {
        let config = PruningConfig {
            start_time: None,
            interval: Duration::from_secs(600),
            ..Default::default()
        };
        assert_eq!(initial_delay(&config, at(9, 0)), Duration::from_secs(600));
    }

    #[test]
    fn test_initial_delay_custom_time() {
        let config = PruningConfig {
            start_time: NaiveTime::from_hms_opt(23, 45, 0),
            ..Default::default()
        };
        assert_eq!(
            initial_delay(&config, at(23, 0)),
            Duration::from_secs(45 * 60)
        );
    }

    struct CountingCache {
        prunes: AtomicUsize,
    }

    #[async_trait]
    impl PersistentCache for CountingCache {
        fn name(&self) -> &str {
            "counting"
        }

        fn stats(&self) -> MemoryStats {
            MemoryStats::default()
        }

        async fn disk_stats(&self) -> DiskStats {
            DiskStats::default()
        }

        async fn invalidate_all(&self) {}

        async fn start(&self) {}

        async fn prune(&self) -> Option<PruneSummary> {
            self.prunes.fetch_add(1, Ordering::SeqCst);
            Some(PruneSummary::default())
        }

        async fn stop(&self) {}
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_run_then_cancel() {
        let cache = Arc::new(CountingCache {
            prunes: AtomicUsize::new(0),
        });
        let source_cache: Arc<dyn PersistentCache> = cache.clone();

        let config = PruningConfig {
            prune_on_startup: true,
            startup_delay: Duration::from_secs(1),
            interval: Duration::from_secs(3600),
            start_time: None,
        };
        let mut scheduler = PruningScheduler::start(config, move || vec![source_cache.clone()]);
        assert!(scheduler.is_running());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(cache.prunes.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(cache.prunes.load(Ordering::SeqCst), 2);

        scheduler.stop();
        tokio::time::sleep(Duration::from_secs(2 * 3600)).await;
        assert_eq!(cache.prunes.load(Ordering::SeqCst), 2);
        assert!(!scheduler.is_running());
    }
}
