//! HybridCache 集成测试
//!
//! 通过 CacheRegistry 走完整路径：内存层、Bloom filter、SQLite、写后队列。
//!
//! 运行方式:
//! ```bash
//! cargo test -p hcache-core --test hybrid_cache_test
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hcache_core::{
    CacheDefinition, CacheRegistry, Config, FnLoader, HybridCache, KeyCodec, StringSerializer,
};
use tempfile::TempDir;

fn definition(name: &str) -> CacheDefinition<String, String> {
    CacheDefinition::builder(name)
        .key_codec(KeyCodec::string())
        .value_serializer(StringSerializer)
        .build()
        .unwrap()
}

async fn started_registry(dir: &TempDir, config: Config) -> CacheRegistry {
    let registry = CacheRegistry::new(config.with_directory(dir.path())).unwrap();
    registry.start().await;
    registry
}

async fn open_cache(
    registry: &CacheRegistry,
    def: CacheDefinition<String, String>,
) -> Arc<HybridCache<String, String>> {
    registry.register(def).await.unwrap()
}

#[tokio::test]
async fn test_values_survive_restart() {
    let dir = TempDir::new().unwrap();

    {
        let registry = started_registry(&dir, Config::for_testing(dir.path())).await;
        let accounts = open_cache(&registry, definition("accounts")).await;
        accounts.put("alice".into(), "Alice".into()).await;
        accounts.put("bob".into(), "Bob".into()).await;
        registry.stop().await;
    }

    let registry = started_registry(&dir, Config::for_testing(dir.path())).await;
    let accounts = open_cache(&registry, definition("accounts")).await;

    assert_eq!(accounts.size(), 0);
    assert_eq!(
        accounts.get_if_present(&"alice".to_string()).await,
        Some("Alice".to_string())
    );
    assert_eq!(accounts.size(), 1);

    let disk = accounts.disk_stats().await;
    assert_eq!(disk.size, 2);
    assert_eq!(disk.hits, 1);

    registry.stop().await;
}

#[tokio::test]
async fn test_put_is_written_behind() {
    let dir = TempDir::new().unwrap();
    let registry = started_registry(&dir, Config::for_testing(dir.path())).await;
    let cache = open_cache(&registry, definition("diff")).await;

    cache.put("k1".into(), "v1".into()).await;
    assert_eq!(cache.get_if_present(&"k1".to_string()).await, Some("v1".into()));

    assert!(cache.flush().await);
    let disk = cache.disk_stats().await;
    assert_eq!(disk.size, 1);
    assert_eq!(disk.space, 4);

    registry.stop().await;
}

#[tokio::test]
async fn test_absent_keys_skip_disk() {
    let dir = TempDir::new().unwrap();
    let registry = started_registry(&dir, Config::for_testing(dir.path())).await;
    let cache = open_cache(&registry, definition("diff")).await;

    for i in 0..20 {
        assert_eq!(cache.get_if_present(&format!("missing-{}", i)).await, None);
    }

    let disk = cache.disk_stats().await;
    assert_eq!(disk.misses, 0);
    assert_eq!(disk.hits, 0);
    assert_eq!(cache.stats().misses, 20);

    registry.stop().await;
}

#[tokio::test]
async fn test_concurrent_gets_load_once() {
    let dir = TempDir::new().unwrap();
    let registry = started_registry(&dir, Config::for_testing(dir.path())).await;
    let cache = open_cache(&registry, definition("projects")).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let load = || {
        let calls = Arc::clone(&calls);
        move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok::<_, String>("computed".to_string())
        }
    };

    let key = "shared".to_string();
    let (a, b, c, d) = tokio::join!(
        cache.get(key.clone(), load()),
        cache.get(key.clone(), load()),
        cache.get(key.clone(), load()),
        cache.get(key.clone(), load()),
    );

    for result in [a, b, c, d] {
        assert_eq!(result.unwrap(), "computed");
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    cache.flush().await;
    assert_eq!(cache.disk_stats().await.size, 1);

    registry.stop().await;
}

#[tokio::test]
async fn test_loader_errors_propagate() {
    let dir = TempDir::new().unwrap();
    let registry = started_registry(&dir, Config::for_testing(dir.path())).await;
    let cache = open_cache(&registry, definition("projects")).await;

    let err = cache
        .get("broken".to_string(), || async {
            Err::<String, _>("backend down".to_string())
        })
        .await
        .unwrap_err();
    assert_eq!(err, "backend down");

    // 失败不缓存
    let value = cache
        .get("broken".to_string(), || async { Ok::<_, String>("ok".to_string()) })
        .await
        .unwrap();
    assert_eq!(value, "ok");

    registry.stop().await;
}

#[tokio::test]
async fn test_concurrent_failures_run_loader_once() {
    let dir = TempDir::new().unwrap();
    let registry = started_registry(&dir, Config::for_testing(dir.path())).await;
    let cache = open_cache(&registry, definition("projects")).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let load = || {
        let calls = Arc::clone(&calls);
        move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Err::<String, _>("backend down".to_string())
        }
    };

    let key = "x".to_string();
    let (a, b, c, d) = tokio::join!(
        cache.get(key.clone(), load()),
        cache.get(key.clone(), load()),
        cache.get(key.clone(), load()),
        cache.get(key.clone(), load()),
    );

    for result in [a, b, c, d] {
        assert_eq!(result.unwrap_err(), "backend down");
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(cache.size(), 0);

    registry.stop().await;
}

#[tokio::test]
async fn test_disk_hit_skips_loader() {
    let dir = TempDir::new().unwrap();

    {
        let registry = started_registry(&dir, Config::for_testing(dir.path())).await;
        let cache = open_cache(&registry, definition("projects")).await;
        cache.put("p".into(), "from-disk".into()).await;
        registry.stop().await;
    }

    let registry = started_registry(&dir, Config::for_testing(dir.path())).await;
    let cache = open_cache(&registry, definition("projects")).await;
    let value = cache
        .get("p".to_string(), || async {
            Ok::<_, String>("from-loader".to_string())
        })
        .await
        .unwrap();
    assert_eq!(value, "from-disk");

    registry.stop().await;
}

#[tokio::test]
async fn test_invalidate_removes_both_tiers() {
    let dir = TempDir::new().unwrap();
    let registry = started_registry(&dir, Config::for_testing(dir.path())).await;
    let cache = open_cache(&registry, definition("changes")).await;

    cache.put("a".into(), "1".into()).await;
    cache.put("b".into(), "2".into()).await;
    cache.flush().await;
    assert_eq!(cache.disk_stats().await.size, 2);

    cache.invalidate("a".into()).await;
    assert_eq!(cache.size(), 1);
    cache.flush().await;
    assert_eq!(cache.disk_stats().await.size, 1);
    assert_eq!(cache.get_if_present(&"a".to_string()).await, None);

    cache.invalidate_all().await;
    assert_eq!(cache.size(), 0);
    assert_eq!(cache.disk_stats().await.size, 0);
    assert_eq!(cache.get_if_present(&"b".to_string()).await, None);

    registry.stop().await;
}

#[tokio::test]
async fn test_invalidate_all_discards_queued_writes() {
    let dir = TempDir::new().unwrap();
    let registry = started_registry(&dir, Config::for_testing(dir.path())).await;
    let cache = open_cache(&registry, definition("accounts")).await;

    // 占住唯一的 worker，让下面的写入停在队列里
    registry
        .executor()
        .submit(|| std::thread::sleep(Duration::from_millis(300)))
        .await;

    cache.put("alice".into(), "42".into()).await;
    cache.invalidate_all().await;
    assert!(cache.flush().await);

    assert_eq!(cache.get_if_present(&"alice".to_string()).await, None);
    assert_eq!(cache.disk_stats().await.size, 0);

    // 清空之后的写入照常落盘
    cache.put("bob".into(), "7".into()).await;
    assert!(cache.flush().await);
    assert_eq!(cache.disk_stats().await.size, 1);

    registry.stop().await;
}

#[tokio::test]
async fn test_invalidate_many_falls_back_to_clear() {
    let dir = TempDir::new().unwrap();
    let config = Config::for_testing(dir.path()).with_max_invalidated(2);
    let registry = started_registry(&dir, config).await;
    let cache = open_cache(&registry, definition("changes")).await;

    for i in 0..5 {
        cache.put(format!("k{}", i), format!("v{}", i)).await;
    }
    cache.flush().await;

    cache
        .invalidate_many(vec!["k0".to_string(), "k1".to_string()])
        .await;
    cache.flush().await;
    assert_eq!(cache.size(), 3);
    assert_eq!(cache.disk_stats().await.size, 3);

    cache
        .invalidate_many(vec!["k2".to_string(), "k3".to_string(), "k9".to_string()])
        .await;
    assert_eq!(cache.size(), 0);
    assert_eq!(cache.disk_stats().await.size, 0);

    registry.stop().await;
}

#[tokio::test]
async fn test_refresh_after_write_reloads_in_background() {
    let dir = TempDir::new().unwrap();
    let registry = started_registry(&dir, Config::for_testing(dir.path())).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let def = CacheDefinition::<String, String>::builder("groups")
        .key_codec(KeyCodec::string())
        .value_serializer(StringSerializer)
        .refresh_after_write(Duration::from_millis(50))
        .loader(FnLoader::new(move |key: &String| -> anyhow::Result<String> {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!("{}-{}", key, n))
        }))
        .build()
        .unwrap();
    let cache = open_cache(&registry, def).await;

    assert_eq!(cache.get_loaded("g".into()).await.unwrap(), "g-1");
    assert_eq!(cache.get_loaded("g".into()).await.unwrap(), "g-1");
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(100)).await;

    // 旧值照常返回，后台重载一次
    assert_eq!(cache.get_loaded("g".into()).await.unwrap(), "g-1");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(cache.get_loaded("g".into()).await.unwrap(), "g-2");

    registry.stop().await;
}

#[tokio::test]
async fn test_get_all_uses_bound_loader() {
    let dir = TempDir::new().unwrap();
    let registry = started_registry(&dir, Config::for_testing(dir.path())).await;

    let def = CacheDefinition::<String, String>::builder("labels")
        .key_codec(KeyCodec::string())
        .value_serializer(StringSerializer)
        .loader(FnLoader::new(|key: &String| -> anyhow::Result<String> {
            if key == "bad" {
                anyhow::bail!("no label for {}", key);
            }
            Ok(key.to_uppercase())
        }))
        .build()
        .unwrap();
    let cache = open_cache(&registry, def).await;

    let values = cache
        .get_all(vec!["a".to_string(), "b".to_string()])
        .await
        .unwrap();
    assert_eq!(values.len(), 2);
    assert_eq!(values["a"], "A");
    assert_eq!(values["b"], "B");

    assert!(cache.get_all(vec!["c".to_string(), "bad".to_string()]).await.is_err());

    let plain = open_cache(&registry, definition("plain")).await;
    assert!(plain.get_loaded("x".into()).await.is_err());

    registry.stop().await;
}

#[tokio::test]
async fn test_unflushed_entries_written_on_stop() {
    let dir = TempDir::new().unwrap();

    {
        let config = Config::for_testing(dir.path());
        let registry = started_registry(&dir, config).await;
        let cache = open_cache(&registry, definition("accounts")).await;
        cache.put("carol".into(), "Carol".into()).await;
        // 无 flush：依赖 stop 排空队列并落盘
        registry.stop().await;
    }

    let registry = started_registry(&dir, Config::for_testing(dir.path())).await;
    let cache = open_cache(&registry, definition("accounts")).await;
    assert_eq!(
        cache.get_if_present(&"carol".to_string()).await,
        Some("Carol".to_string())
    );
    registry.stop().await;
}
