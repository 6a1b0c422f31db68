//! 子命令实现
//!
//! 每个缓存按字节键、字节值注册，只做统计、清空与回收，不解码内容。

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;

use hcache_core::cache::PersistentCache;
use hcache_core::storage::stored_versions;
use hcache_core::{
    BytesSerializer, CacheDefinition, CacheRegistry, Config, ConfigLoader, DiskStats, KeyCodec,
    PruneSummary,
};

pub fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    let loader = match path {
        Some(path) => {
            if !path.exists() {
                anyhow::bail!("config file {} does not exist", path.display());
            }
            ConfigLoader::with_path(path)
        }
        None => ConfigLoader::new(),
    };
    loader
        .load()
        .with_context(|| format!("loading {}", loader.config_path().display()))
}

#[derive(Debug, Serialize)]
struct CacheStatsRow {
    name: String,
    version: u32,
    #[serde(flatten)]
    disk: DiskStats,
}

#[derive(Debug, Serialize)]
struct PruneRow {
    name: String,
    #[serde(flatten)]
    summary: Option<PruneSummary>,
}

pub async fn stats(config: Config, names: &[String], json: bool) -> anyhow::Result<()> {
    let (registry, opened) = open_caches(config, names).await?;

    let mut rows = Vec::new();
    for (cache, version) in &opened {
        rows.push(CacheStatsRow {
            name: cache.name().to_string(),
            version: *version,
            disk: cache.disk_stats().await,
        });
    }
    registry.stop().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    println!(
        "{:<32} {:>8} {:>12} {:>14}",
        "NAME", "VERSION", "ENTRIES", "SPACE"
    );
    for row in &rows {
        println!(
            "{:<32} {:>8} {:>12} {:>14}",
            row.name,
            row.version,
            row.disk.size,
            format_bytes(row.disk.space)
        );
    }
    Ok(())
}

pub async fn flush(config: Config, names: &[String], json: bool) -> anyhow::Result<()> {
    let (registry, opened) = open_caches(config, names).await?;

    let mut flushed = Vec::new();
    for (cache, _) in &opened {
        cache.invalidate_all().await;
        flushed.push(cache.name().to_string());
    }
    registry.stop().await;

    if json {
        println!("{}", serde_json::json!({ "flushed": flushed }));
    } else {
        for name in &flushed {
            println!("Flushed {}", name);
        }
    }
    Ok(())
}

pub async fn prune(config: Config, names: &[String], json: bool) -> anyhow::Result<()> {
    let (registry, opened) = open_caches(config, names).await?;

    let mut rows = Vec::new();
    for (cache, _) in &opened {
        rows.push(PruneRow {
            name: cache.name().to_string(),
            summary: cache.prune().await,
        });
    }
    registry.stop().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    for row in &rows {
        match &row.summary {
            Some(summary) => {
                println!(
                    "{}: deleted {}, kept {} hot, {} remaining",
                    row.name,
                    summary.deleted,
                    summary.touched,
                    format_bytes(summary.remaining_space)
                );
                for table in &summary.dropped_tables {
                    println!("{}: dropped stale table {}", row.name, table);
                }
            }
            None => println!("{}: skipped", row.name),
        }
    }
    Ok(())
}

/// 注册并打开选中的缓存；不启动定时回收
///
/// 还没有 `<name>.db` 的缓存直接跳过，不创建文件。
async fn open_caches(
    config: Config,
    names: &[String],
) -> anyhow::Result<(CacheRegistry, Vec<(Arc<dyn PersistentCache>, u32)>)> {
    let selected = select_caches(&config, names)?;
    let options = config.connection_options();
    let directory = config.directory.clone();
    let registry = CacheRegistry::new(config)?;

    let mut opened = Vec::new();
    for name in selected {
        if !directory.join(format!("{}.db", name)).exists() {
            tracing::debug!("Cache {} has no file in {}, skipping", name, directory.display());
            continue;
        }

        let configured = registry.config().settings_for(&name).and_then(|s| s.version);
        // 未配置版本时沿用文件里最新的表，避免把正在使用的表当作旧版本删除
        let version = match configured {
            Some(version) => version,
            None => stored_versions(&directory, &name, &options)?
                .last()
                .copied()
                .unwrap_or(0),
        };

        let def = CacheDefinition::<Vec<u8>, Vec<u8>>::builder(name.as_str())
            .key_codec(KeyCodec::opaque(BytesSerializer))
            .value_serializer(BytesSerializer)
            .version(version)
            .build()?;
        registry.register(def).await?;

        let erased = registry
            .caches()
            .into_iter()
            .find(|cache| cache.name() == name)
            .with_context(|| format!("cache {} was not registered", name))?;
        erased.start().await;
        opened.push((erased, version));
    }

    Ok((registry, opened))
}

/// 指定名字时校验其存在；否则取配置中的缓存与目录里的 `<name>.db`
fn select_caches(config: &Config, names: &[String]) -> anyhow::Result<Vec<String>> {
    let mut known: BTreeSet<String> = config.caches.keys().cloned().collect();
    if let Ok(entries) = std::fs::read_dir(&config.directory) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("db") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if hcache_core::cache::definition::validate_name(stem).is_ok() {
                    known.insert(stem.to_string());
                }
            }
        }
    }

    if names.is_empty() {
        return Ok(known.into_iter().collect());
    }

    for name in names {
        if !known.contains(name) {
            anyhow::bail!(
                "unknown cache {} (not configured and no {}.db in {})",
                name,
                name,
                config.directory.display()
            );
        }
    }
    Ok(names.to_vec())
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
