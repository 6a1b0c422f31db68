//! # Persistent Store
//!
//! 单个缓存的磁盘层：一个 SQLite 文件 `<dir>/<name>.db`，
//! 每个版本一张表 `<name>_v<version>`。
//!
//! ```text
//! k         键 (VARCHAR(4096) 或 BLOB)，主键
//! v         值字节
//! created   创建时间 (毫秒)
//! accessed  最近访问时间 (毫秒)，prune 按它排序
//! space     生成列：length(k) + length(v)
//! ```
//!
//! 所有方法都是同步的，调用方负责放到阻塞线程上执行。
//! 错误在本层被降级：读失败视为 miss，写失败记 warn 后跳过。

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rusqlite::{params, Connection, OptionalExtension};

use super::bloom::BloomFilter;
use super::connection::{ConnectionOptions, SqlHandle};
use super::pool::ConnectionPool;
use crate::codec::{CacheSerializer, EncodedKey, KeyCodec};
use crate::error::Result;
use crate::types::{DiskStats, PruneSummary, ValueHolder};

/// 磁盘层参数
#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub name: String,
    pub version: u32,
    /// `SUM(space)` 上限 (字节)
    pub disk_limit: u64,
    pub expire_after_write: Option<Duration>,
    /// 是否维护 Bloom filter
    pub bloom_filter: bool,
}

/// 预先拼好的 SQL，`prepare_cached` 以字符串为键
struct Statements {
    create_table: String,
    select: String,
    upsert: String,
    touch: String,
    delete: String,
    delete_all: String,
    count: String,
    select_keys: String,
    sum_space: String,
    prune_candidates: String,
    touch_rowid: String,
    delete_rowid: String,
}

impl Statements {
    fn new(table: &str, key_column: &str) -> Self {
        Self {
            create_table: format!(
                "CREATE TABLE IF NOT EXISTS \"{table}\" (
                    k {key_column} NOT NULL PRIMARY KEY,
                    v BLOB NOT NULL,
                    created INTEGER NOT NULL,
                    accessed INTEGER NOT NULL,
                    space INTEGER GENERATED ALWAYS AS (length(CAST(k AS BLOB)) + length(v)) STORED
                );
                CREATE INDEX IF NOT EXISTS \"{table}_accessed\" ON \"{table}\" (accessed);"
            ),
            select: format!("SELECT v, created FROM \"{table}\" WHERE k = ?1"),
            upsert: format!(
                "INSERT INTO \"{table}\" (k, v, created, accessed) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(k) DO UPDATE SET
                    v = excluded.v,
                    created = excluded.created,
                    accessed = excluded.accessed"
            ),
            touch: format!("UPDATE \"{table}\" SET accessed = ?1 WHERE k = ?2"),
            delete: format!("DELETE FROM \"{table}\" WHERE k = ?1"),
            delete_all: format!("DELETE FROM \"{table}\""),
            count: format!("SELECT COUNT(*), COALESCE(SUM(space), 0) FROM \"{table}\""),
            select_keys: format!("SELECT k FROM \"{table}\""),
            sum_space: format!("SELECT COALESCE(SUM(space), 0) FROM \"{table}\""),
            prune_candidates: format!(
                "SELECT rowid, k, space, created FROM \"{table}\" ORDER BY accessed, rowid"
            ),
            touch_rowid: format!("UPDATE \"{table}\" SET accessed = ?1 WHERE rowid = ?2"),
            delete_rowid: format!("DELETE FROM \"{table}\" WHERE rowid = ?1"),
        }
    }
}

/// 表名：`-` 换成 `_`，再加版本后缀
pub fn table_name(name: &str, version: u32) -> String {
    format!("{}_v{}", table_base(name), version)
}

fn table_base(name: &str) -> String {
    name.replace('-', "_")
}

fn parse_version(table: &str, prefix: &str) -> Option<u32> {
    let digits = table.strip_prefix(prefix)?;
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// 缓存文件里现存表的版本号，升序；文件不存在时为空
pub fn stored_versions(
    directory: &Path,
    name: &str,
    options: &ConnectionOptions,
) -> Result<Vec<u32>> {
    let path = directory.join(format!("{}.db", name));
    if !path.exists() {
        return Ok(Vec::new());
    }

    let handle = SqlHandle::open(&path, options)?;
    let prefix = format!("{}_v", table_base(name));
    let tables: Vec<String> = {
        let mut stmt = handle
            .conn()
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table'")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<rusqlite::Result<_>>()?
    };
    handle.close();

    let mut versions: Vec<u32> = tables
        .iter()
        .filter_map(|table| parse_version(table, &prefix))
        .collect();
    versions.sort_unstable();
    Ok(versions)
}

/// 单个缓存的磁盘层
pub struct PersistentStore<K, V> {
    name: String,
    table: String,
    path: PathBuf,
    key_codec: KeyCodec<K>,
    value_serializer: Arc<dyn CacheSerializer<V>>,
    disk_limit: u64,
    expire_after_write: Option<Duration>,
    use_bloom_filter: bool,
    sql: Statements,
    pool: Arc<ConnectionPool>,
    bloom: RwLock<Option<BloomFilter>>,
    /// 构建过滤器与向过滤器追加键互斥
    bloom_build: Mutex<()>,
    /// 写入代次，`invalidate_all` 递增；旧代次的排队写入作废
    generation: AtomicU64,
    /// 条件写入与清表互斥
    write_gate: Mutex<()>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<K, V> PersistentStore<K, V> {
    pub fn new(
        directory: &Path,
        settings: StoreSettings,
        key_codec: KeyCodec<K>,
        value_serializer: Arc<dyn CacheSerializer<V>>,
        options: ConnectionOptions,
    ) -> Self {
        let path = directory.join(format!("{}.db", settings.name));
        let table = table_name(&settings.name, settings.version);
        let sql = Statements::new(&table, key_codec.column_type().sql());
        let pool = ConnectionPool::new(path.clone(), options);

        Self {
            name: settings.name,
            table,
            path,
            key_codec,
            value_serializer,
            disk_limit: settings.disk_limit,
            expire_after_write: settings.expire_after_write,
            use_bloom_filter: settings.bloom_filter,
            sql,
            pool,
            bloom: RwLock::new(None),
            bloom_build: Mutex::new(()),
            generation: AtomicU64::new(0),
            write_gate: Mutex::new(()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn disk_limit(&self) -> u64 {
        self.disk_limit
    }

    /// 创建表并构建 Bloom filter，可重复调用
    pub fn open(&self) {
        if let Err(e) = self.with_conn(|conn| self.ensure_schema(conn)) {
            tracing::warn!("Cannot create schema for cache {}: {}", self.name, e);
            return;
        }
        if self.use_bloom_filter {
            self.ensure_bloom_filter();
        }
    }

    /// 键是否可能在磁盘上
    ///
    /// 过滤器不可用（未启用或构建失败）时保守地返回 `true`。
    pub fn might_contain(&self, key: &K) -> bool {
        if !self.use_bloom_filter {
            return true;
        }
        let encoded = match self.key_codec.encode(key) {
            Ok(encoded) => encoded,
            Err(_) => return true,
        };

        if let Some(filter) = self.bloom.read().as_ref() {
            return filter.might_contain(encoded.as_bytes());
        }

        self.ensure_bloom_filter();
        match self.bloom.read().as_ref() {
            Some(filter) => filter.might_contain(encoded.as_bytes()),
            None => true,
        }
    }

    /// 读取一行
    ///
    /// 过期行或无法解码的行会被删除并视为 miss；命中时刷新 `accessed`。
    pub fn get_if_present(&self, key: &K) -> Option<ValueHolder<V>> {
        let encoded = match self.key_codec.encode(key) {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::warn!("Cannot encode key for cache {}: {}", self.name, e);
                return None;
            }
        };

        match self.with_conn(|conn| self.read_row(conn, &encoded)) {
            Ok(Some(holder)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(holder)
            }
            Ok(None) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Err(e) => {
                tracing::warn!("Cannot read cache {} for key: {}", self.name, e);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn read_row(&self, conn: &Connection, encoded: &EncodedKey) -> Result<Option<ValueHolder<V>>> {
        let row: Option<(Vec<u8>, i64)> = conn
            .prepare_cached(&self.sql.select)?
            .query_row([encoded], |row| Ok((row.get(0)?, row.get(1)?)))
            .optional()?;

        let (bytes, created_ms) = match row {
            Some(row) => row,
            None => return Ok(None),
        };

        let created = from_millis(created_ms);
        if self.expired(created) {
            conn.prepare_cached(&self.sql.delete)?.execute([encoded])?;
            return Ok(None);
        }

        let value = match self.value_serializer.deserialize(&bytes) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(
                    "Dropping undecodable entry from cache {}: {}",
                    self.name,
                    e
                );
                conn.prepare_cached(&self.sql.delete)?.execute([encoded])?;
                return Ok(None);
            }
        };

        conn.prepare_cached(&self.sql.touch)?
            .execute(params![now_millis(), encoded])?;

        Ok(Some(ValueHolder::durable(value, created)))
    }

    /// 写入一行
    ///
    /// 已落盘的值直接跳过；成功后标记 `durable` 并加入过滤器。
    pub fn put(&self, key: &K, holder: &ValueHolder<V>) {
        if holder.is_durable() {
            return;
        }

        let encoded = match self.key_codec.encode(key) {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::warn!("Cannot encode key for cache {}: {}", self.name, e);
                return;
            }
        };
        let bytes = match self.value_serializer.serialize(&holder.value) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("Cannot serialize value for cache {}: {}", self.name, e);
                return;
            }
        };

        let created = holder.created.timestamp_millis();
        let result = self.with_conn(|conn| {
            conn.prepare_cached(&self.sql.upsert)?
                .execute(params![encoded, bytes, created, now_millis()])?;
            Ok(())
        });

        match result {
            Ok(()) => {
                holder.mark_durable();
                self.add_to_filter(&encoded);
            }
            Err(e) => tracing::warn!("Cannot put into cache {}: {}", self.name, e),
        }
    }

    /// 当前写入代次，提交写后任务时记录
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// 代次未变时才写入
    ///
    /// 在 `invalidate_all` 之前排队、之后才执行的写入被丢弃。
    pub fn put_if_current(&self, key: &K, holder: &ValueHolder<V>, generation: u64) {
        let _gate = self.write_gate.lock();
        if self.generation.load(Ordering::Acquire) != generation {
            tracing::debug!(
                "Discarding write to cache {} queued before invalidate_all",
                self.name
            );
            return;
        }
        self.put(key, holder);
    }

    pub fn invalidate(&self, key: &K) {
        let encoded = match self.key_codec.encode(key) {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::warn!("Cannot encode key for cache {}: {}", self.name, e);
                return;
            }
        };

        let result = self.with_conn(|conn| {
            conn.prepare_cached(&self.sql.delete)?.execute([&encoded])?;
            Ok(())
        });
        if let Err(e) = result {
            tracing::warn!("Cannot invalidate cache {}: {}", self.name, e);
        }
    }

    /// 清空整张表，并换上一个空的过滤器
    pub fn invalidate_all(&self) {
        // 进行中的条件写入完成后才清表
        let _gate = self.write_gate.lock();
        self.generation.fetch_add(1, Ordering::AcqRel);
        let _guard = self.bloom_build.lock();
        let result = self.with_conn(|conn| {
            self.ensure_schema(conn)?;
            conn.execute(&self.sql.delete_all, [])?;
            Ok(())
        });

        match result {
            Ok(()) => {
                if self.use_bloom_filter {
                    *self.bloom.write() = Some(BloomFilter::sized_for(0));
                }
            }
            Err(e) => tracing::warn!("Cannot invalidate cache {}: {}", self.name, e),
        }
    }

    /// 行数与占用字节数
    pub fn disk_stats(&self) -> DiskStats {
        let (size, space) = match self.with_conn(|conn| {
            let counts: (i64, i64) = conn
                .prepare_cached(&self.sql.count)?
                .query_row([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            Ok(counts)
        }) {
            Ok(counts) => counts,
            Err(e) => {
                tracing::warn!("Cannot get DiskStats for {}: {}", self.name, e);
                (0, 0)
            }
        };

        DiskStats {
            size: size.max(0) as u64,
            space: space.max(0) as u64,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// 按 `accessed` 从旧到新回收空间，直到 `SUM(space) <= disk_limit`
    ///
    /// `is_hot` 返回 `true` 且未过期的行只续期不删除。
    /// 同时删除同一文件里其他版本的表。
    pub fn prune(&self, is_hot: &dyn Fn(&K) -> bool) -> PruneSummary {
        match self.with_conn(|conn| self.prune_with(conn, is_hot)) {
            Ok(summary) => {
                if summary.deleted > 0 || !summary.dropped_tables.is_empty() {
                    tracing::info!(
                        "Pruned cache {}: deleted {} entries, {} bytes remain",
                        self.name,
                        summary.deleted,
                        summary.remaining_space
                    );
                }
                summary
            }
            Err(e) => {
                tracing::warn!("Cannot prune cache {}: {}", self.name, e);
                PruneSummary::default()
            }
        }
    }

    fn prune_with(&self, conn: &Connection, is_hot: &dyn Fn(&K) -> bool) -> Result<PruneSummary> {
        self.ensure_schema(conn)?;

        let mut summary = PruneSummary {
            dropped_tables: self.drop_stale_versions(conn)?,
            ..Default::default()
        };

        let mut used: i64 = conn
            .prepare_cached(&self.sql.sum_space)?
            .query_row([], |row| row.get(0))?;
        let limit = i64::try_from(self.disk_limit).unwrap_or(i64::MAX);

        if used > limit {
            let candidates: Vec<(i64, EncodedKey, i64, i64)> = {
                let mut stmt = conn.prepare(&self.sql.prune_candidates)?;
                let rows = stmt.query_map([], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                })?;
                rows.collect::<rusqlite::Result<_>>()?
            };

            let tx = conn.unchecked_transaction()?;
            let now = now_millis();
            for (rowid, key, space, created) in candidates {
                if used <= limit {
                    break;
                }

                let hot = !self.expired(from_millis(created))
                    && self
                        .key_codec
                        .decode(&key)
                        .map(|key| is_hot(&key))
                        .unwrap_or(false);

                if hot {
                    tx.prepare_cached(&self.sql.touch_rowid)?
                        .execute(params![now, rowid])?;
                    summary.touched += 1;
                } else {
                    tx.prepare_cached(&self.sql.delete_rowid)?
                        .execute([rowid])?;
                    used -= space;
                    summary.deleted += 1;
                }
            }
            tx.commit()?;
        }

        summary.remaining_space = used.max(0) as u64;
        Ok(summary)
    }

    /// 删除 `<name>_v<n>`（n 不等于当前版本）表
    fn drop_stale_versions(&self, conn: &Connection) -> Result<Vec<String>> {
        let prefix = format!("{}_v", table_base(&self.name));
        let tables: Vec<String> = {
            let mut stmt = conn.prepare("SELECT name FROM sqlite_master WHERE type = 'table'")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<_>>()?
        };

        let mut dropped = Vec::new();
        for table in tables {
            let stale = table != self.table && parse_version(&table, &prefix).is_some();
            if stale {
                conn.execute_batch(&format!("DROP TABLE IF EXISTS \"{table}\""))?;
                tracing::info!("Dropped stale table {} from cache {}", table, self.name);
                dropped.push(table);
            }
        }
        Ok(dropped)
    }

    /// 关闭所有句柄
    pub fn close(&self) {
        self.pool.close();
    }

    fn ensure_schema(&self, conn: &Connection) -> Result<()> {
        conn.execute_batch(&self.sql.create_table)?;
        Ok(())
    }

    /// 构建过滤器（只构建一次）
    fn ensure_bloom_filter(&self) {
        let _guard = self.bloom_build.lock();
        if self.bloom.read().is_some() {
            return;
        }

        match self.with_conn(|conn| self.build_bloom_filter(conn)) {
            Ok(filter) => {
                *self.bloom.write() = Some(filter);
            }
            Err(e) if e.is_codec() => {
                tracing::warn!(
                    "Entries cached for {} have an incompatible format and can't be decoded. \
                     Cache is flushed.",
                    self.name
                );
                let cleared = self.with_conn(|conn| {
                    conn.execute(&self.sql.delete_all, [])?;
                    Ok(())
                });
                match cleared {
                    Ok(()) => *self.bloom.write() = Some(BloomFilter::sized_for(0)),
                    Err(e) => tracing::warn!("Cannot flush cache {}: {}", self.name, e),
                }
            }
            Err(e) => {
                tracing::warn!("Cannot build BloomFilter for {}: {}", self.name, e);
            }
        }
    }

    fn build_bloom_filter(&self, conn: &Connection) -> Result<BloomFilter> {
        self.ensure_schema(conn)?;

        let (rows, _): (i64, i64) = conn
            .prepare_cached(&self.sql.count)?
            .query_row([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut filter = BloomFilter::sized_for(rows.max(0) as u64);

        let mut stmt = conn.prepare(&self.sql.select_keys)?;
        let mut keys = stmt.query([])?;
        while let Some(row) = keys.next()? {
            let encoded: EncodedKey = row.get(0)?;
            // 解码失败说明磁盘上的格式与当前代码不兼容
            self.key_codec.decode(&encoded)?;
            filter.put(encoded.as_bytes());
        }

        tracing::debug!(
            "Built BloomFilter for {} over {} entries ({} bits)",
            self.name,
            rows,
            filter.bit_size()
        );
        Ok(filter)
    }

    fn add_to_filter(&self, encoded: &EncodedKey) {
        if !self.use_bloom_filter {
            return;
        }
        // 与构建互斥：构建中的过滤器安装后才追加，避免漏键
        let _guard = self.bloom_build.lock();
        if let Some(filter) = self.bloom.write().as_mut() {
            filter.put(encoded.as_bytes());
        }
    }

    fn expired(&self, created: DateTime<Utc>) -> bool {
        match self.expire_after_write {
            Some(ttl) => (Utc::now() - created)
                .to_std()
                .map_or(false, |age| age > ttl),
            None => false,
        }
    }

    /// 借出句柄执行操作；出错的句柄丢弃不回池
    fn with_conn<T>(&self, op: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let handle = self.pool.acquire()?;
        match op(&*handle) {
            Ok(value) => Ok(value),
            Err(e) => {
                if !e.is_codec() {
                    handle.discard();
                }
                Err(e)
            }
        }
    }
}

impl<K, V> std::fmt::Debug for PersistentStore<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentStore")
            .field("name", &self.name)
            .field("table", &self.table)
            .field("path", &self.path)
            .field("disk_limit", &self.disk_limit)
            .finish_non_exhaustive()
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}
