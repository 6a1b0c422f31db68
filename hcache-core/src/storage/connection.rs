//! 单个数据库句柄
//!
//! 打开时设置连接级 PRAGMA；schema 由 [`super::store::PersistentStore`] 负责。

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{Connection, OpenFlags};

use crate::error::Result;

/// 连接参数
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// 页缓存大小 (KiB)，`None` 使用 SQLite 默认值
    pub cache_size_kib: Option<u64>,
    /// 多进程共享同一数据库文件（开启 WAL）
    pub auto_server: bool,
    /// 繁忙超时
    pub busy_timeout: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            cache_size_kib: None,
            auto_server: false,
            busy_timeout: Duration::from_millis(5000),
        }
    }
}

/// 已打开的数据库连接
pub struct SqlHandle {
    conn: Connection,
    path: PathBuf,
}

impl SqlHandle {
    pub fn open(path: &Path, options: &ConnectionOptions) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        conn.busy_timeout(options.busy_timeout)?;

        if let Some(kib) = options.cache_size_kib {
            // 负值表示 KiB
            conn.pragma_update(None, "cache_size", -(kib as i64))?;
        }

        if options.auto_server {
            let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
            if !mode.eq_ignore_ascii_case("wal") {
                tracing::warn!("{}: journal_mode is {} instead of wal", path.display(), mode);
            }
            conn.pragma_update(None, "synchronous", "NORMAL")?;
        }

        conn.set_prepared_statement_cache_capacity(32);

        tracing::trace!("Opened cache database {}", path.display());

        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn close(self) {
        if let Err((_, e)) = self.conn.close() {
            tracing::warn!("Cannot close {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_applies_pragmas() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("diff.db");
        let options = ConnectionOptions {
            cache_size_kib: Some(2048),
            auto_server: true,
            ..Default::default()
        };

        let handle = SqlHandle::open(&path, &options).unwrap();
        let cache_size: i64 = handle
            .conn()
            .query_row("PRAGMA cache_size", [], |r| r.get(0))
            .unwrap();
        assert_eq!(cache_size, -2048);

        let mode: String = handle
            .conn()
            .query_row("PRAGMA journal_mode", [], |r| r.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");

        assert!(path.exists());
        handle.close();
    }
}
