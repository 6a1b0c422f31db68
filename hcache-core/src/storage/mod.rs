//! # Storage Module
//!
//! 磁盘层：SQLite 句柄池、Bloom filter 与按缓存划分的持久化表。

pub mod bloom;
pub mod connection;
pub mod pool;
pub mod store;

pub use bloom::BloomFilter;
pub use connection::{ConnectionOptions, SqlHandle};
pub use pool::{ConnectionPool, PooledHandle};
pub use store::{stored_versions, table_name, PersistentStore, StoreSettings};
