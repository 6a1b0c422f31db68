//! # hcache Core Library
//!
//! Hybrid memory + disk cache with write-behind persistence.
//!
//! Values that are expensive to compute are kept in a bounded in-memory tier
//! and persisted to one SQLite file per cache, so they survive restarts.
//!
//! ## Architecture
//!
//! - **Cache**: `HybridCache` combining the memory tier and the disk tier
//! - **Storage**: SQLite handle pool, bloom filter and the persistent store
//! - **Codec**: explicit key codecs and value serializers
//! - **Scheduler**: periodic disk pruning
//! - **Registry**: application-owned set of caches with a shared write-behind executor
//! - **Config**: TOML file + environment configuration
//!
//! ## 读写路径
//!
//! ```text
//! get ─► memory ─► bloom filter ─► SQLite ─► loader
//!           ▲                                  │
//!           └────────── install ◄──────────────┘
//!                          │
//!                          └─► write-behind queue ─► SQLite
//! ```
//!
//! 磁盘层是尽力而为的软状态：磁盘错误只会变成 miss，不会传给调用方。

pub mod cache;
pub mod codec;
pub mod config;
pub mod error;
pub mod registry;
pub mod scheduler;
pub mod storage;
pub mod types;

pub use cache::{
    CacheDefinition, CacheDefinitionBuilder, CacheLoader, FnLoader, HybridCache, PersistentCache,
    SharedLoadError,
};
#[cfg(feature = "proto")]
pub use codec::ProtoSerializer;
pub use codec::{
    BincodeSerializer, BytesSerializer, CacheSerializer, JsonSerializer, KeyCodec,
    StringSerializer,
};
pub use config::{CacheSettings, Config, ConfigLoader, PruningConfig};
pub use error::{CacheError, Result};
pub use registry::CacheRegistry;
pub use types::{DiskStats, MemoryStats, PruneSummary, ValueHolder};
