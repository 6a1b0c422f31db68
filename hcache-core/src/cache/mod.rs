//! # Cache Module
//!
//! 两级缓存的组成部分。
//!
//! ## 模块
//!
//! - `definition`: 缓存定义与构建器
//! - `memory`: 有界 LRU 内存层
//! - `write_behind`: 共享的写后执行器
//! - `hybrid`: 内存 + 磁盘的组合
//! - `loader`: 绑定在定义上的加载器

pub mod definition;
pub mod hybrid;
pub mod loader;
pub mod memory;
pub mod write_behind;

pub use definition::{CacheDefinition, CacheDefinitionBuilder};
pub use hybrid::{HybridCache, PersistentCache};
pub use loader::{CacheLoader, FnLoader, SharedLoadError};
pub use memory::{MemoryTier, Weigher};
pub use write_behind::{WriteBehindExecutor, DEFAULT_QUEUE_CAPACITY};
