//! # hcache Error Types
//!
//! Centralized error handling for the cache engine.
//!
//! 缓存是软状态：存储层与连接池的错误只在内部传播，
//! 到达调用方之前就会被降级为 miss / skip。

use thiserror::Error;

/// Result type alias for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

/// Core error types for hcache
#[derive(Error, Debug)]
pub enum CacheError {
    /// Database errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Key or value encoding/decoding errors
    #[error("Codec error: {0}")]
    Codec(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// The store or executor has been shut down
    #[error("Closed: {0}")]
    Closed(String),

    /// Not found errors
    #[error("Not found: {0}")]
    NotFound(String),

    /// Already exists errors
    #[error("Already exists: {0}")]
    AlreadyExists(String),
}

impl CacheError {
    /// Create a new codec error
    pub fn codec(msg: impl Into<String>) -> Self {
        Self::Codec(msg.into())
    }

    /// Create a new configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a new storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a new closed error
    pub fn closed(msg: impl Into<String>) -> Self {
        Self::Closed(msg.into())
    }

    /// Create a new not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a new already exists error
    pub fn already_exists(msg: impl Into<String>) -> Self {
        Self::AlreadyExists(msg.into())
    }

    /// 是否为编解码错误（行格式与当前代码不兼容）
    pub fn is_codec(&self) -> bool {
        matches!(self, Self::Codec(_))
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

impl From<bincode::Error> for CacheError {
    fn from(err: bincode::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

#[cfg(feature = "proto")]
impl From<prost::DecodeError> for CacheError {
    fn from(err: prost::DecodeError) -> Self {
        Self::Codec(err.to_string())
    }
}
