//! # Key Codec
//!
//! 键的编码方式决定了磁盘表中 `k` 列的 SQL 类型：
//!
//! | 变体 | 列类型 | 说明 |
//! |------|--------|------|
//! | `Text` | `VARCHAR(4096)` | 字符串键，直接存文本 |
//! | `Opaque` | `BLOB` | 任意序列化器产出的字节 |
//! | `Structured` | `BLOB` | schema 描述的消息 (protobuf) |
//!
//! Bloom filter 对 `EncodedKey::as_bytes()` 做哈希。`Text` 键的字节
//! 就是字符本身的 UTF-8 编码，其余变体是编码后的字节。

use std::sync::Arc;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};

use super::serializer::CacheSerializer;
use crate::error::{CacheError, Result};

/// 文本键的最大长度 (字节)
pub const MAX_TEXT_KEY_LEN: usize = 4096;

/// `k` 列的 SQL 类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    Blob,
}

impl ColumnType {
    pub fn sql(&self) -> &'static str {
        match self {
            ColumnType::Text => "VARCHAR(4096)",
            ColumnType::Blob => "BLOB",
        }
    }
}

/// 已编码的键，可直接绑定到 SQL 参数
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EncodedKey {
    Text(String),
    Blob(Vec<u8>),
}

impl EncodedKey {
    /// Bloom filter 与 `space` 统计使用的字节视图
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            EncodedKey::Text(s) => s.as_bytes(),
            EncodedKey::Blob(b) => b,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ToSql for EncodedKey {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        match self {
            EncodedKey::Text(s) => Ok(ToSqlOutput::from(s.as_str())),
            EncodedKey::Blob(b) => Ok(ToSqlOutput::from(b.as_slice())),
        }
    }
}

impl FromSql for EncodedKey {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value {
            ValueRef::Text(t) => String::from_utf8(t.to_vec())
                .map(EncodedKey::Text)
                .map_err(|e| FromSqlError::Other(Box::new(e))),
            ValueRef::Blob(b) => Ok(EncodedKey::Blob(b.to_vec())),
            _ => Err(FromSqlError::InvalidType),
        }
    }
}

/// 键编解码器
pub enum KeyCodec<K> {
    /// 文本键
    Text {
        encode: fn(&K) -> String,
        /// 无法解析时返回编解码错误
        decode: fn(String) -> Result<K>,
    },
    /// 不透明字节键
    Opaque(Arc<dyn CacheSerializer<K>>),
    /// 结构化键
    Structured(Arc<dyn CacheSerializer<K>>),
}

impl<K> Clone for KeyCodec<K> {
    fn clone(&self) -> Self {
        match self {
            KeyCodec::Text { encode, decode } => KeyCodec::Text {
                encode: *encode,
                decode: *decode,
            },
            KeyCodec::Opaque(ser) => KeyCodec::Opaque(Arc::clone(ser)),
            KeyCodec::Structured(ser) => KeyCodec::Structured(Arc::clone(ser)),
        }
    }
}

impl KeyCodec<String> {
    /// `String` 键的文本编码
    pub fn string() -> Self {
        KeyCodec::Text {
            encode: |k| k.clone(),
            decode: Ok,
        }
    }
}

impl<K> KeyCodec<K> {
    /// 自定义文本编码
    ///
    /// `decode` 失败说明磁盘上的行与当前键类型不兼容。
    pub fn text(encode: fn(&K) -> String, decode: fn(String) -> Result<K>) -> Self {
        KeyCodec::Text { encode, decode }
    }

    pub fn opaque<S>(serializer: S) -> Self
    where
        S: CacheSerializer<K> + 'static,
    {
        KeyCodec::Opaque(Arc::new(serializer))
    }

    pub fn structured<S>(converter: S) -> Self
    where
        S: CacheSerializer<K> + 'static,
    {
        KeyCodec::Structured(Arc::new(converter))
    }

    /// Protobuf 消息键
    #[cfg(feature = "proto")]
    pub fn proto() -> Self
    where
        K: prost::Message + Default + 'static,
    {
        KeyCodec::Structured(Arc::new(super::serializer::ProtoSerializer::<K>::new()))
    }

    pub fn column_type(&self) -> ColumnType {
        match self {
            KeyCodec::Text { .. } => ColumnType::Text,
            KeyCodec::Opaque(_) | KeyCodec::Structured(_) => ColumnType::Blob,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            KeyCodec::Text { .. } => "text",
            KeyCodec::Opaque(_) => "opaque",
            KeyCodec::Structured(_) => "structured",
        }
    }

    pub fn encode(&self, key: &K) -> Result<EncodedKey> {
        match self {
            KeyCodec::Text { encode, .. } => {
                let text = encode(key);
                if text.len() > MAX_TEXT_KEY_LEN {
                    return Err(CacheError::codec(format!(
                        "text key of {} bytes exceeds {} byte limit",
                        text.len(),
                        MAX_TEXT_KEY_LEN
                    )));
                }
                Ok(EncodedKey::Text(text))
            }
            KeyCodec::Opaque(ser) | KeyCodec::Structured(ser) => {
                Ok(EncodedKey::Blob(ser.serialize(key)?))
            }
        }
    }

    pub fn decode(&self, encoded: &EncodedKey) -> Result<K> {
        match self {
            KeyCodec::Text { decode, .. } => {
                let text = match encoded {
                    EncodedKey::Text(s) => s.clone(),
                    EncodedKey::Blob(b) => String::from_utf8(b.clone())
                        .map_err(|e| CacheError::codec(e.to_string()))?,
                };
                decode(text)
            }
            KeyCodec::Opaque(ser) | KeyCodec::Structured(ser) => {
                ser.deserialize(encoded.as_bytes())
            }
        }
    }
}
