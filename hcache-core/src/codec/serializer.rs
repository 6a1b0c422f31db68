//! # Value Serializers
//!
//! 显式的编解码器：每个缓存定义都必须携带一个 `CacheSerializer`，
//! 不存在基于反射的隐式序列化兜底。

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{CacheError, Result};

/// 字节编解码器
///
/// 用于值的持久化，也用于 `Opaque` / `Structured` 键的编码。
pub trait CacheSerializer<T>: Send + Sync {
    /// 编码为字节
    fn serialize(&self, value: &T) -> Result<Vec<u8>>;

    /// 从字节解码
    fn deserialize(&self, bytes: &[u8]) -> Result<T>;
}

/// UTF-8 字符串
#[derive(Debug, Clone, Copy, Default)]
pub struct StringSerializer;

impl CacheSerializer<String> for StringSerializer {
    fn serialize(&self, value: &String) -> Result<Vec<u8>> {
        Ok(value.as_bytes().to_vec())
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<String> {
        String::from_utf8(bytes.to_vec()).map_err(|e| CacheError::codec(e.to_string()))
    }
}

/// 原始字节，不做任何转换
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesSerializer;

impl CacheSerializer<Vec<u8>> for BytesSerializer {
    fn serialize(&self, value: &Vec<u8>) -> Result<Vec<u8>> {
        Ok(value.clone())
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        Ok(bytes.to_vec())
    }
}

/// JSON (serde_json)
pub struct JsonSerializer<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonSerializer<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonSerializer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> CacheSerializer<T> for JsonSerializer<T>
where
    T: Serialize + DeserializeOwned,
{
    fn serialize(&self, value: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// 紧凑二进制格式 (bincode)
pub struct BincodeSerializer<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> BincodeSerializer<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for BincodeSerializer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> CacheSerializer<T> for BincodeSerializer<T>
where
    T: Serialize + DeserializeOwned,
{
    fn serialize(&self, value: &T) -> Result<Vec<u8>> {
        Ok(bincode::serialize(value)?)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<T> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Protobuf 消息 (prost)，schema 由 `.proto` 描述
#[cfg(feature = "proto")]
pub struct ProtoSerializer<M> {
    _marker: PhantomData<fn() -> M>,
}

#[cfg(feature = "proto")]
impl<M> ProtoSerializer<M> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

#[cfg(feature = "proto")]
impl<M> Default for ProtoSerializer<M> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "proto")]
impl<M> CacheSerializer<M> for ProtoSerializer<M>
where
    M: prost::Message + Default,
{
    fn serialize(&self, value: &M) -> Result<Vec<u8>> {
        Ok(value.encode_to_vec())
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<M> {
        Ok(M::decode(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct DiffSummary {
        files: u32,
        insertions: u64,
        paths: Vec<String>,
    }

    fn sample() -> DiffSummary {
        DiffSummary {
            files: 2,
            insertions: 41,
            paths: vec!["src/lib.rs".into(), "README.md".into()],
        }
    }

    #[test]
    fn test_string_serializer_rejects_invalid_utf8() {
        let ser = StringSerializer;
        assert_eq!(ser.deserialize(b"alice").unwrap(), "alice");
        assert!(ser.deserialize(&[0xff, 0xfe]).unwrap_err().is_codec());
    }

    #[test]
    fn test_json_and_bincode_round_trip_struct() {
        let json = JsonSerializer::<DiffSummary>::new();
        let bytes = json.serialize(&sample()).unwrap();
        assert_eq!(json.deserialize(&bytes).unwrap(), sample());

        let bin = BincodeSerializer::<DiffSummary>::new();
        let bytes = bin.serialize(&sample()).unwrap();
        assert_eq!(bin.deserialize(&bytes).unwrap(), sample());
    }

    #[test]
    fn test_bincode_detects_truncated_payload() {
        let bin = BincodeSerializer::<DiffSummary>::new();
        let bytes = bin.serialize(&sample()).unwrap();
        let err = bin.deserialize(&bytes[..bytes.len() / 2]).unwrap_err();
        assert!(err.is_codec());
    }

    #[cfg(feature = "proto")]
    #[test]
    fn test_proto_serializer() {
        #[derive(Clone, PartialEq, prost::Message)]
        struct PatchKey {
            #[prost(string, tag = "1")]
            old_id: String,
            #[prost(string, tag = "2")]
            new_id: String,
            #[prost(uint32, tag = "3")]
            context: u32,
        }

        let ser = ProtoSerializer::<PatchKey>::new();
        let key = PatchKey {
            old_id: "a1b2".into(),
            new_id: "c3d4".into(),
            context: 3,
        };
        let bytes = ser.serialize(&key).unwrap();
        assert_eq!(ser.deserialize(&bytes).unwrap(), key);
    }
}
