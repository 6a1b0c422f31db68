//! # Codec Module
//!
//! 键与值的显式编解码。

pub mod key;
pub mod serializer;

pub use key::{ColumnType, EncodedKey, KeyCodec, MAX_TEXT_KEY_LEN};
#[cfg(feature = "proto")]
pub use serializer::ProtoSerializer;
pub use serializer::{
    BincodeSerializer, BytesSerializer, CacheSerializer, JsonSerializer, StringSerializer,
};
