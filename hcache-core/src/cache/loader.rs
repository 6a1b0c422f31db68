//! 缓存加载器
//!
//! 绑定在缓存定义上的默认加载逻辑，供 `get_loaded` / `get_all`
//! 以及 refresh-after-write 的后台重载使用。

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

/// 按键计算缓存值
#[async_trait]
pub trait CacheLoader<K, V>: Send + Sync {
    async fn load(&self, key: &K) -> anyhow::Result<V>;
}

/// 用闭包实现的加载器
pub struct FnLoader<F> {
    f: F,
}

impl<F> FnLoader<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<K, V, F> CacheLoader<K, V> for FnLoader<F>
where
    K: Send + Sync,
    V: Send,
    F: Fn(&K) -> anyhow::Result<V> + Send + Sync,
{
    async fn load(&self, key: &K) -> anyhow::Result<V> {
        (self.f)(key)
    }
}

/// 加载失败的错误，同一次加载的所有等待者共享
#[derive(Debug, Clone)]
pub struct SharedLoadError(Arc<anyhow::Error>);

impl SharedLoadError {
    pub fn new(error: anyhow::Error) -> Self {
        Self(Arc::new(error))
    }
}

impl fmt::Display for SharedLoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for SharedLoadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        (**self.0).source()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_error_keeps_chain() {
        let inner = anyhow::anyhow!("connection refused").context("loading change 42");
        let shared = SharedLoadError::new(inner);
        let copy = shared.clone();

        let outer = anyhow::Error::new(copy);
        assert_eq!(outer.to_string(), "loading change 42");
        assert_eq!(format!("{:#}", outer), "loading change 42: connection refused");
    }
}
