//! 缓存模块
//!
//! 提供字符串与对象的读写删除。每个操作是一次存储往返，
//! 连接的借出与归还由底层 [`KeyValueStore`] 负责。

use keyguard_shared::error::{KeyguardError, Result};
use keyguard_shared::observability::metrics::record_cache_operation;
use serde::{Serialize, de::DeserializeOwned};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

use crate::store::{KeyValueStore, validate_expiry};

/// 缓存过期策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    /// 不过期，直到显式删除
    Persistent,
    /// 写入后经过指定时长过期
    Expires(Duration),
}

impl Ttl {
    /// 从秒数构造，`-1` 表示不过期
    pub fn from_secs(secs: i64) -> Result<Self> {
        match secs {
            -1 => Ok(Self::Persistent),
            s if s > 0 => Ok(Self::Expires(Duration::from_secs(s as u64))),
            s => Err(KeyguardError::invalid_argument(
                "ttl",
                format!("过期时间必须为正数或 -1，实际为 {}", s),
            )),
        }
    }

    fn as_expiry(&self) -> Option<Duration> {
        match self {
            Self::Persistent => None,
            Self::Expires(ttl) => Some(*ttl),
        }
    }
}

impl From<Duration> for Ttl {
    fn from(ttl: Duration) -> Self {
        Self::Expires(ttl)
    }
}

/// 缓存客户端
#[derive(Clone)]
pub struct CacheStore {
    store: Arc<dyn KeyValueStore>,
}

impl CacheStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// 缓存字符串
    #[instrument(skip(self, value))]
    pub async fn set_string(&self, key: &str, value: &str, ttl: Ttl) -> Result<bool> {
        if let Ttl::Expires(expire_after) = ttl {
            validate_expiry("ttl", expire_after)?;
        }
        let written = self.store.set(key, value, ttl.as_expiry()).await?;
        record_cache_operation("set", if written { "ok" } else { "rejected" });
        Ok(written)
    }

    /// 获取字符串
    #[instrument(skip(self))]
    pub async fn get_string(&self, key: &str) -> Result<Option<String>> {
        let value = self.store.get(key).await?;
        record_cache_operation("get", if value.is_some() { "hit" } else { "miss" });
        Ok(value)
    }

    /// 序列化后缓存对象，写入确认后返回 true
    #[instrument(skip(self, value))]
    pub async fn set_object<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Ttl,
    ) -> Result<bool> {
        let serialized = serde_json::to_string(value)?;
        self.set_string(key, &serialized, ttl).await
    }

    /// 获取并反序列化对象
    ///
    /// key 不存在或值为空时返回 None，内容无法解析时返回 `Serialization`。
    #[instrument(skip(self))]
    pub async fn get_object<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get_string(key).await? {
            Some(payload) if !payload.is_empty() => {
                let parsed: T = serde_json::from_str(&payload)?;
                Ok(Some(parsed))
            }
            _ => Ok(None),
        }
    }

    /// 删除，仅当确实删除了 key 时返回 true
    #[instrument(skip(self))]
    pub async fn del(&self, key: &str) -> Result<bool> {
        let removed = self.store.delete(key).await? > 0;
        record_cache_operation("del", if removed { "removed" } else { "absent" });
        debug!(key = %key, removed, "Cache entry deleted");
        Ok(removed)
    }

    /// 重新设置过期时间，key 不存在返回 false
    pub async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        validate_expiry("ttl", ttl)?;
        self.store.expire(key, ttl).await
    }

    /// 检查键是否存在
    pub async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.store.get(key).await?.is_some())
    }

    /// 健康检查
    pub async fn health_check(&self) -> Result<()> {
        self.store.ping().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MockKeyValueStore;
    use crate::test_utils::MemoryStore;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Contract {
        no: String,
        amount: i64,
    }

    #[test]
    fn test_ttl_from_secs() {
        assert_eq!(Ttl::from_secs(-1).unwrap(), Ttl::Persistent);
        assert_eq!(
            Ttl::from_secs(30).unwrap(),
            Ttl::Expires(Duration::from_secs(30))
        );
        assert!(Ttl::from_secs(0).is_err());
        assert!(Ttl::from_secs(-5).is_err());
    }

    #[tokio::test]
    async fn test_set_object_reports_success() {
        let cache = CacheStore::new(Arc::new(MemoryStore::new()));
        let contract = Contract {
            no: "C123".to_string(),
            amount: 1_000,
        };

        assert!(cache.set_object("contract", &contract, Ttl::Persistent).await.unwrap());
        let loaded: Option<Contract> = cache.get_object("contract").await.unwrap();
        assert_eq!(loaded, Some(contract));
    }

    #[tokio::test]
    async fn test_get_object_empty_payload_is_none() {
        let cache = CacheStore::new(Arc::new(MemoryStore::new()));
        cache.set_string("empty", "", Ttl::Persistent).await.unwrap();

        let loaded: Option<Contract> = cache.get_object("empty").await.unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn test_get_object_malformed_payload_is_serialization_error() {
        let cache = CacheStore::new(Arc::new(MemoryStore::new()));
        cache.set_string("bad", "{not json", Ttl::Persistent).await.unwrap();

        let err = cache.get_object::<Contract>("bad").await.unwrap_err();
        assert_eq!(err.code(), "SERIALIZATION_ERROR");
    }

    #[tokio::test]
    async fn test_zero_ttl_rejected() {
        let cache = CacheStore::new(Arc::new(MemoryStore::new()));
        let err = cache
            .set_string("k", "v", Ttl::Expires(Duration::ZERO))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_ARGUMENT");
    }

    #[tokio::test]
    async fn test_oversized_ttl_rejected_before_store_call() {
        let mut store = MockKeyValueStore::new();
        store.expect_set().times(0);
        store.expect_expire().times(0);

        let cache = CacheStore::new(Arc::new(store));
        let oversized = Duration::from_secs(u64::MAX / 1000 + 1);
        let err = cache
            .set_string("k", "v", Ttl::Expires(oversized))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_ARGUMENT");

        let huge = Ttl::from_secs(i64::MAX).unwrap();
        assert!(cache.set_object("k", &1, huge).await.is_err());
        assert!(cache.expire("k", Duration::MAX).await.is_err());
    }

    #[tokio::test]
    async fn test_store_error_propagates_unchanged() {
        let mut store = MockKeyValueStore::new();
        store
            .expect_get()
            .times(1)
            .returning(|_| Err(KeyguardError::Connectivity("sentinels down".to_string())));
        store
            .expect_delete()
            .times(1)
            .returning(|_| Err(KeyguardError::Connectivity("sentinels down".to_string())));

        let cache = CacheStore::new(Arc::new(store));
        assert_eq!(
            cache.get_string("k").await.unwrap_err().code(),
            "CONNECTIVITY_ERROR"
        );
        assert_eq!(cache.del("k").await.unwrap_err().code(), "CONNECTIVITY_ERROR");
    }

    #[tokio::test]
    async fn test_set_string_passes_expiry() {
        let mut store = MockKeyValueStore::new();
        store
            .expect_set()
            .withf(|key, value, ttl| {
                key == "greeting" && value == "hi" && *ttl == Some(Duration::from_secs(1))
            })
            .times(1)
            .returning(|_, _, _| Ok(true));

        let cache = CacheStore::new(Arc::new(store));
        assert!(
            cache
                .set_string("greeting", "hi", Ttl::from_secs(1).unwrap())
                .await
                .unwrap()
        );
    }
}
