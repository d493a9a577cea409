//! 存储原语
//!
//! 锁与缓存只依赖这里的六个原语，每个原语都是对存储的一次原子往返。
//! [`RedisStore`] 基于 [`ConnectionProvider`] 实现，每次调用借出一个连接，
//! 无论成功与否都在返回前归还。

use async_trait::async_trait;
use keyguard_shared::error::{KeyguardError, Result};
use redis::{AsyncCommands, RedisError, RedisResult, Script};
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

use crate::connection::ConnectionProvider;

/// 只有当前值等于 ARGV[1] 时才删除，检查与删除在服务端原子完成
const COMPARE_AND_DELETE_SCRIPT: &str = r#"
    if redis.call("get", KEYS[1]) == ARGV[1] then
        return redis.call("del", KEYS[1])
    else
        return 0
    end
"#;

/// Redis `PX` / `PEXPIRE` 接受的最大毫秒数
pub const MAX_EXPIRY: Duration = Duration::from_millis(i64::MAX as u64);

/// 校验租约或缓存过期时间：至少 1 毫秒，且不超过 [`MAX_EXPIRY`]
pub fn validate_expiry(field: &str, expire_after: Duration) -> Result<()> {
    if expire_after.as_millis() == 0 {
        return Err(KeyguardError::invalid_argument(
            field,
            "过期时间必须至少 1 毫秒",
        ));
    }
    if expire_after > MAX_EXPIRY {
        return Err(KeyguardError::invalid_argument(
            field,
            format!("过期时间不能超过 {} 毫秒", MAX_EXPIRY.as_millis()),
        ));
    }
    Ok(())
}

/// 键值存储原语
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// 仅当 key 不存在时写入并设置过期时间，成功返回 true
    async fn create_if_absent(
        &self,
        key: &str,
        value: &str,
        expire_after: Duration,
    ) -> Result<bool>;

    /// 仅当 key 的当前值等于 `expected` 时删除，删除了返回 true
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// 覆盖写入；`expire_after` 为 None 时不过期
    async fn set(&self, key: &str, value: &str, expire_after: Option<Duration>) -> Result<bool>;

    /// 返回实际删除的 key 数量
    async fn delete(&self, key: &str) -> Result<u64>;

    /// 重新设置过期时间，key 不存在返回 false
    async fn expire(&self, key: &str, expire_after: Duration) -> Result<bool>;

    async fn ping(&self) -> Result<()>;
}

/// 把 Redis 错误归类：网络层故障视为存储不可达，其余原样传播
pub(crate) fn store_error(err: RedisError) -> KeyguardError {
    if err.is_io_error()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
        || err.is_timeout()
    {
        KeyguardError::Connectivity(err.to_string())
    } else {
        KeyguardError::Redis(err)
    }
}

/// 连接层故障或主节点已降级为只读副本，缓存的连接需要丢弃
pub(crate) fn needs_reconnect(err: &RedisError) -> bool {
    err.is_io_error()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
        || err.is_timeout()
        || err.code() == Some("READONLY")
}

/// 毫秒精度的过期时间，限制在 1ms 到 [`MAX_EXPIRY`] 之间
fn expire_millis(expire_after: Duration) -> u64 {
    u64::try_from(expire_after.as_millis())
        .unwrap_or(u64::MAX)
        .clamp(1, MAX_EXPIRY.as_millis() as u64)
}

/// 基于 Redis 的存储实现
#[derive(Clone)]
pub struct RedisStore {
    provider: Arc<ConnectionProvider>,
    compare_and_delete: Script,
}

impl RedisStore {
    pub fn new(provider: Arc<ConnectionProvider>) -> Self {
        Self {
            provider,
            compare_and_delete: Script::new(COMPARE_AND_DELETE_SCRIPT),
        }
    }

    pub fn provider(&self) -> &ConnectionProvider {
        &self.provider
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    /// SET key value NX PX milliseconds
    #[instrument(skip(self, value))]
    async fn create_if_absent(
        &self,
        key: &str,
        value: &str,
        expire_after: Duration,
    ) -> Result<bool> {
        let mut conn = self.provider.borrow().await?;
        let result = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(expire_millis(expire_after))
            .query_async::<Option<String>>(&mut *conn)
            .await;

        // NX 成功时返回 "OK"，key 已存在时返回 nil
        Ok(self.provider.release(conn, result).await?.is_some())
    }

    #[instrument(skip(self, expected))]
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        let mut conn = self.provider.borrow().await?;
        let result = self
            .compare_and_delete
            .key(key)
            .arg(expected)
            .invoke_async::<i64>(&mut *conn)
            .await;

        Ok(self.provider.release(conn, result).await? > 0)
    }

    #[instrument(skip(self))]
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.provider.borrow().await?;
        let result: RedisResult<Option<String>> = conn.get(key).await;
        self.provider.release(conn, result).await
    }

    #[instrument(skip(self, value))]
    async fn set(&self, key: &str, value: &str, expire_after: Option<Duration>) -> Result<bool> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = expire_after {
            // 值与过期时间在同一条命令中写入
            cmd.arg("PX").arg(expire_millis(ttl));
        }

        let mut conn = self.provider.borrow().await?;
        let result = cmd.query_async::<Option<String>>(&mut *conn).await;

        Ok(self.provider.release(conn, result).await?.as_deref() == Some("OK"))
    }

    #[instrument(skip(self))]
    async fn delete(&self, key: &str) -> Result<u64> {
        let mut conn = self.provider.borrow().await?;
        let result: RedisResult<u64> = conn.del(key).await;
        self.provider.release(conn, result).await
    }

    #[instrument(skip(self))]
    async fn expire(&self, key: &str, expire_after: Duration) -> Result<bool> {
        let mut conn = self.provider.borrow().await?;
        let result = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(expire_millis(expire_after))
            .query_async::<i64>(&mut *conn)
            .await;

        Ok(self.provider.release(conn, result).await? == 1)
    }

    async fn ping(&self) -> Result<()> {
        self.provider.health_check().await
    }
}
