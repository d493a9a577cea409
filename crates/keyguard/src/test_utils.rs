//! 测试工具模块
//!
//! 提供不依赖外部 Redis 的内存存储实现，语义与 Redis 原语一致：
//! 过期时间基于 `tokio::time::Instant`，配合 `tokio::time::pause()`
//! 可以在测试中快进租约与 TTL。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use keyguard_shared::error::{KeyguardError, Result};
use parking_lot::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use crate::store::KeyValueStore;

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

/// 过期时间点，超出时钟范围时视为不过期
fn expiry_after(expire_after: Duration) -> Option<Instant> {
    Instant::now().checked_add(expire_after)
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// 内存存储
///
/// 所有原语在同一把互斥锁内完成，因此与 Redis 一样是原子的。
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    offline: AtomicBool,
    operations: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 模拟存储不可达，之后所有原语返回 `Connectivity`
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// 已执行的原语次数（含失败）
    pub fn operation_count(&self) -> u64 {
        self.operations.load(Ordering::SeqCst)
    }

    /// 剩余存活时间，key 不存在或不过期时返回 None
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let entries = self.entries.lock();
        entries
            .get(key)
            .filter(|e| e.is_live(now))
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    /// 直接读取当前值，不计入操作次数
    pub fn peek(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        let entries = self.entries.lock();
        entries
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone())
    }

    fn check_online(&self) -> Result<()> {
        self.operations.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(KeyguardError::Connectivity(
                "memory store is offline".to_string(),
            ));
        }
        Ok(())
    }

    /// 在锁内执行，先清理已过期的目标 key
    fn with_entries<T>(&self, key: &str, f: impl FnOnce(&mut HashMap<String, Entry>) -> T) -> T {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        if entries.get(key).is_some_and(|e| !e.is_live(now)) {
            entries.remove(key);
        }
        f(&mut entries)
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn create_if_absent(
        &self,
        key: &str,
        value: &str,
        expire_after: Duration,
    ) -> Result<bool> {
        self.check_online()?;
        Ok(self.with_entries(key, |entries| {
            if entries.contains_key(key) {
                return false;
            }
            entries.insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    expires_at: expiry_after(expire_after),
                },
            );
            true
        }))
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        self.check_online()?;
        Ok(self.with_entries(key, |entries| {
            if entries.get(key).is_some_and(|e| e.value == expected) {
                entries.remove(key);
                true
            } else {
                false
            }
        }))
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check_online()?;
        Ok(self.with_entries(key, |entries| entries.get(key).map(|e| e.value.clone())))
    }

    async fn set(&self, key: &str, value: &str, expire_after: Option<Duration>) -> Result<bool> {
        self.check_online()?;
        self.with_entries(key, |entries| {
            entries.insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    expires_at: expire_after.and_then(expiry_after),
                },
            );
        });
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<u64> {
        self.check_online()?;
        Ok(self.with_entries(key, |entries| {
            u64::from(entries.remove(key).is_some())
        }))
    }

    async fn expire(&self, key: &str, expire_after: Duration) -> Result<bool> {
        self.check_online()?;
        Ok(self.with_entries(key, |entries| match entries.get_mut(key) {
            Some(entry) => {
                entry.expires_at = expiry_after(expire_after);
                true
            }
            None => false,
        }))
    }

    async fn ping(&self) -> Result<()> {
        self.check_online()
    }
}

/// 生成唯一的测试 key，避免并行测试互相干扰
pub fn test_key(prefix: &str) -> String {
    format!("{}:{}", prefix, Uuid::new_v4())
}

/// 测试用 Redis 地址
pub fn test_redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379/1".to_string())
}
