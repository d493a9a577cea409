//! 分布式锁管理器
//!
//! 互斥完全由存储端的原子"不存在才创建"原语仲裁，进程内不维护任何锁状态。

use chrono::{DateTime, Utc};
use keyguard_shared::config::LockSettings;
use keyguard_shared::error::{KeyguardError, Result};
use keyguard_shared::observability::metrics::{record_lock_acquire, record_lock_release};
use keyguard_shared::retry::RetryPolicy;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::store::{KeyValueStore, validate_expiry};

/// 两次抢锁之间的最短间隔
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// 锁配置
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// 默认等待时间
    pub acquire_timeout: Duration,
    /// 默认租约时长
    pub lease_duration: Duration,
    /// 抢锁失败后的退避策略，只使用其中的间隔计算
    pub backoff: RetryPolicy,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            acquire_timeout: Duration::from_secs(3),
            lease_duration: Duration::from_secs(960),
            backoff: RetryPolicy::fixed(Duration::from_millis(100)),
        }
    }
}

impl From<&LockSettings> for LockConfig {
    fn from(settings: &LockSettings) -> Self {
        let initial = Duration::from_millis(settings.retry_delay_ms);
        let max = Duration::from_millis(settings.max_retry_delay_ms.max(settings.retry_delay_ms));
        Self {
            acquire_timeout: settings.acquire_timeout(),
            lease_duration: settings.lease_duration(),
            backoff: RetryPolicy {
                max_retries: u32::MAX,
                initial_delay: initial,
                max_delay: max,
                multiplier: if max > initial { 2.0 } else { 1.0 },
            },
        }
    }
}

/// 分布式锁管理器
pub struct LockManager {
    store: Arc<dyn KeyValueStore>,
    config: LockConfig,
    /// 实例唯一标识，用于区分不同服务实例持有的锁
    instance_id: String,
}

impl LockManager {
    pub fn new(store: Arc<dyn KeyValueStore>, config: LockConfig) -> Self {
        Self {
            store,
            config,
            instance_id: Uuid::new_v4().to_string(),
        }
    }

    /// 使用默认配置创建锁管理器
    pub fn with_defaults(store: Arc<dyn KeyValueStore>) -> Self {
        Self::new(store, LockConfig::default())
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// owner 格式: instance_id:uuid，每次抢锁尝试都生成新的 token
    fn new_owner_token(&self) -> String {
        format!("{}:{}", self.instance_id, Uuid::new_v4())
    }

    fn validate(key: &str, lease_duration: Duration) -> Result<()> {
        if key.trim().is_empty() {
            return Err(KeyguardError::invalid_argument("key", "锁的 key 不能为空"));
        }
        // 租约必须是存储端可以表达的有限时长
        validate_expiry("lease_duration", lease_duration)
    }

    /// 获取锁
    ///
    /// 在 `acquire_timeout` 内反复尝试原子创建，成功返回持有中的 [`LockHandle`]，
    /// 超时返回 `LockTimeout`。存储错误立即向上传播，不在循环内重试。
    /// `acquire_timeout` 超出时钟可表示的范围（如 `Duration::MAX`）时一直等待。
    ///
    /// 若受保护的工作超过 `lease_duration`，租约会自动过期，其他调用方可能在
    /// 本持有者仍认为自己持锁时拿到同一把锁，租约需要比预期工作时间宽裕得多。
    #[instrument(skip(self), fields(instance_id = %self.instance_id))]
    pub async fn acquire(
        &self,
        key: &str,
        acquire_timeout: Duration,
        lease_duration: Duration,
    ) -> Result<LockHandle> {
        Self::validate(key, lease_duration)?;

        let owner = self.new_owner_token();
        let started = Instant::now();
        let deadline = started.checked_add(acquire_timeout);
        let mut attempt: u32 = 0;

        loop {
            let attempt_started = Instant::now();
            match self.store.create_if_absent(key, &owner, lease_duration).await {
                Ok(true) => {
                    let waited = started.elapsed();
                    record_lock_acquire("acquired", waited.as_secs_f64());
                    debug!(key = %key, owner = %owner, attempt, "Lock acquired");
                    return Ok(LockHandle::held(
                        key.to_string(),
                        owner,
                        attempt_started,
                        lease_duration,
                    ));
                }
                Ok(false) => {}
                Err(e) => {
                    record_lock_acquire("error", started.elapsed().as_secs_f64());
                    warn!(key = %key, error = %e, "Lock acquisition failed on store error");
                    return Err(e);
                }
            }

            let now = Instant::now();
            if deadline.is_some_and(|deadline| now >= deadline) {
                let waited = now.duration_since(started);
                record_lock_acquire("timeout", waited.as_secs_f64());
                debug!(key = %key, attempts = attempt + 1, "Lock not acquired before timeout");
                return Err(KeyguardError::LockTimeout {
                    key: key.to_string(),
                    waited_ms: waited.as_millis() as u64,
                });
            }

            let mut delay = self
                .config
                .backoff
                .delay_for_attempt(attempt)
                .max(MIN_POLL_INTERVAL);
            if let Some(deadline) = deadline {
                delay = delay.min(deadline - now);
            }
            tokio::time::sleep(delay).await;
            attempt = attempt.saturating_add(1);
        }
    }

    /// 使用配置中的默认等待时间与租约获取锁
    pub async fn acquire_default(&self, key: &str) -> Result<LockHandle> {
        self.acquire(key, self.config.acquire_timeout, self.config.lease_duration)
            .await
    }

    /// 尝试获取锁，不重试
    ///
    /// 如果锁不可用立即返回 None，不会阻塞等待。
    #[instrument(skip(self), fields(instance_id = %self.instance_id))]
    pub async fn try_acquire(
        &self,
        key: &str,
        lease_duration: Duration,
    ) -> Result<Option<LockHandle>> {
        Self::validate(key, lease_duration)?;

        let owner = self.new_owner_token();
        let attempt_started = Instant::now();
        if self.store.create_if_absent(key, &owner, lease_duration).await? {
            record_lock_acquire("acquired", 0.0);
            Ok(Some(LockHandle::held(
                key.to_string(),
                owner,
                attempt_started,
                lease_duration,
            )))
        } else {
            record_lock_acquire("busy", 0.0);
            Ok(None)
        }
    }

    /// 释放锁
    ///
    /// 原子比较 owner 后删除。owner 不匹配（租约已过期、锁已被他人持有）
    /// 返回 `Ok(false)`，这是预期内的结果而非错误。
    #[instrument(skip(self, handle), fields(key = %handle.key))]
    pub async fn release(&self, mut handle: LockHandle) -> Result<bool> {
        handle.held = false;
        let released = self
            .store
            .compare_and_delete(&handle.key, &handle.owner_token)
            .await?;

        if released {
            record_lock_release("released");
            debug!(key = %handle.key, "Lock released");
        } else {
            record_lock_release("mismatch");
            // 锁已经不存在或被其他客户端持有，这通常表示租约已过期
            warn!(
                key = %handle.key,
                owner = %handle.owner_token,
                lease_expired = handle.is_lease_expired(),
                "Lock was already released or owned by another client"
            );
        }

        Ok(released)
    }

    /// 在锁内执行 `work`
    ///
    /// 无论 `work` 成功与否都会尝试释放锁；`work` 的错误优先返回。
    pub async fn with_lock<F, Fut, T>(
        &self,
        key: &str,
        acquire_timeout: Duration,
        lease_duration: Duration,
        work: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let handle = self.acquire(key, acquire_timeout, lease_duration).await?;
        let outcome = work().await;
        let released = self.release(handle).await;

        match (outcome, released) {
            (Ok(value), Ok(_)) => Ok(value),
            (Ok(_), Err(release_err)) => Err(release_err),
            (Err(work_err), Err(release_err)) => {
                warn!(key = %key, error = %release_err, "Lock release failed after work error");
                Err(work_err)
            }
            (Err(work_err), Ok(_)) => Err(work_err),
        }
    }
}

/// 锁句柄
///
/// 由获取锁的调用方独占，不可克隆。真正的释放由存储端完成：
/// 显式 `release` 时按 owner 原子删除，否则等租约到期自动删除。
pub struct LockHandle {
    key: String,
    owner_token: String,
    acquired_at: DateTime<Utc>,
    lease_expiry: DateTime<Utc>,
    /// 本地租约截止时间，从发起抢锁时算起，不晚于存储端的实际过期时间；
    /// 超出时钟范围时为 None
    lease_deadline: Option<Instant>,
    held: bool,
}

impl LockHandle {
    fn held(key: String, owner_token: String, attempt_started: Instant, lease: Duration) -> Self {
        let acquired_at = Utc::now();
        let lease_expiry = chrono::Duration::from_std(lease)
            .ok()
            .and_then(|lease| acquired_at.checked_add_signed(lease))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            key,
            owner_token,
            acquired_at,
            lease_expiry,
            lease_deadline: attempt_started.checked_add(lease),
            held: true,
        }
    }

    /// 获取锁的 key
    pub fn key(&self) -> &str {
        &self.key
    }

    /// 获取锁的 owner
    pub fn owner_token(&self) -> &str {
        &self.owner_token
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    /// 存储端自动释放的时间点
    pub fn lease_expiry(&self) -> DateTime<Utc> {
        self.lease_expiry
    }

    pub fn is_held(&self) -> bool {
        self.held
    }

    pub fn is_lease_expired(&self) -> bool {
        self.lease_deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// 租约剩余时间，已过期返回 0
    pub fn lease_remaining(&self) -> Duration {
        match self.lease_deadline {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()),
            None => Duration::MAX,
        }
    }
}

impl std::fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockHandle")
            .field("key", &self.key)
            .field("owner_token", &self.owner_token)
            .field("lease_expiry", &self.lease_expiry)
            .field("held", &self.held)
            .finish()
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if self.held {
            // Drop 中无法执行异步操作，锁最终会通过租约过期自动释放
            warn!(
                lock_key = %self.key,
                owner = %self.owner_token,
                "LockHandle dropped without explicit release - lock will expire via lease"
            );
        }
    }
}
