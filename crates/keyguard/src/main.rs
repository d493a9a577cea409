//! keyguard 命令行
//!
//! 读取配置连接到单机或哨兵模式的 Redis，提供缓存读写与加锁演练。

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use keyguard::{
    CacheStore, ConnectionProvider, KeyValueStore, LockConfig, LockKey, LockManager, RedisStore,
    Ttl,
};
use keyguard_shared::{
    config::AppConfig,
    error::KeyguardError,
    observability,
    retry::{RetryPolicy, retry_with_policy},
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "keyguard", version, about = "Redis distributed lock and cache tool")]
struct Cli {
    /// 服务名，决定额外加载的 config/{service}.toml
    #[arg(long, env = "KEYGUARD_SERVICE", default_value = "keyguard")]
    service: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// 检查存储连通性
    Ping,
    /// 读取字符串
    Get { key: String },
    /// 写入字符串，ttl 为 -1 表示不过期
    Set {
        key: String,
        value: String,
        #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
        ttl: i64,
    },
    /// 删除 key
    Del { key: String },
    /// 获取任意 key 的锁，持有一段时间后释放
    Lock {
        key: String,
        #[command(flatten)]
        opts: LockOpts,
    },
    /// 按合同编号获取单笔扣款锁
    PaymentLock {
        contract_no: String,
        #[command(flatten)]
        opts: LockOpts,
    },
}

#[derive(Debug, Args)]
struct LockOpts {
    /// 等待时间，默认取配置
    #[arg(long)]
    timeout_ms: Option<u64>,
    /// 租约时长，默认取配置
    #[arg(long)]
    lease_ms: Option<u64>,
    /// 拿到锁后持有的时间
    #[arg(long, default_value_t = 0)]
    hold_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    // 1. 加载配置，任何错误都直接退出
    let config = AppConfig::load(&cli.service)?;

    // 2. 初始化可观测性
    let _guard = observability::init(&config.observability, &config.service_name)?;
    info!(environment = %config.environment, "Configuration loaded");

    // 3. 模式开关非法时直接退出
    let provider = Arc::new(ConnectionProvider::from_config(&config.redis)?);
    info!(mode = provider.mode().name(), "Store provider ready");

    let store: Arc<dyn KeyValueStore> = Arc::new(RedisStore::new(provider));
    let cache = CacheStore::new(store.clone());
    let locks = LockManager::new(store.clone(), LockConfig::from(&config.lock));

    // 连接错误由调用方决定是否重试
    let retry = RetryPolicy {
        max_retries: 2,
        initial_delay: Duration::from_millis(200),
        max_delay: Duration::from_secs(2),
        multiplier: 2.0,
    };

    match cli.command {
        Command::Ping => {
            retry_with_policy(&retry, "ping", KeyguardError::is_retryable, || store.ping())
                .await?;
            println!("PONG");
        }
        Command::Get { key } => {
            let value = retry_with_policy(&retry, "get", KeyguardError::is_retryable, || {
                cache.get_string(&key)
            })
            .await?;
            match value {
                Some(v) => println!("{}", v),
                None => println!("(nil)"),
            }
        }
        Command::Set { key, value, ttl } => {
            let ttl = Ttl::from_secs(ttl)?;
            let written = retry_with_policy(&retry, "set", KeyguardError::is_retryable, || {
                cache.set_string(&key, &value, ttl)
            })
            .await?;
            println!("{}", if written { "OK" } else { "FAILED" });
        }
        Command::Del { key } => {
            let removed = retry_with_policy(&retry, "del", KeyguardError::is_retryable, || {
                cache.del(&key)
            })
            .await?;
            println!("{}", u8::from(removed));
        }
        Command::Lock { key, opts } => run_lock(&locks, &key, &opts).await?,
        Command::PaymentLock { contract_no, opts } => {
            run_lock(&locks, &LockKey::single_payment(&contract_no), &opts).await?
        }
    }

    Ok(())
}

async fn run_lock(locks: &LockManager, key: &str, opts: &LockOpts) -> Result<()> {
    let acquire_timeout = opts
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(locks.config().acquire_timeout);
    let lease = opts
        .lease_ms
        .map(Duration::from_millis)
        .unwrap_or(locks.config().lease_duration);

    let handle = match locks.acquire(key, acquire_timeout, lease).await {
        Ok(handle) => handle,
        Err(e) if e.is_lock_timeout() => {
            println!("BUSY {}", key);
            return Err(e.into());
        }
        Err(e) => return Err(e.into()),
    };
    println!("ACQUIRED {} lease_expiry={}", key, handle.lease_expiry());

    if opts.hold_ms > 0 {
        tokio::time::sleep(Duration::from_millis(opts.hold_ms)).await;
    }

    if locks.release(handle).await? {
        println!("RELEASED {}", key);
    } else {
        warn!(key = %key, "Lease expired before release");
        println!("EXPIRED {}", key);
    }
    Ok(())
}
