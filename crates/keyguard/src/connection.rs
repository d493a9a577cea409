//! 存储连接提供者
//!
//! 根据启动时确定的 [`StoreMode`] 提供到当前主节点的连接。
//! 连接是可克隆的多路复用连接，建立后缓存复用；只有命令遇到连接层故障
//! 或主节点只读（已降级为副本）时才丢弃缓存。哨兵模式下重新建立连接前
//! 会向哨兵询问当前主节点，因此主从切换后的下一次借出会指向新的主节点。

use keyguard_shared::config::{RedisConfig, StoreMode};
use keyguard_shared::error::{KeyguardError, Result};
use keyguard_shared::observability::metrics::record_connection_error;
use redis::aio::MultiplexedConnection;
use redis::sentinel::Sentinel;
use redis::{Client, RedisResult};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, trace, warn};

use crate::store::{needs_reconnect, store_error};

enum Backend {
    Standalone(Client),
    Sentinel {
        // 哨兵查询需要 &mut
        sentinel: Mutex<Sentinel>,
        master_name: String,
    },
}

/// 缓存的连接，generation 用于避免旧连接的失败把新连接一起丢弃
struct Cached {
    generation: u64,
    conn: MultiplexedConnection,
}

/// 连接提供者
///
/// 模式在构造时固定，进程生命周期内不会切换。
pub struct ConnectionProvider {
    mode: StoreMode,
    backend: Backend,
    cached: Mutex<Option<Cached>>,
    generation: AtomicU64,
}

impl ConnectionProvider {
    /// 按已校验的模式创建提供者
    ///
    /// 此处不建立网络连接，地址格式错误返回 `Configuration`。
    pub fn new(mode: StoreMode) -> Result<Self> {
        let backend = match &mode {
            StoreMode::Standalone { url } => {
                let client = Client::open(url.as_str()).map_err(|e| {
                    KeyguardError::Configuration(format!("无效的 Redis 地址 {}: {}", url, e))
                })?;
                Backend::Standalone(client)
            }
            StoreMode::Sentinel { nodes, master_name } => {
                let sentinel = Sentinel::build(nodes.clone()).map_err(|e| {
                    KeyguardError::Configuration(format!("无效的哨兵地址 {:?}: {}", nodes, e))
                })?;
                Backend::Sentinel {
                    sentinel: Mutex::new(sentinel),
                    master_name: master_name.clone(),
                }
            }
        };

        info!(mode = mode.name(), "Store connection provider created");
        Ok(Self {
            mode,
            backend,
            cached: Mutex::new(None),
            generation: AtomicU64::new(0),
        })
    }

    /// 从配置创建提供者，模式开关非法时直接失败
    pub fn from_config(config: &RedisConfig) -> Result<Self> {
        Self::new(config.mode()?)
    }

    pub fn mode(&self) -> &StoreMode {
        &self.mode
    }

    /// 借出一个连接
    ///
    /// 有缓存时直接克隆；否则解析主节点并建立连接，并发的借出方等待同一次连接。
    /// 存储不可达时返回 `Connectivity`，本层不做重试。
    #[instrument(skip(self), fields(mode = self.mode.name()))]
    pub async fn borrow(&self) -> Result<Connection> {
        let mut cached = self.cached.lock().await;
        if let Some(c) = cached.as_ref() {
            trace!(generation = c.generation, "Store connection borrowed");
            return Ok(self.wrap(c.generation, c.conn.clone()));
        }

        match self.connect().await {
            Ok(conn) => {
                let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                debug!(generation, "Store connection established");
                *cached = Some(Cached {
                    generation,
                    conn: conn.clone(),
                });
                Ok(self.wrap(generation, conn))
            }
            Err(e) => {
                record_connection_error(self.mode.name());
                warn!(error = %e, "Failed to borrow store connection");
                Err(KeyguardError::Connectivity(e.to_string()))
            }
        }
    }

    async fn connect(&self) -> RedisResult<MultiplexedConnection> {
        match &self.backend {
            Backend::Standalone(client) => client.get_multiplexed_async_connection().await,
            Backend::Sentinel {
                sentinel,
                master_name,
            } => {
                let master = {
                    let mut sentinel = sentinel.lock().await;
                    sentinel.async_master_for(master_name, None).await?
                };
                master.get_multiplexed_async_connection().await
            }
        }
    }

    fn wrap(&self, generation: u64, inner: MultiplexedConnection) -> Connection {
        Connection {
            inner,
            generation,
            mode: self.mode.name(),
        }
    }

    /// 归还连接并转换命令结果
    ///
    /// 连接层故障或 READONLY 时丢弃对应的缓存连接，下次借出重新建立。
    pub async fn release<T>(&self, conn: Connection, result: RedisResult<T>) -> Result<T> {
        trace!(mode = conn.mode, "Store connection released");
        match result {
            Ok(value) => Ok(value),
            Err(e) => {
                if needs_reconnect(&e) {
                    self.invalidate(conn.generation).await;
                }
                Err(store_error(e))
            }
        }
    }

    /// 丢弃指定代次的缓存连接，已被替换的新连接不受影响
    async fn invalidate(&self, generation: u64) {
        let mut cached = self.cached.lock().await;
        if cached.as_ref().is_some_and(|c| c.generation == generation) {
            *cached = None;
            warn!(
                mode = self.mode.name(),
                generation, "Cached store connection discarded"
            );
        }
    }

    /// 健康检查
    pub async fn health_check(&self) -> Result<()> {
        let mut conn = self.borrow().await?;
        let pong = redis::cmd("PING").query_async::<String>(&mut *conn).await;
        self.release(conn, pong).await.map(|_| ())
    }
}

/// 借出的连接
pub struct Connection {
    inner: MultiplexedConnection,
    generation: u64,
    mode: &'static str,
}

impl Connection {
    pub fn mode(&self) -> &'static str {
        self.mode
    }

    /// 所属的连接代次，每次重新建立连接加一
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Deref for Connection {
    type Target = MultiplexedConnection;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for Connection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}
