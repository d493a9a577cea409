//! Redis 分布式锁与缓存
//!
//! 存储可以是单机 Redis，也可以经由哨兵发现主节点。
//!
//! ```ignore
//! let provider = Arc::new(ConnectionProvider::from_config(&config.redis)?);
//! let store: Arc<dyn KeyValueStore> = Arc::new(RedisStore::new(provider));
//!
//! let locks = LockManager::new(store.clone(), LockConfig::from(&config.lock));
//! let cache = CacheStore::new(store);
//! ```

pub mod cache;
pub mod connection;
pub mod lock;
pub mod store;
pub mod test_utils;

pub use cache::{CacheStore, Ttl};
pub use connection::{Connection, ConnectionProvider};
pub use lock::{LockConfig, LockHandle, LockKey, LockManager, LockScope};
pub use store::{KeyValueStore, RedisStore};

pub use keyguard_shared::error::{KeyguardError, Result};
