//! 分布式锁模块
//!
//! ## 设计理念
//!
//! - **存储仲裁**: 互斥由存储端的原子 `SET NX PX` 保证，进程内不加锁
//! - **租约兜底**: 持有者崩溃后锁随租约过期自动释放，不允许无限租约
//! - **按 owner 释放**: 释放时原子比较 owner 再删除，不会误删他人的锁
//!
//! ## 使用示例
//!
//! ```ignore
//! let manager = LockManager::new(store, LockConfig::default());
//!
//! let key = LockKey::single_payment("C123");
//! let handle = manager
//!     .acquire(&key, Duration::from_secs(3), Duration::from_secs(960))
//!     .await?;
//!
//! do_critical_work().await?;
//!
//! // 返回 false 表示租约已过期且锁已被他人持有
//! manager.release(handle).await?;
//! ```

mod key_builder;
mod lock_manager;

pub use key_builder::{LockKey, LockScope};
pub use lock_manager::{LockConfig, LockHandle, LockManager};
