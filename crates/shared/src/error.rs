//! 统一错误处理模块
//!
//! 定义锁与缓存共用的错误类型，使用 thiserror 提供良好的错误信息。
//! 只有真正的故障（连接、序列化、配置）才以错误返回；
//! "未命中"、"已过期"、"释放时 owner 不匹配" 都是普通的返回值。

use thiserror::Error;

/// 系统错误类型
#[derive(Debug, Error)]
pub enum KeyguardError {
    // ==================== 存储错误 ====================
    #[error("存储不可达: {0}")]
    Connectivity(String),

    #[error("Redis 错误: {0}")]
    Redis(#[from] redis::RedisError),

    // ==================== 锁错误 ====================
    #[error("获取锁超时: key={key}, 已等待 {waited_ms}ms")]
    LockTimeout { key: String, waited_ms: u64 },

    // ==================== 序列化错误 ====================
    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    // ==================== 配置与参数错误 ====================
    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("无效的参数: {field} - {message}")]
    InvalidArgument { field: String, message: String },

    // ==================== 通用错误 ====================
    #[error("内部错误: {0}")]
    Internal(String),
}

/// 错误结果类型别名
pub type Result<T> = std::result::Result<T, KeyguardError>;

impl KeyguardError {
    /// 构造参数错误
    pub fn invalid_argument(field: &str, message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            field: field.to_string(),
            message: message.into(),
        }
    }

    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Connectivity(_) => "CONNECTIVITY_ERROR",
            Self::Redis(_) => "REDIS_ERROR",
            Self::LockTimeout { .. } => "LOCK_TIMEOUT",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::InvalidArgument { .. } => "INVALID_ARGUMENT",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// 是否为可重试错误
    ///
    /// 核心组件自身从不重试，这里只供调用方的重试策略判断使用。
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connectivity(_) | Self::Redis(_))
    }

    /// 是否为锁等待超时（资源繁忙）
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, Self::LockTimeout { .. })
    }
}
