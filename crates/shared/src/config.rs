//! 配置管理模块
//!
//! 支持多格式配置文件加载，环境变量覆盖，以及类型安全的配置访问。
//! 存储模式（单机 / 哨兵）在进程启动时确定，之后不可变更。

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::error::{KeyguardError, Result};

/// 哨兵配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SentinelConfig {
    /// 哨兵节点地址列表，如 `redis://10.0.0.1:26379`
    pub nodes: Vec<String>,
    /// 主节点逻辑名称
    pub master_name: String,
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self {
            nodes: vec!["redis://localhost:26379".to_string()],
            master_name: "mymaster".to_string(),
        }
    }
}

/// Redis 配置
///
/// `standalone_enabled` 与 `sentinel_enabled` 必须恰好有一个为 true。
/// 两个开关默认都关闭，未显式配置模式时启动失败。
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub standalone_enabled: bool,
    pub url: String,
    pub sentinel_enabled: bool,
    pub sentinel: SentinelConfig,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            standalone_enabled: false,
            url: "redis://localhost:6379".to_string(),
            sentinel_enabled: false,
            sentinel: SentinelConfig::default(),
        }
    }
}

/// 已校验的存储模式
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreMode {
    /// 固定地址的单机 Redis
    Standalone { url: String },
    /// 经哨兵发现主节点
    Sentinel {
        nodes: Vec<String>,
        master_name: String,
    },
}

impl StoreMode {
    /// 模式名称，用于日志与指标标签
    pub fn name(&self) -> &'static str {
        match self {
            Self::Standalone { .. } => "standalone",
            Self::Sentinel { .. } => "sentinel",
        }
    }
}

impl RedisConfig {
    /// 解析存储模式
    ///
    /// 两个开关同时开启或同时关闭都会被拒绝，调用方应在启动阶段直接失败，
    /// 不做任何默认回退。
    pub fn mode(&self) -> Result<StoreMode> {
        match (self.standalone_enabled, self.sentinel_enabled) {
            (true, false) => {
                if self.url.trim().is_empty() {
                    return Err(KeyguardError::Configuration(
                        "redis.url 不能为空".to_string(),
                    ));
                }
                Ok(StoreMode::Standalone {
                    url: self.url.clone(),
                })
            }
            (false, true) => {
                let nodes: Vec<String> = self
                    .sentinel
                    .nodes
                    .iter()
                    .map(|n| n.trim().to_string())
                    .filter(|n| !n.is_empty())
                    .collect();
                if nodes.is_empty() {
                    return Err(KeyguardError::Configuration(
                        "哨兵模式下 redis.sentinel.nodes 不能为空".to_string(),
                    ));
                }
                if self.sentinel.master_name.trim().is_empty() {
                    return Err(KeyguardError::Configuration(
                        "哨兵模式下 redis.sentinel.master_name 不能为空".to_string(),
                    ));
                }
                Ok(StoreMode::Sentinel {
                    nodes,
                    master_name: self.sentinel.master_name.clone(),
                })
            }
            (true, true) => Err(KeyguardError::Configuration(
                "standalone_enabled 与 sentinel_enabled 不能同时开启".to_string(),
            )),
            (false, false) => Err(KeyguardError::Configuration(
                "standalone_enabled 与 sentinel_enabled 必须开启其一".to_string(),
            )),
        }
    }
}

/// 分布式锁默认参数
///
/// 默认值沿用既有业务：等待 3 秒，租约 960 秒，轮询间隔 100 毫秒。
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LockSettings {
    pub acquire_timeout_ms: u64,
    pub lease_duration_ms: u64,
    pub retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            acquire_timeout_ms: 3_000,
            lease_duration_ms: 960_000,
            retry_delay_ms: 100,
            max_retry_delay_ms: 100,
        }
    }
}

impl LockSettings {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.lease_duration_ms)
    }
}

/// 可观测性配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    /// 日志输出格式：json（结构化）或 pretty（人类可读）
    pub log_format: String,
    pub metrics_enabled: bool,
    pub metrics_port: u16,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            metrics_enabled: false,
            metrics_port: 9090,
        }
    }
}

impl ObservabilityConfig {
    pub fn json_logs(&self) -> bool {
        self.log_format.eq_ignore_ascii_case("json")
    }
}

/// 应用配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub service_name: String,
    pub environment: String,
    pub redis: RedisConfig,
    pub lock: LockSettings,
    pub observability: ObservabilityConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            service_name: "keyguard".to_string(),
            environment: "development".to_string(),
            redis: RedisConfig::default(),
            lock: LockSettings::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// 加载顺序（后加载的会覆盖先加载的同名配置项）：
    /// 1. config/default.toml（默认配置）
    /// 2. config/{environment}.toml（环境特定配置）
    /// 3. config/{service_name}.toml（服务特定配置）
    /// 4. 环境变量（KEYGUARD_ 前缀，`__` 分隔层级，
    ///    如 KEYGUARD_REDIS__SENTINEL_ENABLED -> redis.sentinel_enabled）
    pub fn load(service_name: &str) -> std::result::Result<Self, ConfigError> {
        let env = std::env::var("KEYGUARD_ENV").unwrap_or_else(|_| "development".to_string());

        let config_dir = std::env::var("CONFIG_DIR").unwrap_or_else(|_| "config".to_string());

        let builder = Config::builder()
            .set_default("service_name", service_name)?
            .set_default("environment", env.clone())?
            .add_source(File::from(Path::new(&config_dir).join("default.toml")).required(false))
            .add_source(
                File::from(Path::new(&config_dir).join(format!("{}.toml", env))).required(false),
            )
            .add_source(
                File::from(Path::new(&config_dir).join(format!("{}.toml", service_name)))
                    .required(false),
            )
            // 哨兵节点列表支持逗号分隔：KEYGUARD_REDIS__SENTINEL__NODES=a,b
            .add_source(
                Environment::with_prefix("KEYGUARD")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("redis.sentinel.nodes")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// 是否为生产环境
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.service_name, "keyguard");
        assert_eq!(config.environment, "development");
        assert!(!config.redis.standalone_enabled);
        assert!(!config.redis.sentinel_enabled);
        assert_eq!(config.lock.acquire_timeout(), Duration::from_secs(3));
        assert_eq!(config.lock.lease_duration(), Duration::from_secs(960));
        assert_eq!(config.observability.metrics_port, 9090);
    }

    #[test]
    fn test_standalone_mode() {
        let config = RedisConfig {
            standalone_enabled: true,
            ..Default::default()
        };
        assert_eq!(
            config.mode().unwrap(),
            StoreMode::Standalone {
                url: "redis://localhost:6379".to_string()
            }
        );
    }

    #[test]
    fn test_sentinel_mode() {
        let config = RedisConfig {
            standalone_enabled: false,
            sentinel_enabled: true,
            sentinel: SentinelConfig {
                nodes: vec![
                    "redis://10.0.0.1:26379".to_string(),
                    " ".to_string(),
                    "redis://10.0.0.2:26379".to_string(),
                ],
                master_name: "payments".to_string(),
            },
            ..Default::default()
        };

        let mode = config.mode().unwrap();
        assert_eq!(mode.name(), "sentinel");
        assert_eq!(
            mode,
            StoreMode::Sentinel {
                nodes: vec![
                    "redis://10.0.0.1:26379".to_string(),
                    "redis://10.0.0.2:26379".to_string(),
                ],
                master_name: "payments".to_string(),
            }
        );
    }

    #[test]
    fn test_both_modes_rejected() {
        let config = RedisConfig {
            standalone_enabled: true,
            sentinel_enabled: true,
            ..Default::default()
        };
        let err = config.mode().unwrap_err();
        assert_eq!(err.code(), "CONFIGURATION_ERROR");
    }

    #[test]
    fn test_default_flags_rejected() {
        // 未配置任何模式开关时不能回落到单机模式
        let config = RedisConfig::default();
        assert!(matches!(
            config.mode(),
            Err(KeyguardError::Configuration(_))
        ));
    }

    #[test]
    fn test_sentinel_without_nodes_rejected() {
        let config = RedisConfig {
            standalone_enabled: false,
            sentinel_enabled: true,
            sentinel: SentinelConfig {
                nodes: vec![],
                master_name: "mymaster".to_string(),
            },
            ..Default::default()
        };
        assert!(config.mode().is_err());

        let config = RedisConfig {
            standalone_enabled: false,
            sentinel_enabled: true,
            sentinel: SentinelConfig {
                master_name: String::new(),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.mode().is_err());
    }

    #[test]
    fn test_json_logs_flag() {
        let config = ObservabilityConfig {
            log_format: "JSON".to_string(),
            ..Default::default()
        };
        assert!(config.json_logs());
        assert!(!ObservabilityConfig::default().json_logs());
    }
}
