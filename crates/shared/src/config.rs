//! 配置管理模块
//!
//! 支持多格式配置文件加载，环境变量覆盖，以及类型安全的配置访问。

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::retry::RetryPolicy;

/// Redis 配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
        }
    }
}

/// Kafka 配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KafkaConfig {
    pub brokers: String,
    pub consumer_group: String,
    pub auto_offset_reset: String,
    /// 通知任务所在的 topic
    pub topic: String,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            consumer_group: "notification-dispatcher".to_string(),
            auto_offset_reset: "earliest".to_string(),
            topic: "notifications".to_string(),
        }
    }
}

/// 按用户限流配置（固定窗口）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// 单个窗口内每个用户允许的最大发送次数
    pub limit: u64,
    /// 窗口长度（秒）
    pub window_seconds: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            limit: 100,
            window_seconds: 60,
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }
}

/// 工作池配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolsConfig {
    /// 工作池数量
    pub count: usize,
    /// 每个池的并发 worker 数
    pub workers_per_pool: usize,
    /// 每个池的有界队列容量
    pub queue_capacity: usize,
}

impl Default for PoolsConfig {
    fn default() -> Self {
        Self {
            count: 2,
            workers_per_pool: 8,
            queue_capacity: 100,
        }
    }
}

/// 分发器配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// 计数存储不可用时本地暂存的任务上限
    pub store_retry_capacity: usize,
    pub store_retry_max_retries: u32,
    pub store_retry_initial_delay_ms: u64,
    pub store_retry_max_delay_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            store_retry_capacity: 1000,
            store_retry_max_retries: 5,
            store_retry_initial_delay_ms: 500,
            store_retry_max_delay_ms: 30_000,
        }
    }
}

impl DispatcherConfig {
    /// 暂存任务的重试退避策略
    pub fn store_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.store_retry_max_retries,
            initial_delay: Duration::from_millis(self.store_retry_initial_delay_ms),
            max_delay: Duration::from_millis(self.store_retry_max_delay_ms),
            multiplier: 2.0,
        }
    }
}

/// 溢出队列回放配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DrainConfig {
    pub enabled: bool,
    /// 每轮每个用户最多回放的条数，0 表示按 rate_limit.limit 取值
    pub batch_per_user: usize,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_per_user: 0,
        }
    }
}

/// 邮件中继配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmailConfig {
    pub relay_host: String,
    pub relay_port: u16,
    pub from: String,
    pub subject: String,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            relay_host: "localhost".to_string(),
            relay_port: 587,
            from: "noreply@example.com".to_string(),
            subject: "Notification".to_string(),
        }
    }
}

/// 短信服务商配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SmsConfig {
    pub provider_url: String,
}

impl Default for SmsConfig {
    fn default() -> Self {
        Self {
            provider_url: "http://localhost:8090/sms".to_string(),
        }
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
    pub tracing_endpoint: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            metrics_enabled: true,
            metrics_port: 9090,
            tracing_endpoint: None,
        }
    }
}

/// 应用配置
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub service_name: String,
    pub environment: String,
    pub redis: RedisConfig,
    pub kafka: KafkaConfig,
    pub rate_limit: RateLimitConfig,
    pub pools: PoolsConfig,
    pub dispatcher: DispatcherConfig,
    pub drain: DrainConfig,
    pub email: EmailConfig,
    pub sms: SmsConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// 加载顺序（后加载的会覆盖先加载的同名配置项）：
    /// 1. .env 文件（若存在）
    /// 2. config/default.toml（默认配置）
    /// 3. config/{environment}.toml（环境特定配置）
    /// 4. config/{service_name}.toml（服务特定配置）
    /// 5. 环境变量（NOTIFY_ 前缀，层级用双下划线分隔，如 NOTIFY_RATE_LIMIT__LIMIT -> rate_limit.limit）
    pub fn load(service_name: &str) -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let env = std::env::var("NOTIFY_ENV").unwrap_or_else(|_| "development".to_string());

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
            .add_source(
                Environment::with_prefix("NOTIFY")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// 校验启动参数
    ///
    /// 这些值为 0 时管道无法工作（取模除零、永远拒绝、永远阻塞），必须在启动期拒绝。
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &str| Err(ConfigError::Message(format!("{field} 必须大于 0")));

        if self.rate_limit.limit == 0 {
            return invalid("rate_limit.limit");
        }
        if self.rate_limit.window_seconds == 0 {
            return invalid("rate_limit.window_seconds");
        }
        if self.pools.count == 0 {
            return invalid("pools.count");
        }
        if self.pools.workers_per_pool == 0 {
            return invalid("pools.workers_per_pool");
        }
        if self.pools.queue_capacity == 0 {
            return invalid("pools.queue_capacity");
        }
        if self.dispatcher.store_retry_capacity == 0 {
            return invalid("dispatcher.store_retry_capacity");
        }
        if self.kafka.topic.is_empty() {
            return Err(ConfigError::Message("kafka.topic 不能为空".to_string()));
        }
        Ok(())
    }

    /// 溢出回放每用户批量，未配置时与限流额度一致
    pub fn drain_batch_per_user(&self) -> usize {
        if self.drain.batch_per_user == 0 {
            self.rate_limit.limit as usize
        } else {
            self.drain.batch_per_user
        }
    }
}
