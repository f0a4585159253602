//! 统一错误处理模块
//!
//! 定义各服务共享的基础设施错误类型，使用 thiserror 提供良好的错误信息。

use thiserror::Error;

/// 共享错误类型
#[derive(Debug, Error)]
pub enum NotifyError {
    // ==================== 计数存储错误 ====================
    #[error("Redis 错误: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("计数存储不可用: {0}")]
    StoreUnavailable(String),

    // ==================== Kafka 错误 ====================
    #[error("Kafka 错误: {0}")]
    Kafka(String),

    // ==================== 数据错误 ====================
    #[error("序列化失败: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("配置错误: {0}")]
    Config(String),

    // ==================== 通用错误 ====================
    #[error("内部错误: {0}")]
    Internal(String),
}

/// 错误结果类型别名
pub type Result<T> = std::result::Result<T, NotifyError>;

impl NotifyError {
    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Redis(_) => "REDIS_ERROR",
            Self::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            Self::Kafka(_) => "KAFKA_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// 是否为可重试错误
    ///
    /// 存储与 Kafka 的网络类故障可以重试；数据格式错误重试也不会成功。
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Redis(_) | Self::StoreUnavailable(_) | Self::Kafka(_)
        )
    }

    /// 计数存储是否不可达
    ///
    /// Redis 返回的 IO / 连接类错误与显式的 StoreUnavailable 都归为此类，
    /// 调用方据此决定是否把任务暂存到本地重试缓冲区。
    pub fn is_store_unavailable(&self) -> bool {
        match self {
            Self::StoreUnavailable(_) => true,
            Self::Redis(e) => {
                e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
            }
            _ => false,
        }
    }
}

impl From<config::ConfigError> for NotifyError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}
