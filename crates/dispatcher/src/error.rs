//! 分发服务错误类型
//!
//! 区分存储不可达、工作池关闭、解码失败和投递失败，
//! 上层据此决定暂存重试、跳过还是丢弃。

use notify_shared::error::NotifyError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("通知投递失败: 渠道={channel}, 原因={reason}")]
    DeliveryFailed { channel: String, reason: String },

    #[error("工作池已关闭: pool={pool_id}")]
    PoolClosed { pool_id: usize },

    #[error("通知反序列化失败: {0}")]
    DecodeFailed(String),

    #[error("计数存储不可用: {0}")]
    StoreUnavailable(String),

    #[error(transparent)]
    Shared(#[from] NotifyError),
}

impl DispatchError {
    /// 将计数存储返回的错误归类
    ///
    /// 连接类故障归为 `StoreUnavailable`，其余保持原样。
    pub fn from_store(err: NotifyError) -> Self {
        if err.is_store_unavailable() {
            Self::StoreUnavailable(err.to_string())
        } else {
            Self::Shared(err)
        }
    }

    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }
}
