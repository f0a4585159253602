//! 存储与消息队列的退避重试
//!
//! `RetryPolicy` 描述指数退避曲线和最大重试次数。启动阶段连接计数存储时由
//! `retry_transient` 驱动；分发循环的本地暂存缓冲区按 `backoff` 安排下一次尝试。

use std::future::Future;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::NotifyError;

/// 指数退避策略
///
/// 第 n 次重试前等待 `initial_delay * multiplier^n`，不超过 `max_delay`。
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// 首次执行之外最多重试的次数
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    /// 启动连接用：重试 3 次，1 秒起步，上限 30 秒
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// 第 `attempt` 次重试前的等待时间，不考虑次数上限
    pub fn delay(&self, attempt: u32) -> Duration {
        let initial_ms = self.initial_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        let ms = (initial_ms * self.multiplier.powi(attempt as i32)).min(max_ms);
        Duration::from_millis(ms as u64)
    }

    /// 已失败 `failed` 次重试后，下一次重试前的等待时间；次数用尽时返回 `None`
    pub fn backoff(&self, failed: u32) -> Option<Duration> {
        (failed < self.max_retries).then(|| self.delay(failed))
    }
}

/// 对瞬时故障按策略重试
///
/// 只有 `NotifyError::is_retryable` 的错误会触发重试，配置或数据错误立即返回。
pub async fn retry_transient<F, Fut, T>(
    policy: &RetryPolicy,
    operation: &str,
    mut attempt_once: F,
) -> Result<T, NotifyError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, NotifyError>>,
{
    let mut failed: u32 = 0;

    loop {
        let err = match attempt_once().await {
            Ok(value) => {
                if failed > 0 {
                    info!(operation, retries = failed, "重试后恢复");
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        if !err.is_retryable() {
            warn!(operation, error = %err, "不可重试的错误");
            return Err(err);
        }

        let Some(delay) = policy.backoff(failed) else {
            warn!(operation, retries = failed, error = %err, "重试次数用尽");
            return Err(err);
        };

        warn!(
            operation,
            retry = failed + 1,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "暂时不可用，退避后重试"
        );
        tokio::time::sleep(delay).await;
        failed += 1;
    }
}
