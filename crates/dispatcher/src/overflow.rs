//! 溢出队列回放
//!
//! 每个窗口周期遍历 `overflow:users`，按先进先出顺序取出用户的溢出任务重新准入。
//! 放行的任务提交到工作池；某个用户第一次被拒绝时停止该用户本轮的回放，
//! 被拒绝的任务已放回队首。

use std::sync::Arc;
use std::time::Duration;

use notify_shared::counter_store::{CounterStore, OverflowPlacement};
use notify_shared::events::NotificationTask;
use notify_shared::observability::metrics;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::admission::{AdmissionController, AdmissionDecision};
use crate::error::DispatchError;
use crate::worker_pool::PoolSet;

/// 单轮回放统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainStats {
    pub admitted: usize,
    pub requeued: usize,
    pub discarded: usize,
}

impl DrainStats {
    pub fn is_empty(&self) -> bool {
        self.admitted == 0 && self.requeued == 0 && self.discarded == 0
    }
}

pub struct OverflowDrain {
    store: Arc<dyn CounterStore>,
    admission: Arc<AdmissionController>,
    pools: Arc<PoolSet>,
    batch_per_user: usize,
    interval: Duration,
}

impl OverflowDrain {
    pub fn new(
        store: Arc<dyn CounterStore>,
        admission: Arc<AdmissionController>,
        pools: Arc<PoolSet>,
        batch_per_user: usize,
    ) -> Self {
        let interval = admission.window();
        Self {
            store,
            admission,
            pools,
            batch_per_user: batch_per_user.max(1),
            interval,
        }
    }

    /// 周期回放，直到收到停止信号
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval_secs = self.interval.as_secs(),
            batch_per_user = self.batch_per_user,
            "溢出回放已启动"
        );

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }

                _ = ticker.tick() => {
                    match self.drain_once().await {
                        Ok(stats) if !stats.is_empty() => {
                            info!(
                                admitted = stats.admitted,
                                requeued = stats.requeued,
                                discarded = stats.discarded,
                                "溢出回放完成一轮"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "溢出回放失败，下一轮重试"),
                    }
                }
            }
        }

        info!("溢出回放已停止");
    }

    /// 执行一轮回放
    pub async fn drain_once(&self) -> Result<DrainStats, DispatchError> {
        let users = self
            .store
            .overflow_users()
            .await
            .map_err(DispatchError::from_store)?;

        let mut stats = DrainStats::default();
        for user_id in users {
            self.drain_user(&user_id, &mut stats).await?;
        }
        Ok(stats)
    }

    async fn drain_user(&self, user_id: &str, stats: &mut DrainStats) -> Result<(), DispatchError> {
        for _ in 0..self.batch_per_user {
            let Some(raw) = self
                .store
                .pop_overflow(user_id)
                .await
                .map_err(DispatchError::from_store)?
            else {
                break;
            };

            let task = match NotificationTask::from_json(raw.as_bytes()) {
                Ok(task) => task,
                Err(e) => {
                    warn!(user_id, error = %e, "溢出队列中存在无法解析的条目，已丢弃");
                    metrics::record_overflow_drained("discarded");
                    stats.discarded += 1;
                    continue;
                }
            };

            match self.admission.readmit(&task).await {
                Ok(AdmissionDecision::Allowed { .. }) => match self.pools.submit(task).await {
                    Ok(pool_id) => {
                        debug!(user_id, pool = pool_id, "溢出任务已重新提交");
                        metrics::record_overflow_drained("admitted");
                        stats.admitted += 1;
                    }
                    Err(e) => {
                        self.restore(user_id, &raw).await;
                        return Err(e);
                    }
                },
                Ok(AdmissionDecision::Denied { .. }) => {
                    metrics::record_overflow_drained("requeued");
                    stats.requeued += 1;
                    break;
                }
                Err(e) => {
                    self.restore(user_id, &raw).await;
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// 已出队但未能处理的条目放回队首
    async fn restore(&self, user_id: &str, raw: &str) {
        if let Err(e) = self
            .store
            .push_overflow(user_id, raw, OverflowPlacement::Front)
            .await
        {
            error!(user_id, error = %e, "溢出条目放回失败，任务丢失");
        }
    }
}
