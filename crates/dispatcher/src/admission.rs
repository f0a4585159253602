//! 准入控制
//!
//! 对每个用户在固定窗口内计数。窗口内前 `limit` 个任务放行，
//! 超出的任务写入该用户的溢出队列，由溢出回放在窗口重置后重新提交。

use std::sync::Arc;
use std::time::Duration;

use notify_shared::config::RateLimitConfig;
use notify_shared::counter_store::{CounterStore, OverflowPlacement, WindowAdmission};
use notify_shared::error::NotifyError;
use notify_shared::events::NotificationTask;
use notify_shared::observability::metrics;
use tracing::debug;

use crate::error::DispatchError;

/// 准入决策
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionDecision {
    /// `count` 为本窗口内的计数（含本次）
    Allowed { count: u64 },
    /// 已写入溢出队列，`queued` 为写入后的队列长度
    Denied { count: u64, queued: u64 },
}

impl AdmissionDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

pub struct AdmissionController {
    store: Arc<dyn CounterStore>,
    limit: u64,
    window: Duration,
}

impl AdmissionController {
    pub fn new(store: Arc<dyn CounterStore>, config: &RateLimitConfig) -> Self {
        Self {
            store,
            limit: config.limit,
            window: config.window(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// 新任务准入；拒绝时追加到溢出队列尾部
    pub async fn check(&self, task: &NotificationTask) -> Result<AdmissionDecision, DispatchError> {
        self.admit(task, OverflowPlacement::Back).await
    }

    /// 回放任务准入；拒绝时放回溢出队列头部，保持用户内先进先出
    pub async fn readmit(
        &self,
        task: &NotificationTask,
    ) -> Result<AdmissionDecision, DispatchError> {
        self.admit(task, OverflowPlacement::Front).await
    }

    async fn admit(
        &self,
        task: &NotificationTask,
        placement: OverflowPlacement,
    ) -> Result<AdmissionDecision, DispatchError> {
        let payload = task.to_json().map_err(NotifyError::from)?;
        let WindowAdmission { count, queued } = self
            .store
            .admit(&task.user_id, self.window, self.limit, &payload, placement)
            .await
            .map_err(|e| {
                metrics::record_admission("store_unavailable");
                DispatchError::from_store(e)
            })?;

        let Some(queued) = queued else {
            metrics::record_admission("allowed");
            return Ok(AdmissionDecision::Allowed { count });
        };

        metrics::record_admission("denied");
        debug!(
            user_id = %task.user_id,
            count,
            limit = self.limit,
            queued,
            "超出限流窗口，任务写入溢出队列"
        );
        Ok(AdmissionDecision::Denied { count, queued })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify_shared::test_utils::{MemoryCounterStore, TestDataGenerator};

    fn controller(limit: u64, window_seconds: u64) -> (Arc<MemoryCounterStore>, AdmissionController) {
        let store = Arc::new(MemoryCounterStore::new());
        let config = RateLimitConfig {
            limit,
            window_seconds,
        };
        (store.clone(), AdmissionController::new(store, &config))
    }

    #[tokio::test]
    async fn test_limit_three_of_five() {
        let (store, admission) = controller(3, 60);
        let tasks = TestDataGenerator::email_tasks("u1", 5);

        let mut decisions = Vec::new();
        for task in &tasks {
            decisions.push(admission.check(task).await.unwrap());
        }

        assert_eq!(decisions.iter().filter(|d| d.is_allowed()).count(), 3);
        assert_eq!(decisions[3], AdmissionDecision::Denied { count: 4, queued: 1 });
        assert_eq!(decisions[4], AdmissionDecision::Denied { count: 5, queued: 2 });

        let queued: Vec<NotificationTask> = store
            .queued("u1")
            .iter()
            .map(|raw| NotificationTask::from_json(raw.as_bytes()).unwrap())
            .collect();
        assert_eq!(queued, tasks[3..].to_vec());
    }

    #[tokio::test]
    async fn test_users_counted_independently() {
        let (_store, admission) = controller(1, 60);

        let a = TestDataGenerator::email_task("alice", 0);
        let b = TestDataGenerator::email_task("bob", 0);
        assert!(admission.check(&a).await.unwrap().is_allowed());
        assert!(admission.check(&b).await.unwrap().is_allowed());
        assert!(!admission.check(&a).await.unwrap().is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_reset_allows_again() {
        let (_store, admission) = controller(2, 60);
        let task = TestDataGenerator::email_task("u1", 0);

        assert!(admission.check(&task).await.unwrap().is_allowed());
        assert!(admission.check(&task).await.unwrap().is_allowed());
        assert!(!admission.check(&task).await.unwrap().is_allowed());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(
            admission.check(&task).await.unwrap(),
            AdmissionDecision::Allowed { count: 1 }
        );
    }

    #[tokio::test]
    async fn test_readmit_denial_goes_to_front() {
        let (store, admission) = controller(0, 60);

        admission.check(&TestDataGenerator::email_task("u1", 1)).await.unwrap();
        admission.readmit(&TestDataGenerator::email_task("u1", 0)).await.unwrap();

        let messages: Vec<String> = store
            .queued("u1")
            .iter()
            .map(|raw| NotificationTask::from_json(raw.as_bytes()).unwrap().message)
            .collect();
        assert_eq!(messages, vec!["msg-0", "msg-1"]);
    }

    #[tokio::test]
    async fn test_failed_check_leaves_no_partial_count() {
        let (store, admission) = controller(1, 60);
        let first = TestDataGenerator::email_task("u1", 0);
        let second = TestDataGenerator::email_task("u1", 1);

        assert!(admission.check(&first).await.unwrap().is_allowed());

        store.set_unavailable(true);
        assert!(admission.check(&second).await.unwrap_err().is_store_unavailable());
        assert_eq!(store.window_count("u1"), 1);
        assert!(store.queued("u1").is_empty());

        // 恢复后重试同一任务只计一次
        store.set_unavailable(false);
        assert_eq!(
            admission.check(&second).await.unwrap(),
            AdmissionDecision::Denied { count: 2, queued: 1 }
        );
        assert_eq!(store.window_count("u1"), 2);
    }

    #[tokio::test]
    async fn test_store_unavailable() {
        let (store, admission) = controller(3, 60);
        store.set_unavailable(true);

        let err = admission
            .check(&TestDataGenerator::email_task("u1", 0))
            .await
            .unwrap_err();
        assert!(err.is_store_unavailable());
    }
}
