//! 负载执行器
//!
//! 每个虚拟用户一个 tokio 任务，按间隔生成任务并发布，直到达到停止条件。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use notify_shared::error::NotifyError;
use notify_shared::events::NotificationTask;
use notify_shared::kafka::KafkaProducer;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::generator::TaskGenerator;

/// 任务发布端
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TaskPublisher: Send + Sync {
    async fn publish(&self, task: &NotificationTask) -> Result<(), NotifyError>;
}

/// 以用户 ID 为 key 写入 Kafka，保证同一用户的任务落在同一分区
pub struct KafkaPublisher {
    producer: KafkaProducer,
    topic: String,
}

impl KafkaPublisher {
    pub fn new(producer: KafkaProducer, topic: impl Into<String>) -> Self {
        Self {
            producer,
            topic: topic.into(),
        }
    }
}

#[async_trait]
impl TaskPublisher for KafkaPublisher {
    async fn publish(&self, task: &NotificationTask) -> Result<(), NotifyError> {
        self.producer
            .send_json(&self.topic, &task.user_id, task)
            .await
            .map(|_| ())
    }
}

/// 每个用户的停止条件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCondition {
    Requests(usize),
    Duration(Duration),
}

/// 发送统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub sent: usize,
    pub failed: usize,
}

impl LoadReport {
    fn merge(self, other: LoadReport) -> LoadReport {
        LoadReport {
            sent: self.sent + other.sent,
            failed: self.failed + other.failed,
        }
    }
}

pub struct LoadRunner {
    publisher: Arc<dyn TaskPublisher>,
    generator: TaskGenerator,
    users: usize,
    interval: Duration,
    stop: StopCondition,
}

impl LoadRunner {
    pub fn new(
        publisher: Arc<dyn TaskPublisher>,
        generator: TaskGenerator,
        users: usize,
        interval: Duration,
        stop: StopCondition,
    ) -> Self {
        Self {
            publisher,
            generator,
            users,
            interval: interval.max(Duration::from_millis(1)),
            stop,
        }
    }

    /// 并发模拟所有用户，返回汇总统计
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> LoadReport {
        info!(
            users = self.users,
            interval_ms = self.interval.as_millis() as u64,
            stop = ?self.stop,
            "开始发送模拟负载"
        );

        let handles: Vec<_> = (1..=self.users)
            .map(|index| {
                let user_id = self.generator.user_id(index);
                tokio::spawn(simulate_user(
                    Arc::clone(&self.publisher),
                    self.generator.clone(),
                    user_id,
                    self.interval,
                    self.stop,
                    shutdown.clone(),
                ))
            })
            .collect();

        let mut report = LoadReport::default();
        for result in join_all(handles).await {
            match result {
                Ok(user_report) => report = report.merge(user_report),
                Err(e) => error!(error = %e, "模拟用户任务异常退出"),
            }
        }

        info!(sent = report.sent, failed = report.failed, "模拟负载发送完成");
        report
    }
}

async fn simulate_user(
    publisher: Arc<dyn TaskPublisher>,
    generator: TaskGenerator,
    user_id: String,
    interval: Duration,
    stop: StopCondition,
    mut shutdown: watch::Receiver<bool>,
) -> LoadReport {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let deadline = match stop {
        StopCondition::Duration(d) => Some(Instant::now() + d),
        StopCondition::Requests(_) => None,
    };

    let mut report = LoadReport::default();
    let mut seq = 0usize;

    loop {
        if let StopCondition::Requests(limit) = stop
            && seq >= limit
        {
            break;
        }

        tokio::select! {
            biased;

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }

            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                break;
            }

            _ = ticker.tick() => {
                let task = generator.task(&user_id, seq);
                seq += 1;
                match publisher.publish(&task).await {
                    Ok(()) => {
                        report.sent += 1;
                        debug!(user_id = %user_id, seq, channel = %task.channel, "任务已发送");
                    }
                    Err(e) => {
                        report.failed += 1;
                        warn!(user_id = %user_id, seq, error = %e, "任务发送失败");
                    }
                }
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::ChannelMix;

    fn runner(publisher: MockTaskPublisher, users: usize, stop: StopCondition) -> LoadRunner {
        LoadRunner::new(
            Arc::new(publisher),
            TaskGenerator::new("user_", ChannelMix::Email),
            users,
            Duration::from_millis(300),
            stop,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_request_count() {
        let mut publisher = MockTaskPublisher::new();
        publisher.expect_publish().times(6).returning(|_| Ok(()));

        let (_tx, rx) = watch::channel(false);
        let report = runner(publisher, 2, StopCondition::Requests(3)).run(rx).await;

        assert_eq!(report, LoadReport { sent: 6, failed: 0 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_duration_bound() {
        let mut publisher = MockTaskPublisher::new();
        publisher.expect_publish().returning(|_| Ok(()));

        let (_tx, rx) = watch::channel(false);
        let report = runner(publisher, 1, StopCondition::Duration(Duration::from_millis(1000)))
            .run(rx)
            .await;

        // 第 0、300、600、900 毫秒各一次
        assert_eq!(report.sent, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_failures_are_counted() {
        let mut publisher = MockTaskPublisher::new();
        publisher
            .expect_publish()
            .returning(|_| Err(NotifyError::Kafka("broker down".to_string())));

        let (_tx, rx) = watch::channel(false);
        let report = runner(publisher, 1, StopCondition::Requests(2)).run(rx).await;

        assert_eq!(report, LoadReport { sent: 0, failed: 2 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_users() {
        let mut publisher = MockTaskPublisher::new();
        publisher.expect_publish().returning(|_| Ok(()));

        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        let report = runner(publisher, 3, StopCondition::Requests(100)).run(rx).await;

        assert_eq!(report.sent, 0);
    }

    #[tokio::test]
    async fn test_tasks_keyed_by_user() {
        let mut publisher = MockTaskPublisher::new();
        publisher
            .expect_publish()
            .withf(|task| task.user_id == "user_1" && task.recipient == "user_1@example.com")
            .times(1)
            .returning(|_| Ok(()));

        let (_tx, rx) = watch::channel(false);
        runner(publisher, 1, StopCondition::Requests(1)).run(rx).await;
    }
}
