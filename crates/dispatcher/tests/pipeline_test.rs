//! 分发管道集成测试
//!
//! 使用内存计数存储与内存消息源驱动完整管道（无需 Redis / Kafka）。

use std::sync::Arc;
use std::time::Duration;

use notification_dispatcher::admission::AdmissionController;
use notification_dispatcher::dispatcher::Dispatcher;
use notification_dispatcher::overflow::OverflowDrain;
use notification_dispatcher::sender::{CapturingSender, SenderRegistry};
use notification_dispatcher::worker_pool::{PoolSet, WorkerPool};
use notify_shared::config::AppConfig;
use notify_shared::events::{NotificationChannel, NotificationTask};
use notify_shared::test_utils::{
    MemoryCounterStore, MemoryRecordSource, TestDataGenerator, test_app_config, test_user_id,
};
use tokio::sync::watch;

// ==================== 测试装配 ====================

/// 每个池配一个独立的 CapturingSender，便于断言任务落在哪个池
struct Pipeline {
    store: Arc<MemoryCounterStore>,
    senders: Vec<Arc<CapturingSender>>,
    pools: Arc<PoolSet>,
    admission: Arc<AdmissionController>,
    dispatcher: Dispatcher,
}

impl Pipeline {
    fn new(config: &AppConfig) -> Self {
        let store = Arc::new(MemoryCounterStore::new());

        let mut senders = Vec::new();
        let mut pools = Vec::new();
        for id in 0..config.pools.count {
            let sender = Arc::new(CapturingSender::new(NotificationChannel::Email));
            let registry = Arc::new(SenderRegistry::new().with_sender(sender.clone()));
            pools.push(Arc::new(WorkerPool::new(
                id,
                config.pools.workers_per_pool,
                config.pools.queue_capacity,
                registry,
            )));
            senders.push(sender);
        }
        let pools = Arc::new(PoolSet::new(pools).unwrap());
        pools.start_all().unwrap();

        let admission = Arc::new(AdmissionController::new(store.clone(), &config.rate_limit));
        let dispatcher = Dispatcher::new(admission.clone(), pools.clone(), &config.dispatcher);

        Self {
            store,
            senders,
            pools,
            admission,
            dispatcher,
        }
    }

    async fn run(&mut self, mut source: MemoryRecordSource) {
        let (_tx, rx) = watch::channel(false);
        self.dispatcher.run(&mut source, rx).await;
    }

    fn messages_of_pool(&self, pool_id: usize) -> Vec<String> {
        self.senders[pool_id]
            .delivered()
            .into_iter()
            .map(|t| t.message)
            .collect()
    }

    fn all_messages(&self) -> Vec<String> {
        let mut all: Vec<String> = (0..self.senders.len())
            .flat_map(|id| self.messages_of_pool(id))
            .collect();
        all.sort();
        all
    }
}

fn source_of(tasks: &[NotificationTask]) -> MemoryRecordSource {
    tasks
        .iter()
        .fold(MemoryRecordSource::new("notifications"), |source, task| {
            source.with_task(task)
        })
}

// ==================== 场景 ====================

#[tokio::test]
async fn test_rate_limit_three_of_five() {
    let config = test_app_config();
    let mut pipeline = Pipeline::new(&config);
    let user = test_user_id();

    pipeline
        .run(source_of(&TestDataGenerator::email_tasks(&user, 5)))
        .await;
    pipeline.pools.stop_all().await;

    assert_eq!(pipeline.all_messages(), vec!["msg-0", "msg-1", "msg-2"]);

    let queued: Vec<String> = pipeline
        .store
        .queued(&user)
        .iter()
        .map(|raw| NotificationTask::from_json(raw.as_bytes()).unwrap().message)
        .collect();
    assert_eq!(queued, vec!["msg-3", "msg-4"]);
}

#[tokio::test]
async fn test_round_robin_across_two_pools() {
    let mut config = test_app_config();
    config.rate_limit.limit = 100;
    let mut pipeline = Pipeline::new(&config);
    let user = test_user_id();

    pipeline
        .run(source_of(&TestDataGenerator::email_tasks(&user, 10)))
        .await;
    pipeline.pools.stop_all().await;

    assert_eq!(
        pipeline.messages_of_pool(0),
        vec!["msg-0", "msg-2", "msg-4", "msg-6", "msg-8"]
    );
    assert_eq!(
        pipeline.messages_of_pool(1),
        vec!["msg-1", "msg-3", "msg-5", "msg-7", "msg-9"]
    );
}

#[tokio::test]
async fn test_malformed_record_between_valid_ones() {
    let config = test_app_config();
    let mut pipeline = Pipeline::new(&config);
    let user = test_user_id();

    let source = MemoryRecordSource::new("notifications")
        .with_task(&TestDataGenerator::email_task(&user, 0))
        .with_payload(b"not-json".to_vec())
        .with_task(&TestDataGenerator::email_task(&user, 1));

    pipeline.run(source).await;
    pipeline.pools.stop_all().await;

    assert_eq!(pipeline.messages_of_pool(0), vec!["msg-0"]);
    assert_eq!(pipeline.messages_of_pool(1), vec!["msg-1"]);
}

#[tokio::test]
async fn test_unknown_channel_is_dropped_not_fatal() {
    let config = test_app_config();
    let mut pipeline = Pipeline::new(&config);
    let user = test_user_id();

    let source = MemoryRecordSource::new("notifications")
        .with_payload(
            format!(r#"{{"UserID":"{user}","Type":"fax","Recipient":"555","Message":"x"}}"#)
                .into_bytes(),
        )
        .with_task(&TestDataGenerator::email_task(&user, 1));

    pipeline.run(source).await;
    pipeline.pools.stop_all().await;

    assert_eq!(pipeline.all_messages(), vec!["msg-1"]);
}

#[tokio::test(start_paused = true)]
async fn test_overflow_replayed_after_window_reset() {
    let mut config = test_app_config();
    config.rate_limit.limit = 2;
    let mut pipeline = Pipeline::new(&config);
    let user = test_user_id();

    pipeline
        .run(source_of(&TestDataGenerator::email_tasks(&user, 5)))
        .await;
    assert_eq!(pipeline.store.queued(&user).len(), 3);

    let drain = OverflowDrain::new(
        pipeline.store.clone(),
        pipeline.admission.clone(),
        pipeline.pools.clone(),
        config.drain_batch_per_user(),
    );

    tokio::time::advance(Duration::from_secs(61)).await;
    let first = drain.drain_once().await.unwrap();
    assert_eq!((first.admitted, first.requeued), (2, 0));
    assert_eq!(pipeline.store.queued(&user).len(), 1);

    tokio::time::advance(Duration::from_secs(61)).await;
    let second = drain.drain_once().await.unwrap();
    assert_eq!(second.admitted, 1);
    assert!(pipeline.store.queued(&user).is_empty());

    pipeline.pools.stop_all().await;
    assert_eq!(
        pipeline.all_messages(),
        vec!["msg-0", "msg-1", "msg-2", "msg-3", "msg-4"]
    );
}

#[tokio::test]
async fn test_failed_delivery_does_not_stop_pipeline() {
    let mut config = test_app_config();
    config.pools.count = 1;
    let mut pipeline = Pipeline::new(&config);
    pipeline.senders[0].set_failing(true);

    let user = test_user_id();
    pipeline
        .run(source_of(&TestDataGenerator::email_tasks(&user, 2)))
        .await;
    pipeline.pools.stop_all().await;

    assert!(pipeline.all_messages().is_empty());
    assert_eq!(pipeline.store.window_count(&user), 2);
}
