//! 工作池
//!
//! 每个池持有一个有界任务队列和固定数量的 worker。队列满时 `submit` 挂起等待，
//! 形成对分发循环的背压；`stop` 先关闭提交入口，再让 worker 处理完队列中
//! 已有的任务后退出。多个池组成 `PoolSet`，按轮询游标选择。

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use futures::future::join_all;
use notify_shared::config::PoolsConfig;
use notify_shared::events::NotificationTask;
use notify_shared::observability::metrics;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::DispatchError;
use crate::sender::SenderRegistry;

/// 工作池生命周期
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    /// 已构造，worker 尚未启动；可以接收任务（入队等待）
    Idle,
    Running,
    /// 已关闭提交入口，正在处理剩余任务
    Stopping,
    Stopped,
}

/// 单个任务的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    Failed,
    /// 渠道无法识别或未注册发送器
    Dropped,
}

impl DeliveryOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::Failed => "failed",
            Self::Dropped => "dropped",
        }
    }
}

type SharedReceiver = Arc<tokio::sync::Mutex<mpsc::Receiver<NotificationTask>>>;

/// 有界工作池
pub struct WorkerPool {
    id: usize,
    worker_count: usize,
    capacity: usize,
    senders: Arc<SenderRegistry>,
    /// 提交端；`stop` 时取走，所有克隆释放后队列关闭
    tx: Mutex<Option<mpsc::Sender<NotificationTask>>>,
    rx: SharedReceiver,
    state: Mutex<PoolState>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(
        id: usize,
        worker_count: usize,
        capacity: usize,
        senders: Arc<SenderRegistry>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            id,
            worker_count: worker_count.max(1),
            capacity: capacity.max(1),
            senders,
            tx: Mutex::new(Some(tx)),
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            state: Mutex::new(PoolState::Idle),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> PoolState {
        *self.state.lock()
    }

    /// 队列中等待处理的任务数
    pub fn queued(&self) -> usize {
        self.tx
            .lock()
            .as_ref()
            .map_or(0, |tx| self.capacity - tx.capacity())
    }

    /// 提交任务
    ///
    /// 队列满时挂起直到有空位；池进入 Stopping / Stopped 后返回 `PoolClosed`。
    pub async fn submit(&self, task: NotificationTask) -> Result<(), DispatchError> {
        let tx = {
            let state = self.state.lock();
            if matches!(*state, PoolState::Stopping | PoolState::Stopped) {
                return Err(DispatchError::PoolClosed { pool_id: self.id });
            }
            self.tx.lock().clone()
        };
        let tx = tx.ok_or(DispatchError::PoolClosed { pool_id: self.id })?;

        let permit = tx
            .reserve()
            .await
            .map_err(|_| DispatchError::PoolClosed { pool_id: self.id })?;

        // 等待空位期间池可能已进入 Stopping，入队与状态检查在同一把锁内完成
        let state = self.state.lock();
        if matches!(*state, PoolState::Stopping | PoolState::Stopped) {
            return Err(DispatchError::PoolClosed { pool_id: self.id });
        }
        permit.send(task);
        Ok(())
    }

    /// 启动 worker
    ///
    /// 重复启动是空操作；已停止的池不能再启动。
    pub fn start(&self) -> Result<(), DispatchError> {
        {
            let mut state = self.state.lock();
            match *state {
                PoolState::Idle => *state = PoolState::Running,
                PoolState::Running => {
                    warn!(pool = self.id, "工作池已在运行，忽略重复启动");
                    return Ok(());
                }
                PoolState::Stopping | PoolState::Stopped => {
                    return Err(DispatchError::PoolClosed { pool_id: self.id });
                }
            }
        }

        self.spawn_workers();
        info!(
            pool = self.id,
            workers = self.worker_count,
            capacity = self.capacity,
            "工作池已启动"
        );
        Ok(())
    }

    fn spawn_workers(&self) {
        let mut handles = self.handles.lock();
        for worker_id in 0..self.worker_count {
            let rx = Arc::clone(&self.rx);
            let senders = Arc::clone(&self.senders);
            let pool_id = self.id;
            handles.push(tokio::spawn(async move {
                run_worker(pool_id, worker_id, rx, senders).await;
            }));
        }
    }

    /// 停止工作池
    ///
    /// 关闭提交入口后等待 worker 处理完队列中的全部任务再退出，进行中的投递
    /// 不会被打断。未启动的池会先启动 worker 以处理已入队的任务。
    /// 重复调用是空操作。
    pub async fn stop(&self) {
        let was_idle = {
            let mut state = self.state.lock();
            let was_idle = match *state {
                PoolState::Stopping | PoolState::Stopped => return,
                PoolState::Idle => true,
                PoolState::Running => false,
            };
            *state = PoolState::Stopping;
            was_idle
        };

        if was_idle {
            self.spawn_workers();
        }

        info!(pool = self.id, queued = self.queued(), "工作池停止中，处理剩余任务");
        self.tx.lock().take();

        let handles = std::mem::take(&mut *self.handles.lock());
        for (worker_id, result) in join_all(handles).await.into_iter().enumerate() {
            if let Err(e) = result {
                error!(pool = self.id, worker_id, error = %e, "worker 异常退出");
            }
        }

        *self.state.lock() = PoolState::Stopped;
        info!(pool = self.id, "工作池已停止");
    }
}

async fn run_worker(
    pool_id: usize,
    worker_id: usize,
    rx: SharedReceiver,
    senders: Arc<SenderRegistry>,
) {
    debug!(pool = pool_id, worker_id, "worker 已启动");
    loop {
        // 只在取任务时持有接收端锁，处理期间其他 worker 可以继续取
        let next = { rx.lock().await.recv().await };
        match next {
            Some(task) => {
                process(pool_id, worker_id, &senders, &task).await;
            }
            None => break,
        }
    }
    debug!(pool = pool_id, worker_id, "worker 已退出");
}

/// 按渠道选择发送器并投递
///
/// 投递失败只记录日志，不重试。
pub async fn process(
    pool_id: usize,
    worker_id: usize,
    senders: &SenderRegistry,
    task: &NotificationTask,
) -> DeliveryOutcome {
    let started = Instant::now();

    let outcome = if !task.channel.is_recognized() {
        warn!(
            pool = pool_id,
            worker_id,
            user_id = %task.user_id,
            channel = %task.channel,
            "未知通知类型，丢弃任务"
        );
        DeliveryOutcome::Dropped
    } else if let Some(sender) = senders.get(&task.channel) {
        match sender.send(task).await {
            Ok(receipt) => {
                debug!(
                    pool = pool_id,
                    worker_id,
                    user_id = %task.user_id,
                    channel = %task.channel,
                    message_id = %receipt.message_id,
                    "通知投递成功"
                );
                DeliveryOutcome::Delivered
            }
            Err(e) => {
                error!(
                    pool = pool_id,
                    worker_id,
                    user_id = %task.user_id,
                    channel = %task.channel,
                    error = %e,
                    "通知投递失败"
                );
                DeliveryOutcome::Failed
            }
        }
    } else {
        warn!(
            pool = pool_id,
            worker_id,
            user_id = %task.user_id,
            channel = %task.channel,
            "渠道未注册发送器，丢弃任务"
        );
        DeliveryOutcome::Dropped
    };

    metrics::record_delivery(
        task.channel.metric_label(),
        outcome.as_str(),
        started.elapsed().as_secs_f64(),
    );
    outcome
}

// ---------------------------------------------------------------------------
// PoolSet
// ---------------------------------------------------------------------------

/// 工作池集合
///
/// 第 k 次选择返回第 `k mod P` 个池，不考虑各池积压。
/// 游标由分发循环与溢出回放共享。
pub struct PoolSet {
    pools: Vec<Arc<WorkerPool>>,
    cursor: AtomicUsize,
}

impl PoolSet {
    pub fn new(pools: Vec<Arc<WorkerPool>>) -> Result<Self, DispatchError> {
        if pools.is_empty() {
            return Err(DispatchError::Shared(
                notify_shared::error::NotifyError::Config("至少需要一个工作池".to_string()),
            ));
        }
        Ok(Self {
            pools,
            cursor: AtomicUsize::new(0),
        })
    }

    /// 按配置构造（未启动）
    pub fn from_config(
        config: &PoolsConfig,
        senders: Arc<SenderRegistry>,
    ) -> Result<Self, DispatchError> {
        let pools = (0..config.count)
            .map(|id| {
                Arc::new(WorkerPool::new(
                    id,
                    config.workers_per_pool,
                    config.queue_capacity,
                    Arc::clone(&senders),
                ))
            })
            .collect();
        Self::new(pools)
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    pub fn pools(&self) -> &[Arc<WorkerPool>] {
        &self.pools
    }

    /// 推进游标并返回选中的池
    pub fn select(&self) -> &Arc<WorkerPool> {
        let k = self.cursor.fetch_add(1, Ordering::Relaxed);
        &self.pools[k % self.pools.len()]
    }

    /// 轮询选择一个池并提交，返回池编号
    pub async fn submit(&self, task: NotificationTask) -> Result<usize, DispatchError> {
        let pool = self.select();
        pool.submit(task).await?;
        metrics::record_pool_submit(pool.id());
        Ok(pool.id())
    }

    pub fn start_all(&self) -> Result<(), DispatchError> {
        for pool in &self.pools {
            pool.start()?;
        }
        Ok(())
    }

    /// 并行停止所有池（各自处理完剩余任务）
    pub async fn stop_all(&self) {
        join_all(self.pools.iter().map(|pool| pool.stop())).await;
        info!(pools = self.pools.len(), "所有工作池已停止");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sender::{CapturingSender, MockNotificationSender};
    use notify_shared::events::NotificationChannel;
    use notify_shared::test_utils::TestDataGenerator;
    use tokio_test::assert_pending;

    fn capturing_registry() -> (Arc<CapturingSender>, Arc<SenderRegistry>) {
        let sender = Arc::new(CapturingSender::new(NotificationChannel::Email));
        let registry = SenderRegistry::new().with_sender(sender.clone());
        (sender, Arc::new(registry))
    }

    fn messages(tasks: &[NotificationTask]) -> Vec<&str> {
        tasks.iter().map(|t| t.message.as_str()).collect()
    }

    #[tokio::test]
    async fn test_submit_blocks_when_full_and_resumes() {
        let (sender, registry) = capturing_registry();
        let pool = WorkerPool::new(0, 1, 1, registry);

        pool.submit(TestDataGenerator::email_task("u1", 0)).await.unwrap();
        assert_eq!(pool.queued(), 1);

        let mut blocked = tokio_test::task::spawn(pool.submit(TestDataGenerator::email_task("u1", 1)));
        assert_pending!(blocked.poll());

        pool.start().unwrap();
        let result = loop {
            if let std::task::Poll::Ready(result) = blocked.poll() {
                break result;
            }
            tokio::task::yield_now().await;
        };
        result.unwrap();
        drop(blocked);
        pool.stop().await;

        assert_eq!(messages(&sender.delivered()), vec!["msg-0", "msg-1"]);
    }

    #[tokio::test]
    async fn test_submit_waiting_for_space_rejected_after_stop() {
        let (sender, registry) = capturing_registry();
        let pool = Arc::new(WorkerPool::new(0, 1, 1, registry));

        pool.submit(TestDataGenerator::email_task("u1", 0)).await.unwrap();
        let waiting = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.submit(TestDataGenerator::email_task("u1", 1)).await })
        };
        tokio::task::yield_now().await;
        assert!(!waiting.is_finished());

        pool.stop().await;

        let err = waiting.await.unwrap().unwrap_err();
        assert!(matches!(err, DispatchError::PoolClosed { pool_id: 0 }));
        assert_eq!(pool.state(), PoolState::Stopped);
        assert_eq!(messages(&sender.delivered()), vec!["msg-0"]);
    }

    #[tokio::test]
    async fn test_stop_drains_queued_tasks() {
        let (sender, registry) = capturing_registry();
        let pool = WorkerPool::new(0, 2, 8, registry);
        pool.start().unwrap();

        for n in 0..5 {
            pool.submit(TestDataGenerator::email_task("u1", n)).await.unwrap();
        }
        pool.stop().await;

        assert_eq!(pool.state(), PoolState::Stopped);
        assert_eq!(sender.delivered().len(), 5);
    }

    #[tokio::test]
    async fn test_stop_on_idle_pool_processes_buffered_tasks() {
        let (sender, registry) = capturing_registry();
        let pool = WorkerPool::new(0, 1, 4, registry);

        for n in 0..3 {
            pool.submit(TestDataGenerator::email_task("u1", n)).await.unwrap();
        }
        pool.stop().await;

        assert_eq!(messages(&sender.delivered()), vec!["msg-0", "msg-1", "msg-2"]);
    }

    #[tokio::test]
    async fn test_submit_after_stop_is_rejected() {
        let (_sender, registry) = capturing_registry();
        let pool = WorkerPool::new(3, 1, 4, registry);
        pool.start().unwrap();
        pool.stop().await;
        pool.stop().await;

        let err = pool
            .submit(TestDataGenerator::email_task("u1", 0))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::PoolClosed { pool_id: 3 }));
        assert!(pool.start().is_err());
    }

    #[tokio::test]
    async fn test_process_delivery_failure_is_not_retried() {
        let mut mock = MockNotificationSender::new();
        mock.expect_channel().return_const(NotificationChannel::Sms);
        mock.expect_send().times(1).returning(|_| {
            Err(DispatchError::DeliveryFailed {
                channel: "sms".to_string(),
                reason: "gateway 503".to_string(),
            })
        });
        let registry = SenderRegistry::new().with_sender(Arc::new(mock));

        let outcome = process(0, 0, &registry, &TestDataGenerator::sms_task("u1", 0)).await;
        assert_eq!(outcome, DeliveryOutcome::Failed);
    }

    #[tokio::test]
    async fn test_process_drops_unknown_channel() {
        let mut mock = MockNotificationSender::new();
        mock.expect_channel().return_const(NotificationChannel::Email);
        mock.expect_send().never();
        let registry = SenderRegistry::new().with_sender(Arc::new(mock));

        let task = NotificationTask::new(
            "u1",
            NotificationChannel::Unrecognized("fax".to_string()),
            "555-0100",
            "hello",
        );
        assert_eq!(process(0, 0, &registry, &task).await, DeliveryOutcome::Dropped);

        let sms = TestDataGenerator::sms_task("u1", 0);
        assert_eq!(process(0, 0, &registry, &sms).await, DeliveryOutcome::Dropped);
    }

    #[tokio::test]
    async fn test_pool_set_round_robin() {
        let (_sender, registry) = capturing_registry();
        let config = PoolsConfig {
            count: 3,
            workers_per_pool: 1,
            queue_capacity: 8,
        };
        let pools = PoolSet::from_config(&config, registry).unwrap();

        let mut chosen = Vec::new();
        for n in 0..7 {
            chosen.push(pools.submit(TestDataGenerator::email_task("u1", n)).await.unwrap());
        }
        assert_eq!(chosen, vec![0, 1, 2, 0, 1, 2, 0]);

        pools.stop_all().await;
        assert!(pools.pools().iter().all(|p| p.state() == PoolState::Stopped));
    }

    #[test]
    fn test_pool_set_requires_pools() {
        assert!(PoolSet::new(Vec::new()).is_err());
    }
}
