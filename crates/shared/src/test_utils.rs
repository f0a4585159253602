//! 测试工具模块
//!
//! 提供不依赖 Redis / Kafka 的内存实现和测试数据生成器，
//! 用于在单元测试与集成测试中驱动完整的分发管道。

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::config::{AppConfig, RedisConfig};
use crate::counter_store::{CounterStore, OverflowPlacement, StoreKey, WindowAdmission};
use crate::error::{NotifyError, Result};
use crate::events::NotificationTask;
use crate::kafka::{ConsumerMessage, RecordSource};

// ==================== 测试配置辅助 ====================

/// 创建测试用 Redis 配置
pub fn test_redis_config() -> RedisConfig {
    RedisConfig {
        url: std::env::var("TEST_REDIS_URL")
            .unwrap_or_else(|_| "redis://localhost:6379/1".to_string()),
    }
}

/// 创建测试用应用配置
///
/// 限流 3 次 / 60 秒，2 个池，每池 1 个 worker，队列容量 16，关闭指标导出。
pub fn test_app_config() -> AppConfig {
    let mut config = AppConfig {
        service_name: "notification-dispatcher-test".to_string(),
        environment: "test".to_string(),
        ..Default::default()
    };
    config.rate_limit.limit = 3;
    config.rate_limit.window_seconds = 60;
    config.pools.count = 2;
    config.pools.workers_per_pool = 1;
    config.pools.queue_capacity = 16;
    config.observability.metrics_enabled = false;
    config
}

/// 生成唯一的测试用户 ID
///
/// 使用原子计数器确保并行测试时的唯一性
pub fn test_user_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    format!("test-user-{}", COUNTER.fetch_add(1, Ordering::SeqCst))
}

// ==================== 测试数据生成器 ====================

/// 测试任务生成器
pub struct TestDataGenerator;

impl TestDataGenerator {
    /// 第 n 个邮件任务，消息体为 `msg-{n}`，便于断言顺序
    pub fn email_task(user_id: &str, n: usize) -> NotificationTask {
        NotificationTask::email(user_id, format!("{user_id}@example.com"), format!("msg-{n}"))
    }

    /// 第 n 个短信任务
    pub fn sms_task(user_id: &str, n: usize) -> NotificationTask {
        NotificationTask::sms(user_id, "+8613800000000", format!("msg-{n}"))
    }

    /// 生成 count 个同一用户的邮件任务
    pub fn email_tasks(user_id: &str, count: usize) -> Vec<NotificationTask> {
        (0..count).map(|n| Self::email_task(user_id, n)).collect()
    }
}

// ==================== 内存计数存储 ====================

#[derive(Default)]
struct MemoryStoreState {
    /// key -> (计数, 过期时刻)
    counters: HashMap<String, (u64, Instant)>,
    queues: HashMap<String, VecDeque<String>>,
    overflow_users: BTreeSet<String>,
    unavailable: bool,
}

/// 内存版计数存储
///
/// 语义与 Redis 实现一致；时间取自 tokio 时钟，测试中可用
/// `tokio::time::pause` / `advance` 推进窗口。`set_unavailable(true)` 模拟存储宕机。
#[derive(Default)]
pub struct MemoryCounterStore {
    state: Mutex<MemoryStoreState>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }

    /// 用户溢出队列快照（从旧到新）
    pub fn queued(&self, user_id: &str) -> Vec<String> {
        self.state
            .lock()
            .queues
            .get(&StoreKey::queue(user_id))
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// 当前窗口内的计数，窗口已过期时返回 0
    pub fn window_count(&self, user_id: &str) -> u64 {
        let state = self.state.lock();
        match state.counters.get(&StoreKey::rate(user_id)) {
            Some((count, expires_at)) if *expires_at > Instant::now() => *count,
            _ => 0,
        }
    }

    fn push_queue(
        state: &mut MemoryStoreState,
        user_id: &str,
        payload: &str,
        placement: OverflowPlacement,
    ) -> u64 {
        let queue = state.queues.entry(StoreKey::queue(user_id)).or_default();
        match placement {
            OverflowPlacement::Back => queue.push_back(payload.to_string()),
            OverflowPlacement::Front => queue.push_front(payload.to_string()),
        }
        let len = queue.len() as u64;
        state.overflow_users.insert(user_id.to_string());
        len
    }

    fn check_available(state: &MemoryStoreState) -> Result<()> {
        if state.unavailable {
            return Err(NotifyError::StoreUnavailable(
                "memory store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn admit(
        &self,
        user_id: &str,
        window: Duration,
        limit: u64,
        payload: &str,
        placement: OverflowPlacement,
    ) -> Result<WindowAdmission> {
        let mut state = self.state.lock();
        Self::check_available(&state)?;

        let now = Instant::now();
        let entry = state
            .counters
            .entry(StoreKey::rate(user_id))
            .or_insert((0, now + window));
        if entry.1 <= now {
            *entry = (0, now + window);
        }
        entry.0 += 1;
        let count = entry.0;

        let queued = (count > limit).then(|| Self::push_queue(&mut state, user_id, payload, placement));
        Ok(WindowAdmission { count, queued })
    }

    async fn push_overflow(
        &self,
        user_id: &str,
        payload: &str,
        placement: OverflowPlacement,
    ) -> Result<u64> {
        let mut state = self.state.lock();
        Self::check_available(&state)?;
        Ok(Self::push_queue(&mut state, user_id, payload, placement))
    }

    async fn pop_overflow(&self, user_id: &str) -> Result<Option<String>> {
        let mut state = self.state.lock();
        Self::check_available(&state)?;

        let key = StoreKey::queue(user_id);
        let (value, now_empty) = match state.queues.get_mut(&key) {
            Some(queue) => (queue.pop_front(), queue.is_empty()),
            None => (None, true),
        };
        if now_empty {
            state.queues.remove(&key);
            state.overflow_users.remove(user_id);
        }
        Ok(value)
    }

    async fn overflow_users(&self) -> Result<Vec<String>> {
        let state = self.state.lock();
        Self::check_available(&state)?;
        Ok(state.overflow_users.iter().cloned().collect())
    }

    async fn overflow_len(&self, user_id: &str) -> Result<u64> {
        let state = self.state.lock();
        Self::check_available(&state)?;
        Ok(state
            .queues
            .get(&StoreKey::queue(user_id))
            .map_or(0, |q| q.len() as u64))
    }

    async fn ping(&self) -> Result<()> {
        Self::check_available(&self.state.lock())
    }
}

// ==================== 内存消息源 ====================

/// 内存版消息源
///
/// 按加入顺序逐条返回，全部取完后返回 `None`，分发循环随之结束。
pub struct MemoryRecordSource {
    topic: String,
    next_offset: i64,
    records: VecDeque<Result<ConsumerMessage>>,
}

impl MemoryRecordSource {
    pub fn new(topic: &str) -> Self {
        Self {
            topic: topic.to_string(),
            next_offset: 0,
            records: VecDeque::new(),
        }
    }

    /// 追加原始负载
    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        let msg = ConsumerMessage::from_payload(&self.topic, self.next_offset, payload);
        self.next_offset += 1;
        self.records.push_back(Ok(msg));
        self
    }

    /// 追加序列化后的任务
    pub fn with_task(self, task: &NotificationTask) -> Self {
        let payload = serde_json::to_vec(task).unwrap_or_default();
        self.with_payload(payload)
    }

    /// 追加一次读取失败
    pub fn with_read_error(mut self, message: &str) -> Self {
        self.records
            .push_back(Err(NotifyError::Kafka(message.to_string())));
        self
    }
}

#[async_trait]
impl RecordSource for MemoryRecordSource {
    async fn next_record(&mut self) -> Option<Result<ConsumerMessage>> {
        self.records.pop_front()
    }
}
