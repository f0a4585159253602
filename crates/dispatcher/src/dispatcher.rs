//! 分发循环
//!
//! 从消息源逐条读取通知任务：解码、准入、放行的任务轮询提交到工作池。
//! 计数存储不可达时任务暂存到本地有界缓冲区，按退避策略重试。

use std::collections::VecDeque;
use std::sync::Arc;

use notify_shared::config::DispatcherConfig;
use notify_shared::events::NotificationTask;
use notify_shared::kafka::{ConsumerMessage, RecordSource};
use notify_shared::observability::metrics;
use notify_shared::observability::tracing::set_parent_from_headers;
use notify_shared::retry::RetryPolicy;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::admission::{AdmissionController, AdmissionDecision};
use crate::error::DispatchError;
use crate::worker_pool::PoolSet;

/// 单条记录的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Submitted { pool_id: usize },
    /// 超出限流，已写入溢出队列
    Queued,
    /// 解码失败，跳过
    Skipped,
    /// 存储不可达，暂存本地等待重试
    Deferred,
    Dropped,
}

// ---------------------------------------------------------------------------
// 本地重试缓冲区
// ---------------------------------------------------------------------------

struct PendingTask {
    task: NotificationTask,
    /// 已失败的重试轮次
    attempt: u32,
    next_attempt: Instant,
}

/// 存储不可达期间暂存任务的有界队列
///
/// 按先后顺序重试；队首未到期时后面的任务也不会被尝试。
pub struct StoreRetryBuffer {
    entries: VecDeque<PendingTask>,
    capacity: usize,
    policy: RetryPolicy,
}

impl StoreRetryBuffer {
    pub fn new(capacity: usize, policy: RetryPolicy) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity,
            policy,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 追加到队尾，缓冲区已满时返回 false
    fn push(&mut self, task: NotificationTask) -> bool {
        if self.entries.len() >= self.capacity {
            return false;
        }
        self.entries.push_back(PendingTask {
            task,
            attempt: 0,
            next_attempt: Instant::now() + self.policy.delay(0),
        });
        true
    }

    /// 重试失败的任务放回队首，超过最大重试次数时交还任务
    fn requeue_front(&mut self, task: NotificationTask, attempt: u32) -> Result<(), NotificationTask> {
        let Some(delay) = self.policy.backoff(attempt) else {
            return Err(task);
        };
        self.entries.push_front(PendingTask {
            task,
            attempt,
            next_attempt: Instant::now() + delay,
        });
        Ok(())
    }

    fn pop_due(&mut self, now: Instant) -> Option<PendingTask> {
        match self.entries.front() {
            Some(front) if front.next_attempt <= now => self.entries.pop_front(),
            _ => None,
        }
    }

    fn next_due(&self) -> Option<Instant> {
        self.entries.front().map(|p| p.next_attempt)
    }

    fn take_all(&mut self) -> Vec<PendingTask> {
        self.entries.drain(..).collect()
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

pub struct Dispatcher {
    admission: Arc<AdmissionController>,
    pools: Arc<PoolSet>,
    retry_buffer: StoreRetryBuffer,
}

impl Dispatcher {
    pub fn new(
        admission: Arc<AdmissionController>,
        pools: Arc<PoolSet>,
        config: &DispatcherConfig,
    ) -> Self {
        Self {
            admission,
            pools,
            retry_buffer: StoreRetryBuffer::new(
                config.store_retry_capacity,
                config.store_retry_policy(),
            ),
        }
    }

    /// 本地暂存的任务数
    pub fn retry_buffered(&self) -> usize {
        self.retry_buffer.len()
    }

    /// 运行分发循环，直到收到停止信号或消息源结束
    pub async fn run<S>(&mut self, source: &mut S, mut shutdown: watch::Receiver<bool>)
    where
        S: RecordSource + ?Sized,
    {
        info!("分发循环已启动");

        loop {
            let retry_at = self.retry_buffer.next_due();

            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("收到停止信号，分发循环退出");
                        break;
                    }
                }

                _ = tokio::time::sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    self.flush_retry_buffer().await;
                }

                record = source.next_record() => {
                    match record {
                        Some(Ok(msg)) => {
                            self.handle_record(&msg).await;
                        }
                        Some(Err(e)) => {
                            metrics::record_record("read_error");
                            error!(error = %e, "读取消息失败，跳过");
                        }
                        None => {
                            info!("消息源已结束，分发循环退出");
                            break;
                        }
                    }
                }
            }
        }

        self.flush_on_exit().await;
    }

    /// 处理单条记录
    ///
    /// 消息头中的追踪上下文作为本条记录 span 的父上下文。
    pub async fn handle_record(&mut self, msg: &ConsumerMessage) -> DispatchOutcome {
        let span = info_span!(
            "dispatch_record",
            topic = %msg.topic,
            partition = msg.partition,
            offset = msg.offset
        );
        set_parent_from_headers(&span, &msg.headers);

        async {
            let task = match msg.deserialize_payload::<NotificationTask>() {
                Ok(task) => task,
                Err(e) => {
                    metrics::record_record("decode_error");
                    let err = DispatchError::DecodeFailed(e.to_string());
                    warn!(
                        topic = %msg.topic,
                        partition = msg.partition,
                        offset = msg.offset,
                        error = %err,
                        "跳过无法解析的消息"
                    );
                    return DispatchOutcome::Skipped;
                }
            };
            metrics::record_record("decoded");

            match self.admission.check(&task).await {
                Ok(decision) => self.apply(task, decision).await,
                Err(e) if e.is_store_unavailable() => self.defer(task, &e),
                Err(e) => {
                    error!(user_id = %task.user_id, error = %e, "准入检查失败，丢弃任务");
                    DispatchOutcome::Dropped
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn apply(&self, task: NotificationTask, decision: AdmissionDecision) -> DispatchOutcome {
        match decision {
            AdmissionDecision::Allowed { count } => {
                let user_id = task.user_id.clone();
                match self.pools.submit(task).await {
                    Ok(pool_id) => {
                        debug!(user_id = %user_id, count, pool = pool_id, "任务已提交到工作池");
                        DispatchOutcome::Submitted { pool_id }
                    }
                    Err(e) => {
                        error!(user_id = %user_id, error = %e, "提交工作池失败，丢弃任务");
                        DispatchOutcome::Dropped
                    }
                }
            }
            AdmissionDecision::Denied { count, queued } => {
                info!(user_id = %task.user_id, count, queued, "超出限流，任务已排队");
                DispatchOutcome::Queued
            }
        }
    }

    fn defer(&mut self, task: NotificationTask, cause: &DispatchError) -> DispatchOutcome {
        let user_id = task.user_id.clone();
        let outcome = if self.retry_buffer.push(task) {
            warn!(
                user_id = %user_id,
                buffered = self.retry_buffer.len(),
                error = %cause,
                "计数存储不可用，任务暂存本地"
            );
            DispatchOutcome::Deferred
        } else {
            error!(
                user_id = %user_id,
                capacity = self.retry_buffer.capacity,
                error = %cause,
                "本地暂存已满，丢弃任务"
            );
            DispatchOutcome::Dropped
        };
        metrics::set_store_retry_buffered(self.retry_buffer.len());
        outcome
    }

    /// 按顺序重试已到期的暂存任务
    ///
    /// 存储仍不可达时当前任务放回队首并停止本轮。返回离开缓冲区的任务数。
    pub async fn flush_retry_buffer(&mut self) -> usize {
        let now = Instant::now();
        let mut resolved = 0;

        while let Some(pending) = self.retry_buffer.pop_due(now) {
            match self.admission.check(&pending.task).await {
                Ok(decision) => {
                    self.apply(pending.task, decision).await;
                    resolved += 1;
                }
                Err(e) if e.is_store_unavailable() => {
                    let attempt = pending.attempt + 1;
                    if let Err(task) = self.retry_buffer.requeue_front(pending.task, attempt) {
                        error!(
                            user_id = %task.user_id,
                            attempt,
                            error = %e,
                            "计数存储重试耗尽，丢弃任务"
                        );
                        resolved += 1;
                    }
                    break;
                }
                Err(e) => {
                    error!(user_id = %pending.task.user_id, error = %e, "准入检查失败，丢弃任务");
                    resolved += 1;
                }
            }
        }

        metrics::set_store_retry_buffered(self.retry_buffer.len());
        resolved
    }

    /// 退出前对暂存任务做最后一次尝试，不再等待退避
    async fn flush_on_exit(&mut self) {
        if self.retry_buffer.is_empty() {
            return;
        }

        let mut lost = 0usize;
        for pending in self.retry_buffer.take_all() {
            match self.admission.check(&pending.task).await {
                Ok(decision) => {
                    self.apply(pending.task, decision).await;
                }
                Err(_) => lost += 1,
            }
        }
        metrics::set_store_retry_buffered(0);

        if lost > 0 {
            error!(lost, "退出时计数存储仍不可用，暂存任务丢失");
        }
    }
}
