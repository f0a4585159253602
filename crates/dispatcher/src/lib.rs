//! 通知分发服务
//!
//! 从 Kafka 消费通知任务，按用户限流准入后轮询提交到多个工作池，
//! 由各池的 worker 调用对应渠道的发送器完成投递。
//! 超出限流的任务进入 Redis 溢出队列，窗口重置后由回放任务重新准入。

pub mod admission;
pub mod dispatcher;
pub mod error;
pub mod overflow;
pub mod sender;
pub mod worker_pool;
