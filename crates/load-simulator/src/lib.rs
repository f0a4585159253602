//! 负载模拟工具
//!
//! 为若干虚拟用户周期性生成通知任务并写入 Kafka，
//! 用于在本地端到端验证限流、溢出回放与工作池分发。

pub mod cli;
pub mod generator;
pub mod runner;
