//! 共享库
//!
//! 包含分发服务与工具共用的配置、错误处理、Kafka、计数存储、可观测性等基础设施代码。

pub mod config;
pub mod counter_store;
pub mod error;
pub mod events;
pub mod kafka;
pub mod observability;
pub mod retry;
pub mod test_utils;
