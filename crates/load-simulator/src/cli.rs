//! CLI 参数定义

use clap::{Parser, ValueEnum};

/// 通知负载模拟工具
///
/// 每个虚拟用户按固定间隔发送通知任务，直到达到请求数或运行时长。
#[derive(Parser, Debug)]
#[command(name = "load-simulator")]
#[command(version, about = "通知分发管道负载模拟工具")]
pub struct Cli {
    /// 日志级别 (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Kafka brokers 地址
    #[arg(long, default_value = "localhost:9092")]
    pub kafka_brokers: String,

    /// 目标 topic
    #[arg(short, long, default_value = "notifications")]
    pub topic: String,

    /// 虚拟用户数
    #[arg(short, long, default_value = "5")]
    pub users: usize,

    /// 用户 ID 前缀，用户编号从 1 开始
    #[arg(long, default_value = "user_")]
    pub user_prefix: String,

    /// 每个用户的发送间隔（毫秒）
    #[arg(long, default_value = "300")]
    pub interval_ms: u64,

    /// 运行时长（秒），指定 --requests 时忽略
    #[arg(short, long, default_value = "3")]
    pub duration_secs: u64,

    /// 每个用户发送的请求数
    #[arg(short, long)]
    pub requests: Option<usize>,

    /// 通知渠道
    #[arg(short, long, value_enum, default_value_t = ChannelMix::Mixed)]
    pub channel: ChannelMix,
}

/// 任务渠道分布
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ChannelMix {
    Email,
    Sms,
    /// 每条任务随机选择邮件或短信
    Mixed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::parse_from(["load-simulator"]);
        assert_eq!(cli.users, 5);
        assert_eq!(cli.interval_ms, 300);
        assert_eq!(cli.channel, ChannelMix::Mixed);
        assert!(cli.requests.is_none());
    }

    #[test]
    fn test_explicit_args() {
        let cli = Cli::parse_from([
            "load-simulator",
            "--users",
            "2",
            "--requests",
            "10",
            "--channel",
            "sms",
            "--topic",
            "notify-test",
        ]);
        assert_eq!(cli.users, 2);
        assert_eq!(cli.requests, Some(10));
        assert_eq!(cli.channel, ChannelMix::Sms);
        assert_eq!(cli.topic, "notify-test");
    }
}
