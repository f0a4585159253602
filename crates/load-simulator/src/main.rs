//! 负载模拟工具入口

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use load_simulator::cli::Cli;
use load_simulator::generator::TaskGenerator;
use load_simulator::runner::{KafkaPublisher, LoadRunner, StopCondition};
use notify_shared::config::KafkaConfig;
use notify_shared::kafka::KafkaProducer;
use tokio::sync::watch;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // 优先使用环境变量 RUST_LOG，否则使用命令行参数指定的级别
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .init();

    let kafka = KafkaConfig {
        brokers: cli.kafka_brokers.clone(),
        topic: cli.topic.clone(),
        ..Default::default()
    };
    let producer = KafkaProducer::new(&kafka)?;
    let publisher = Arc::new(KafkaPublisher::new(producer, cli.topic.clone()));

    let stop = match cli.requests {
        Some(n) => StopCondition::Requests(n),
        None => StopCondition::Duration(Duration::from_secs(cli.duration_secs)),
    };
    let runner = LoadRunner::new(
        publisher,
        TaskGenerator::new(cli.user_prefix.clone(), cli.channel),
        cli.users,
        Duration::from_millis(cli.interval_ms),
        stop,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("收到关闭信号，停止发送...");
            let _ = signal_tx.send(true);
        }
    });

    let report = runner.run(shutdown_rx).await;
    drop(shutdown_tx);
    info!(
        topic = %cli.topic,
        sent = report.sent,
        failed = report.failed,
        "负载模拟结束"
    );

    if report.failed > 0 && report.sent == 0 {
        anyhow::bail!("所有任务发送失败，请检查 Kafka 连接");
    }
    Ok(())
}
