//! 通知分发服务
//!
//! 消费 Kafka 通知任务，限流准入后分发到工作池投递。

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use notification_dispatcher::admission::AdmissionController;
use notification_dispatcher::dispatcher::Dispatcher;
use notification_dispatcher::overflow::OverflowDrain;
use notification_dispatcher::sender::SenderRegistry;
use notification_dispatcher::worker_pool::PoolSet;
use notify_shared::config::AppConfig;
use notify_shared::counter_store::{CounterStore, RedisCounterStore};
use notify_shared::kafka::KafkaConsumer;
use notify_shared::observability;
use notify_shared::retry::{RetryPolicy, retry_transient};
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

const SERVICE_NAME: &str = "notification-dispatcher";

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load(SERVICE_NAME)?;
    let _guard = observability::init(&config.service_name, &config.observability).await?;

    info!(
        environment = %config.environment,
        topic = %config.kafka.topic,
        pools = config.pools.count,
        workers_per_pool = config.pools.workers_per_pool,
        limit = config.rate_limit.limit,
        window_secs = config.rate_limit.window_seconds,
        "Starting notification-dispatcher..."
    );

    // 计数存储：连接失败按默认策略重试，PING 不通则退出
    let store = retry_transient(&RetryPolicy::default(), "redis_connect", || {
        RedisCounterStore::connect(&config.redis)
    })
    .await?;
    store.ping().await?;
    let store: Arc<dyn CounterStore> = Arc::new(store);
    info!(url = %config.redis.url, "Redis connected");

    let mut consumer = KafkaConsumer::new(&config.kafka)?;
    consumer.ensure_topic(&config.kafka.topic, Duration::from_secs(10))?;
    consumer.subscribe(&[config.kafka.topic.as_str()])?;

    let senders = Arc::new(SenderRegistry::from_config(&config));
    let pools = Arc::new(PoolSet::from_config(&config.pools, senders)?);
    pools.start_all()?;

    let admission = Arc::new(AdmissionController::new(
        Arc::clone(&store),
        &config.rate_limit,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let drain_handle = config.drain.enabled.then(|| {
        let drain = OverflowDrain::new(
            Arc::clone(&store),
            Arc::clone(&admission),
            Arc::clone(&pools),
            config.drain_batch_per_user(),
        );
        tokio::spawn(drain.run(shutdown_rx.clone()))
    });

    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = signal_tx.send(true);
    });

    let mut dispatcher = Dispatcher::new(admission, Arc::clone(&pools), &config.dispatcher);
    dispatcher.run(&mut consumer, shutdown_rx).await;

    // 消息源结束时同样需要通知回放任务退出
    let _ = shutdown_tx.send(true);
    if let Some(handle) = drain_handle
        && let Err(e) = handle.await
    {
        error!(error = %e, "溢出回放任务异常退出");
    }

    pools.stop_all().await;
    info!("Service shutdown complete");
    Ok(())
}

/// 优雅关闭信号处理
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, starting graceful shutdown...");
        }
    }
}
