//! Kafka 基础设施封装
//!
//! 将 rdkafka 的底层 API 封装为 Producer / Consumer 抽象，统一消息序列化与错误映射。
//! 分发器通过 `RecordSource` trait 拉取消息，测试中可替换为内存实现。

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::producer::{FutureProducer, FutureRecord};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::config::KafkaConfig;
use crate::error::NotifyError;

// ---------------------------------------------------------------------------
// ConsumerMessage
// ---------------------------------------------------------------------------

/// 消费到的 Kafka 消息的统一表示
///
/// 将 rdkafka 的 `BorrowedMessage`（带生命周期约束）转换为拥有所有权的结构体，
/// 使消息可以安全地跨 await 点传递给异步处理函数。
#[derive(Debug, Clone)]
pub struct ConsumerMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub timestamp: Option<i64>,
    pub headers: HashMap<String, String>,
}

impl ConsumerMessage {
    /// 从 rdkafka 的借用消息构造，提取并拥有所有字段
    fn from_borrowed(msg: &BorrowedMessage<'_>) -> Self {
        let key = msg
            .key()
            .and_then(|k| std::str::from_utf8(k).ok())
            .map(String::from);

        let payload = msg.payload().map(|p| p.to_vec()).unwrap_or_default();

        let mut headers = HashMap::new();
        if let Some(h) = msg.headers() {
            for idx in 0..h.count() {
                let header = h.get(idx);
                if let Some(raw) = header.value
                    && let Ok(value) = std::str::from_utf8(raw)
                {
                    headers.insert(header.key.to_string(), value.to_string());
                }
            }
        }

        Self {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            key,
            payload,
            timestamp: msg.timestamp().to_millis(),
            headers,
        }
    }

    /// 构造不带 Kafka 元数据的消息，供内存数据源使用
    pub fn from_payload(topic: &str, offset: i64, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.to_string(),
            partition: 0,
            offset,
            key: None,
            payload: payload.into(),
            timestamp: None,
            headers: HashMap::new(),
        }
    }

    /// 将 JSON 格式负载反序列化为目标类型
    pub fn deserialize_payload<T: DeserializeOwned>(&self) -> Result<T, NotifyError> {
        serde_json::from_slice(&self.payload).map_err(NotifyError::from)
    }
}

// ---------------------------------------------------------------------------
// RecordSource
// ---------------------------------------------------------------------------

/// 有序消息来源
///
/// 返回 `None` 表示消息流已结束；`Some(Err)` 表示单次读取失败，调用方记录后继续。
/// 位点提交由具体实现负责（Kafka 使用消费组自动提交）。
#[async_trait]
pub trait RecordSource: Send {
    async fn next_record(&mut self) -> Option<Result<ConsumerMessage, NotifyError>>;
}

// ---------------------------------------------------------------------------
// KafkaProducer
// ---------------------------------------------------------------------------

/// 面向业务的 Kafka 生产者
///
/// `FutureProducer` 本身是 Arc 包装的，可以低成本 Clone。
#[derive(Clone)]
pub struct KafkaProducer {
    producer: FutureProducer,
}

impl KafkaProducer {
    /// 根据配置创建生产者
    ///
    /// 要求所有副本确认（acks=all），5 秒内无法投递即返回错误。
    pub fn new(config: &KafkaConfig) -> Result<Self, NotifyError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("acks", "all")
            .set("message.timeout.ms", "5000")
            .create()
            .map_err(|e| NotifyError::Kafka(format!("创建生产者失败: {e}")))?;

        info!(brokers = %config.brokers, "Kafka 生产者已初始化");
        Ok(Self { producer })
    }

    /// 发送原始字节消息
    pub async fn send(
        &self,
        topic: &str,
        key: &str,
        payload: &[u8],
    ) -> Result<(i32, i64), NotifyError> {
        let record = FutureRecord::to(topic).key(key).payload(payload);

        let delivery = self
            .producer
            .send(record, Duration::from_secs(5))
            .await
            .map_err(|(e, _)| NotifyError::Kafka(format!("发送消息失败: {e}")))?;

        debug!(
            topic,
            key,
            partition = delivery.partition,
            offset = delivery.offset,
            "消息已发送"
        );
        Ok((delivery.partition, delivery.offset))
    }

    /// 将值序列化为 JSON 后发送
    pub async fn send_json<T: Serialize>(
        &self,
        topic: &str,
        key: &str,
        value: &T,
    ) -> Result<(i32, i64), NotifyError> {
        let payload = serde_json::to_vec(value)?;
        self.send(topic, key, &payload).await
    }
}

// ---------------------------------------------------------------------------
// KafkaConsumer
// ---------------------------------------------------------------------------

/// 面向业务的 Kafka 消费者
///
/// 使用命名消费组，重启后从上次提交的位点继续消费（至少一次语义）。
pub struct KafkaConsumer {
    consumer: StreamConsumer,
}

impl KafkaConsumer {
    pub fn new(config: &KafkaConfig) -> Result<Self, NotifyError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &config.consumer_group)
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("enable.auto.commit", "true")
            .create()
            .map_err(|e| NotifyError::Kafka(format!("创建消费者失败: {e}")))?;

        info!(
            brokers = %config.brokers,
            group_id = %config.consumer_group,
            "Kafka 消费者已初始化"
        );
        Ok(Self { consumer })
    }

    /// 订阅指定的 topic 列表
    pub fn subscribe(&self, topics: &[&str]) -> Result<(), NotifyError> {
        self.consumer
            .subscribe(topics)
            .map_err(|e| NotifyError::Kafka(format!("订阅 topic 失败: {e}")))?;

        info!(?topics, "已订阅 Kafka topics");
        Ok(())
    }

    /// 确认 broker 可达且 topic 元数据可读
    ///
    /// 阻塞调用，仅在启动期使用。
    pub fn ensure_topic(&self, topic: &str, timeout: Duration) -> Result<(), NotifyError> {
        let metadata = self
            .consumer
            .fetch_metadata(Some(topic), timeout)
            .map_err(|e| NotifyError::Kafka(format!("获取 topic 元数据失败: {e}")))?;

        match metadata.topics().iter().find(|t| t.name() == topic) {
            Some(t) if t.error().is_none() => {
                info!(topic, partitions = t.partitions().len(), "Kafka topic 可用");
                Ok(())
            }
            Some(t) => Err(NotifyError::Kafka(format!(
                "topic {topic} 不可用: {:?}",
                t.error()
            ))),
            None => Err(NotifyError::Kafka(format!("topic {topic} 不存在"))),
        }
    }
}

#[async_trait]
impl RecordSource for KafkaConsumer {
    async fn next_record(&mut self) -> Option<Result<ConsumerMessage, NotifyError>> {
        let result = match self.consumer.recv().await {
            Ok(borrowed) => Ok(ConsumerMessage::from_borrowed(&borrowed)),
            Err(e) => Err(NotifyError::Kafka(format!("接收 Kafka 消息出错: {e}"))),
        };
        Some(result)
    }
}
