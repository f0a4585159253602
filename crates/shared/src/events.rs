//! 通知任务模型
//!
//! 定义在 Kafka 与 Redis 溢出队列之间流转的通知任务格式，以及投递渠道枚举。
//! 任务由上游接入服务写入 Kafka，消费端解码后交给准入控制和工作池。

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// 投递渠道
// ---------------------------------------------------------------------------

/// 投递渠道
///
/// 线上格式为小写字符串（`email` / `sms`），大小写不敏感。
/// 无法识别的取值保留在 `Unrecognized` 中，不在解码阶段失败，
/// 由 worker 记录日志后丢弃。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum NotificationChannel {
    Email,
    Sms,
    Unrecognized(String),
}

impl NotificationChannel {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Email => "email",
            Self::Sms => "sms",
            Self::Unrecognized(raw) => raw.as_str(),
        }
    }

    /// 指标标签取值；无法识别的渠道统一归为 `unknown`，不把原始输入带进标签
    pub fn metric_label(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Sms => "sms",
            Self::Unrecognized(_) => "unknown",
        }
    }

    pub fn is_recognized(&self) -> bool {
        !matches!(self, Self::Unrecognized(_))
    }
}

impl From<String> for NotificationChannel {
    fn from(raw: String) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "email" => Self::Email,
            "sms" => Self::Sms,
            _ => Self::Unrecognized(raw),
        }
    }
}

impl From<NotificationChannel> for String {
    fn from(channel: NotificationChannel) -> Self {
        channel.as_str().to_string()
    }
}

impl std::fmt::Display for NotificationChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// 通知任务
// ---------------------------------------------------------------------------

/// 通知任务
///
/// 构造后不可变。同时兼容接入服务早期写出的大写字段名（`UserID` 等）。
/// 任务本身不携带去重标识，Kafka 重投递时可能被重复发送。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationTask {
    #[serde(alias = "UserID", alias = "userId")]
    pub user_id: String,
    #[serde(rename = "type", alias = "Type")]
    pub channel: NotificationChannel,
    #[serde(alias = "Recipient")]
    pub recipient: String,
    #[serde(alias = "Message")]
    pub message: String,
}

impl NotificationTask {
    pub fn new(
        user_id: impl Into<String>,
        channel: NotificationChannel,
        recipient: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            channel,
            recipient: recipient.into(),
            message: message.into(),
        }
    }

    pub fn email(
        user_id: impl Into<String>,
        recipient: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(user_id, NotificationChannel::Email, recipient, message)
    }

    pub fn sms(
        user_id: impl Into<String>,
        recipient: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(user_id, NotificationChannel::Sms, recipient, message)
    }

    /// 编码为 JSON 字节，用于 Kafka 负载和溢出队列条目
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(payload: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_wire_format() {
        let task = NotificationTask::email("u1", "a@example.com", "hello");
        let json: serde_json::Value = serde_json::from_str(&task.to_json().unwrap()).unwrap();

        assert_eq!(json["user_id"], "u1");
        assert_eq!(json["type"], "email");
        assert_eq!(json["recipient"], "a@example.com");
        assert_eq!(json["message"], "hello");
    }

    #[test]
    fn test_task_accepts_capitalized_fields() {
        let payload = br#"{"UserID":"u9","Type":"SMS","Recipient":"+100","Message":"hi"}"#;
        let task = NotificationTask::from_json(payload).unwrap();

        assert_eq!(task.user_id, "u9");
        assert_eq!(task.channel, NotificationChannel::Sms);
        assert_eq!(task.recipient, "+100");
    }

    #[test]
    fn test_unknown_channel_decodes_as_unrecognized() {
        let payload = br#"{"user_id":"u1","type":"pigeon","recipient":"r","message":"m"}"#;
        let task = NotificationTask::from_json(payload).unwrap();

        assert_eq!(
            task.channel,
            NotificationChannel::Unrecognized("pigeon".to_string())
        );
        assert!(!task.channel.is_recognized());
        assert_eq!(task.channel.to_string(), "pigeon");
    }

    #[test]
    fn test_metric_label_is_bounded() {
        assert_eq!(NotificationChannel::Email.metric_label(), "email");
        assert_eq!(NotificationChannel::from("SMS".to_string()).metric_label(), "sms");
        for raw in ["pigeon", "fax", "carrier-pigeon-42"] {
            let channel = NotificationChannel::from(raw.to_string());
            assert_eq!(channel.metric_label(), "unknown");
            assert_eq!(channel.as_str(), raw);
        }
    }

    #[test]
    fn test_missing_field_is_decode_error() {
        let payload = br#"{"user_id":"u1","type":"email"}"#;
        assert!(NotificationTask::from_json(payload).is_err());
        assert!(NotificationTask::from_json(b"not json").is_err());
    }
}
