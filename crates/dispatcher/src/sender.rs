//! 多渠道通知发送器
//!
//! 通过 `NotificationSender` trait 抽象发送行为，邮件与短信各自实现。
//! 当前版本为模拟发送（仅记录日志），便于在无外部依赖的情况下
//! 验证分发管道的完整性。替换为真实中继 / 短信网关时只需实现同一 trait。

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use notify_shared::config::{AppConfig, EmailConfig, SmsConfig};
use notify_shared::events::{NotificationChannel, NotificationTask};
use parking_lot::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::error::DispatchError;

/// 投递回执
#[derive(Debug, Clone)]
pub struct DeliveryReceipt {
    pub channel: NotificationChannel,
    /// 外部渠道返回的消息标识，用于追踪投递状态
    pub message_id: String,
    pub delivered_at: DateTime<Utc>,
}

impl DeliveryReceipt {
    fn new(channel: NotificationChannel) -> Self {
        Self {
            channel,
            message_id: Uuid::now_v7().to_string(),
            delivered_at: Utc::now(),
        }
    }
}

/// 通知发送器 trait，各渠道实现具体的推送逻辑
///
/// 发送器本身不重试，失败由 worker 记录后丢弃。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationSender: Send + Sync {
    /// 发送通知到指定渠道
    async fn send(&self, task: &NotificationTask) -> Result<DeliveryReceipt, DispatchError>;

    /// 该发送器支持的渠道
    fn channel(&self) -> NotificationChannel;
}

// ---------------------------------------------------------------------------
// 邮件发送器
// ---------------------------------------------------------------------------

/// 模拟邮件发送器
///
/// 按配置的中继地址与发件人组装 MIME 报文，记录日志代替 SMTP 投递。
pub struct EmailSender {
    config: EmailConfig,
}

impl EmailSender {
    pub fn new(config: EmailConfig) -> Self {
        Self { config }
    }

    /// 中继地址 `host:port`
    pub fn relay_addr(&self) -> String {
        format!("{}:{}", self.config.relay_host, self.config.relay_port)
    }

    /// 组装 HTML 邮件报文
    pub fn compose(&self, task: &NotificationTask) -> String {
        format!(
            "From: {}\r\nTo: {}\r\nSubject: {}\r\nMIME-Version: 1.0\r\n\
             Content-Type: text/html; charset=\"UTF-8\"\r\n\r\n{}\r\n",
            self.config.from, task.recipient, self.config.subject, task.message
        )
    }
}

#[async_trait]
impl NotificationSender for EmailSender {
    async fn send(&self, task: &NotificationTask) -> Result<DeliveryReceipt, DispatchError> {
        if !is_plausible_address(&task.recipient) {
            return Err(DispatchError::DeliveryFailed {
                channel: "email".to_string(),
                reason: format!("非法邮箱地址: {}", task.recipient),
            });
        }

        let body = self.compose(task);
        let receipt = DeliveryReceipt::new(NotificationChannel::Email);

        info!(
            channel = "email",
            user_id = %task.user_id,
            recipient = %task.recipient,
            relay = %self.relay_addr(),
            message_id = %receipt.message_id,
            bytes = body.len(),
            "模拟发送邮件通知"
        );

        Ok(receipt)
    }

    fn channel(&self) -> NotificationChannel {
        NotificationChannel::Email
    }
}

fn is_plausible_address(addr: &str) -> bool {
    match addr.split_once('@') {
        Some((local, domain)) => !local.is_empty() && domain.contains('.'),
        None => false,
    }
}

// ---------------------------------------------------------------------------
// 短信发送器
// ---------------------------------------------------------------------------

/// 模拟短信发送器
///
/// 生产环境中替换为短信服务商网关的 API 调用
pub struct SmsSender {
    config: SmsConfig,
}

impl SmsSender {
    pub fn new(config: SmsConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl NotificationSender for SmsSender {
    async fn send(&self, task: &NotificationTask) -> Result<DeliveryReceipt, DispatchError> {
        let number = task.recipient.strip_prefix('+').unwrap_or(&task.recipient);
        if number.is_empty() || !number.chars().all(|c| c.is_ascii_digit()) {
            return Err(DispatchError::DeliveryFailed {
                channel: "sms".to_string(),
                reason: format!("非法手机号: {}", task.recipient),
            });
        }

        let receipt = DeliveryReceipt::new(NotificationChannel::Sms);

        info!(
            channel = "sms",
            user_id = %task.user_id,
            recipient = %task.recipient,
            provider = %self.config.provider_url,
            message_id = %receipt.message_id,
            body = %task.message,
            "模拟发送短信通知"
        );

        Ok(receipt)
    }

    fn channel(&self) -> NotificationChannel {
        NotificationChannel::Sms
    }
}

// ---------------------------------------------------------------------------
// 测试用发送器
// ---------------------------------------------------------------------------

/// 记录所有收到的任务，可切换为失败模式
///
/// 集成测试通过它断言任务落在哪个池、以什么顺序投递。
pub struct CapturingSender {
    channel: NotificationChannel,
    delivered: Mutex<Vec<NotificationTask>>,
    failing: AtomicBool,
}

impl CapturingSender {
    pub fn new(channel: NotificationChannel) -> Self {
        Self {
            channel,
            delivered: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// 已成功投递的任务（按投递顺序）
    pub fn delivered(&self) -> Vec<NotificationTask> {
        self.delivered.lock().clone()
    }
}

#[async_trait]
impl NotificationSender for CapturingSender {
    async fn send(&self, task: &NotificationTask) -> Result<DeliveryReceipt, DispatchError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(DispatchError::DeliveryFailed {
                channel: self.channel.to_string(),
                reason: "capturing sender set to fail".to_string(),
            });
        }
        self.delivered.lock().push(task.clone());
        Ok(DeliveryReceipt::new(self.channel.clone()))
    }

    fn channel(&self) -> NotificationChannel {
        self.channel.clone()
    }
}

// ---------------------------------------------------------------------------
// 发送器注册表
// ---------------------------------------------------------------------------

/// 渠道到发送器的映射，所有 worker 共享
#[derive(Clone, Default)]
pub struct SenderRegistry {
    senders: HashMap<NotificationChannel, Arc<dyn NotificationSender>>,
}

impl SenderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 按配置构造邮件与短信发送器
    pub fn from_config(config: &AppConfig) -> Self {
        Self::new()
            .with_sender(Arc::new(EmailSender::new(config.email.clone())))
            .with_sender(Arc::new(SmsSender::new(config.sms.clone())))
    }

    /// 注册发送器，同一渠道后注册的覆盖先注册的
    pub fn with_sender(mut self, sender: Arc<dyn NotificationSender>) -> Self {
        self.senders.insert(sender.channel(), sender);
        self
    }

    pub fn get(&self, channel: &NotificationChannel) -> Option<&Arc<dyn NotificationSender>> {
        self.senders.get(channel)
    }
}

// ---------------------------------------------------------------------------
// 测试
// ---------------------------------------------------------------------------
