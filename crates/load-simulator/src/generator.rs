//! 任务生成器

use chrono::Utc;
use notify_shared::events::{NotificationChannel, NotificationTask};
use rand::Rng;

use crate::cli::ChannelMix;

/// 按渠道分布生成通知任务
#[derive(Debug, Clone)]
pub struct TaskGenerator {
    user_prefix: String,
    mix: ChannelMix,
}

impl TaskGenerator {
    pub fn new(user_prefix: impl Into<String>, mix: ChannelMix) -> Self {
        Self {
            user_prefix: user_prefix.into(),
            mix,
        }
    }

    /// 第 index 个用户的 ID（从 1 开始）
    pub fn user_id(&self, index: usize) -> String {
        format!("{}{}", self.user_prefix, index)
    }

    fn pick_channel(&self) -> NotificationChannel {
        match self.mix {
            ChannelMix::Email => NotificationChannel::Email,
            ChannelMix::Sms => NotificationChannel::Sms,
            ChannelMix::Mixed => {
                if rand::rng().random_bool(0.5) {
                    NotificationChannel::Email
                } else {
                    NotificationChannel::Sms
                }
            }
        }
    }

    /// 生成用户的第 seq 条任务
    pub fn task(&self, user_id: &str, seq: usize) -> NotificationTask {
        let channel = self.pick_channel();
        let recipient = match channel {
            NotificationChannel::Sms => phone_number(user_id),
            _ => format!("{user_id}@example.com"),
        };
        let message = format!(
            "Hello from {user_id} #{seq} at {}",
            Utc::now().to_rfc3339()
        );
        NotificationTask::new(user_id, channel, recipient, message)
    }
}

/// 由用户 ID 派生稳定的 11 位手机号
fn phone_number(user_id: &str) -> String {
    let hash = user_id
        .bytes()
        .fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(u64::from(b)));
    format!("+86138{:08}", hash % 100_000_000)
}
