//! 共享计数存储
//!
//! 准入控制依赖的跨进程共享状态：每用户固定窗口计数器与每用户溢出队列。
//! 所有修改都通过 Redis 原子命令或 Lua 脚本完成，客户端不做任何加锁。

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use tracing::{debug, info, instrument};

use crate::config::RedisConfig;
use crate::error::{NotifyError, Result};

/// 溢出条目写入位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPlacement {
    /// 追加到队尾（新到达的任务）
    Back,
    /// 放回队首（回放时再次被拒绝的任务，保持 FIFO）
    Front,
}

impl OverflowPlacement {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Back => "back",
            Self::Front => "front",
        }
    }
}

/// 一次窗口计数的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowAdmission {
    /// 本窗口内的计数（含本次）
    pub count: u64,
    /// 超限时写入后的溢出队列长度；未超限为 `None`
    pub queued: Option<u64>,
}

/// 计数存储抽象
///
/// 生产环境由 Redis 实现，测试使用 `test_utils::MemoryCounterStore`。
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// 递增用户窗口计数，超过 `limit` 时把 `payload` 写入溢出队列
    ///
    /// 计数、过期时间和入队在一次原子操作中完成：失败时计数不变，任务也不会入队。
    async fn admit(
        &self,
        user_id: &str,
        window: Duration,
        limit: u64,
        payload: &str,
        placement: OverflowPlacement,
    ) -> Result<WindowAdmission>;

    /// 写入用户溢出队列，并把用户登记到待回放集合，返回队列长度
    async fn push_overflow(
        &self,
        user_id: &str,
        payload: &str,
        placement: OverflowPlacement,
    ) -> Result<u64>;

    /// 弹出用户溢出队列最早的条目；队列清空时把用户移出待回放集合
    async fn pop_overflow(&self, user_id: &str) -> Result<Option<String>>;

    /// 当前有溢出条目的用户
    async fn overflow_users(&self) -> Result<Vec<String>>;

    async fn overflow_len(&self, user_id: &str) -> Result<u64>;

    async fn ping(&self) -> Result<()>;
}

/// 存储键生成器
pub struct StoreKey;

impl StoreKey {
    pub const OVERFLOW_USERS: &'static str = "overflow:users";

    pub fn rate(user_id: &str) -> String {
        format!("rate:{}", user_id)
    }

    pub fn queue(user_id: &str) -> String {
        format!("queue:{}", user_id)
    }
}

// KEYS: rate, queue, overflow:users
// ARGV: window_ms, limit, payload, side, user_id
// 计数器缺少过期时间时一并补上；超限任务在同一脚本内入队
const ADMIT_SCRIPT: &str = r#"
    local count = redis.call("INCR", KEYS[1])
    if count == 1 or redis.call("PTTL", KEYS[1]) < 0 then
        redis.call("PEXPIRE", KEYS[1], ARGV[1])
    end
    if count <= tonumber(ARGV[2]) then
        return {count, -1}
    end
    if ARGV[4] == "front" then
        redis.call("LPUSH", KEYS[2], ARGV[3])
    else
        redis.call("RPUSH", KEYS[2], ARGV[3])
    end
    redis.call("SADD", KEYS[3], ARGV[5])
    return {count, redis.call("LLEN", KEYS[2])}
"#;

const PUSH_OVERFLOW_SCRIPT: &str = r#"
    if ARGV[2] == "front" then
        redis.call("LPUSH", KEYS[1], ARGV[1])
    else
        redis.call("RPUSH", KEYS[1], ARGV[1])
    end
    redis.call("SADD", KEYS[2], ARGV[3])
    return redis.call("LLEN", KEYS[1])
"#;

const POP_OVERFLOW_SCRIPT: &str = r#"
    local value = redis.call("LPOP", KEYS[1])
    if redis.call("LLEN", KEYS[1]) == 0 then
        redis.call("SREM", KEYS[2], ARGV[1])
    end
    return value
"#;

/// Redis 计数存储
#[derive(Clone)]
pub struct RedisCounterStore {
    conn: ConnectionManager,
}

impl RedisCounterStore {
    /// 建立连接
    ///
    /// ConnectionManager 在首次连接失败时直接返回错误，断线后自动重连。
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let client = Client::open(config.url.as_str())?;
        let conn = ConnectionManager::new(client).await?;
        info!(url = %config.url, "Redis 计数存储已连接");
        Ok(Self { conn })
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    #[instrument(skip(self, payload))]
    async fn admit(
        &self,
        user_id: &str,
        window: Duration,
        limit: u64,
        payload: &str,
        placement: OverflowPlacement,
    ) -> Result<WindowAdmission> {
        let mut conn = self.conn.clone();
        let (count, queued): (u64, i64) = Script::new(ADMIT_SCRIPT)
            .key(StoreKey::rate(user_id))
            .key(StoreKey::queue(user_id))
            .key(StoreKey::OVERFLOW_USERS)
            .arg(window.as_millis() as u64)
            .arg(limit)
            .arg(payload)
            .arg(placement.as_str())
            .arg(user_id)
            .invoke_async(&mut conn)
            .await?;
        Ok(WindowAdmission {
            count,
            queued: u64::try_from(queued).ok(),
        })
    }

    #[instrument(skip(self, payload))]
    async fn push_overflow(
        &self,
        user_id: &str,
        payload: &str,
        placement: OverflowPlacement,
    ) -> Result<u64> {
        let mut conn = self.conn.clone();
        let len: u64 = Script::new(PUSH_OVERFLOW_SCRIPT)
            .key(StoreKey::queue(user_id))
            .key(StoreKey::OVERFLOW_USERS)
            .arg(payload)
            .arg(placement.as_str())
            .arg(user_id)
            .invoke_async(&mut conn)
            .await?;
        debug!(user_id, len, "任务已写入溢出队列");
        Ok(len)
    }

    #[instrument(skip(self))]
    async fn pop_overflow(&self, user_id: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = Script::new(POP_OVERFLOW_SCRIPT)
            .key(StoreKey::queue(user_id))
            .key(StoreKey::OVERFLOW_USERS)
            .arg(user_id)
            .invoke_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn overflow_users(&self) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let users: Vec<String> = conn.smembers(StoreKey::OVERFLOW_USERS).await?;
        Ok(users)
    }

    async fn overflow_len(&self, user_id: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let len: u64 = conn.llen(StoreKey::queue(user_id)).await?;
        Ok(len)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map(|_| ())
            .map_err(NotifyError::from)
    }
}
