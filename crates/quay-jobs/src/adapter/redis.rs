//! Leased-queue adapter on Redis.
//!
//! Per queue:
//!
//! ```text
//! {prefix}:queue:{q}:ready     ZSET  id -> priority * weight + enqueued_ms
//! {prefix}:queue:{q}:delayed   ZSET  id -> ready_at_ms
//! {prefix}:queue:{q}:reserved  ZSET  id -> lease_deadline_ms
//! {prefix}:queue:{q}:buried    ZSET  id -> buried_at_ms
//! {prefix}:message:{id}        HASH  body, priority, ttr, reserves, lease
//! ```
//!
//! Scores count milliseconds from 2024-01-01 UTC. Pop, release, delete and
//! bury run as Lua scripts so the state transitions are atomic; all but pop
//! check the lease token first. Pop promotes due delayed messages and
//! expired leases back to ready before reserving. The scripts address message
//! hashes through a key prefix, so the adapter targets standalone Redis, not
//! Cluster.

use super::{poll_until, Adapter, AdapterOptions, Capabilities, Lease, MessageId, PushOptions};
use crate::envelope::Envelope;
use async_trait::async_trait;
use chrono::Utc;
use deadpool_redis::{Config, Pool, PoolError, Runtime};
use quay_config::RedisSettings;
use quay_core::{QueueError, QueueResult};
use redis::{AsyncCommands, RedisError, Script};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

const NAME: &str = "redis";

/// Millisecond timestamps in scores count from 2024-01-01T00:00:00Z.
const SCORE_EPOCH_MS: i64 = 1_704_067_200_000;

/// Score weight separating priorities: 2^40 ms, about 34 years past the
/// score epoch.
pub const PRIORITY_WEIGHT: f64 = 1_099_511_627_776.0;

/// Highest priority value kept in scores. With 2^12 priorities of 2^40 ms
/// each every ready score stays below 2^52, so adjacent milliseconds never
/// collapse into one f64.
pub const MAX_PRIORITY: u32 = 4095;

const POP_SCRIPT: &str = r"
local now = tonumber(ARGV[1])
local weight = tonumber(ARGV[4])

local function promote(key)
  local due = redis.call('ZRANGEBYSCORE', key, '-inf', now)
  for _, id in ipairs(due) do
    redis.call('ZREM', key, id)
    local priority = redis.call('HGET', ARGV[2] .. id, 'priority')
    if priority then
      redis.call('HDEL', ARGV[2] .. id, 'lease')
      redis.call('ZADD', KEYS[1], tonumber(priority) * weight + now, id)
    end
  end
end

promote(KEYS[2])
promote(KEYS[3])

while true do
  local popped = redis.call('ZPOPMIN', KEYS[1])
  if #popped == 0 then
    return false
  end
  local id = popped[1]
  local key = ARGV[2] .. id
  local body = redis.call('HGET', key, 'body')
  if body then
    local ttr = tonumber(redis.call('HGET', key, 'ttr') or '60000')
    local reserves = redis.call('HINCRBY', key, 'reserves', 1)
    redis.call('HSET', key, 'lease', ARGV[3])
    redis.call('ZADD', KEYS[3], now + ttr, id)
    return {id, body, reserves}
  end
end
";

const RELEASE_SCRIPT: &str = r"
if redis.call('HGET', KEYS[4], 'lease') ~= ARGV[2] then
  return 0
end
if redis.call('ZREM', KEYS[1], ARGV[1]) == 0 then
  return 0
end
redis.call('HDEL', KEYS[4], 'lease')
local now = tonumber(ARGV[3])
local delay = tonumber(ARGV[4])
if delay > 0 then
  redis.call('ZADD', KEYS[3], now + delay, ARGV[1])
else
  local priority = tonumber(redis.call('HGET', KEYS[4], 'priority') or '1024')
  redis.call('ZADD', KEYS[2], priority * tonumber(ARGV[5]) + now, ARGV[1])
end
return 1
";

const DELETE_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[5]) == 0 then
  return 1
end
if redis.call('HGET', KEYS[5], 'lease') ~= ARGV[2] then
  return 0
end
for i = 1, 4 do
  redis.call('ZREM', KEYS[i], ARGV[1])
end
redis.call('DEL', KEYS[5])
return 1
";

const BURY_SCRIPT: &str = r"
if redis.call('HGET', KEYS[3], 'lease') ~= ARGV[2] then
  return 0
end
if redis.call('ZREM', KEYS[1], ARGV[1]) == 0 then
  return 0
end
redis.call('HDEL', KEYS[3], 'lease')
redis.call('ZADD', KEYS[2], tonumber(ARGV[3]), ARGV[1])
return 1
";

/// Create a Redis connection pool and check it with a PING.
pub async fn create_pool(settings: &RedisSettings) -> QueueResult<Pool> {
    info!("Creating Redis connection pool for queue adapter...");

    let cfg = Config::from_url(&settings.url);

    let pool = cfg
        .builder()
        .map_err(|e| QueueError::Configuration(format!("Invalid Redis config: {}", e)))?
        .max_size(settings.pool_size)
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| QueueError::Configuration(format!("Failed to create pool: {}", e)))?;

    let mut conn = pool.get().await.map_err(pool_error)?;
    redis::cmd("PING")
        .query_async::<String>(&mut *conn)
        .await
        .map_err(redis_error)?;

    info!("Redis connection pool created successfully");

    Ok(pool)
}

/// Redis key builder.
#[derive(Debug, Clone)]
pub struct RedisKeys {
    prefix: String,
}

impl RedisKeys {
    /// Create a new key builder with the given prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Ready messages (sorted set by priority score).
    pub fn ready(&self, queue: &str) -> String {
        format!("{}:queue:{}:ready", self.prefix, queue)
    }

    /// Delayed messages (sorted set by ready-at time).
    pub fn delayed(&self, queue: &str) -> String {
        format!("{}:queue:{}:delayed", self.prefix, queue)
    }

    /// Leased messages (sorted set by lease deadline).
    pub fn reserved(&self, queue: &str) -> String {
        format!("{}:queue:{}:reserved", self.prefix, queue)
    }

    /// Buried messages (sorted set by burial time).
    pub fn buried(&self, queue: &str) -> String {
        format!("{}:queue:{}:buried", self.prefix, queue)
    }

    /// Prefix of message hashes; the id is appended.
    pub fn message_prefix(&self) -> String {
        format!("{}:message:", self.prefix)
    }

    /// Message hash.
    pub fn message(&self, id: &str) -> String {
        format!("{}{}", self.message_prefix(), id)
    }

    /// Every sorted set of a queue.
    pub fn states(&self, queue: &str) -> [String; 4] {
        [
            self.ready(queue),
            self.delayed(queue),
            self.reserved(queue),
            self.buried(queue),
        ]
    }
}

impl Default for RedisKeys {
    fn default() -> Self {
        Self::new("quay")
    }
}

/// Sorted-set score for a ready message.
/// Lower priority number = lower score = popped first; ties go by time.
/// `enqueued_at_ms` counts from the score epoch (see [`score_now`]);
/// priorities above [`MAX_PRIORITY`] are clamped.
pub fn priority_score(priority: u32, enqueued_at_ms: i64) -> f64 {
    f64::from(priority.min(MAX_PRIORITY)) * PRIORITY_WEIGHT + enqueued_at_ms as f64
}

/// Milliseconds since the score epoch.
pub fn score_now() -> i64 {
    (Utc::now().timestamp_millis() - SCORE_EPOCH_MS).max(0)
}

fn redis_error(err: RedisError) -> QueueError {
    if err.is_io_error()
        || err.is_connection_refusal()
        || err.is_connection_dropped()
        || err.is_timeout()
    {
        QueueError::Connection(err.to_string())
    } else {
        QueueError::Backend(err.to_string())
    }
}

fn pool_error(err: PoolError) -> QueueError {
    QueueError::Connection(err.to_string())
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Redis-backed adapter.
pub struct RedisAdapter {
    pool: Pool,
    keys: RedisKeys,
    options: AdapterOptions,
    poll_interval: Duration,
    pop_script: Script,
    release_script: Script,
    delete_script: Script,
    bury_script: Script,
}

impl RedisAdapter {
    /// Create a new adapter over an existing pool.
    pub fn new(pool: Pool, settings: &RedisSettings) -> Self {
        Self {
            pool,
            keys: RedisKeys::new(&settings.key_prefix),
            options: AdapterOptions::default(),
            poll_interval: settings.poll_interval(),
            pop_script: Script::new(POP_SCRIPT),
            release_script: Script::new(RELEASE_SCRIPT),
            delete_script: Script::new(DELETE_SCRIPT),
            bury_script: Script::new(BURY_SCRIPT),
        }
    }

    /// Replaces the push defaults.
    #[must_use]
    pub fn with_options(mut self, options: AdapterOptions) -> Self {
        self.options = options;
        self
    }

    /// Key builder in use.
    pub fn keys(&self) -> &RedisKeys {
        &self.keys
    }

    /// Get a connection from the pool.
    async fn conn(&self) -> QueueResult<deadpool_redis::Connection> {
        self.pool.get().await.map_err(pool_error)
    }

    async fn try_reserve(&self, queue: &str) -> QueueResult<Option<Lease>> {
        let mut conn = self.conn().await?;
        let token = Uuid::new_v4().to_string();

        let popped: Option<(String, String, u32)> = self
            .pop_script
            .key(self.keys.ready(queue))
            .key(self.keys.delayed(queue))
            .key(self.keys.reserved(queue))
            .arg(score_now())
            .arg(self.keys.message_prefix())
            .arg(&token)
            .arg(PRIORITY_WEIGHT)
            .invoke_async(&mut *conn)
            .await
            .map_err(redis_error)?;

        Ok(popped.map(|(id, body, attempts)| Lease {
            id,
            token: Some(token),
            body,
            attempts,
        }))
    }

    fn lost_lease(lease: &Lease) -> QueueError {
        QueueError::Backend(format!("lease on message {} is no longer held", lease.id))
    }
}

#[async_trait]
impl Adapter for RedisAdapter {
    fn name(&self) -> &'static str {
        NAME
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::FULL
    }

    async fn is_connected(&self) -> bool {
        let Ok(mut conn) = self.conn().await else {
            return false;
        };
        redis::cmd("PING")
            .query_async::<String>(&mut *conn)
            .await
            .is_ok()
    }

    async fn push(
        &self,
        queue: &str,
        envelope: &Envelope,
        options: &PushOptions,
    ) -> QueueResult<MessageId> {
        let body = envelope.encode()?;
        let push = self.options.resolve(options);
        let id = Uuid::new_v4().to_string();
        let now = score_now();

        let fields = [
            ("body", body),
            ("priority", push.priority.min(MAX_PRIORITY).to_string()),
            ("ttr", millis(push.lease_timeout).to_string()),
            ("reserves", "0".to_string()),
        ];

        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset_multiple(self.keys.message(&id), &fields)
            .ignore();

        if push.delay.is_zero() {
            pipe.zadd(
                self.keys.ready(queue),
                &id,
                priority_score(push.priority, now),
            )
            .ignore();
        } else {
            pipe.zadd(self.keys.delayed(queue), &id, now + millis(push.delay))
                .ignore();
        }

        let mut conn = self.conn().await?;
        let _: () = pipe.query_async(&mut *conn).await.map_err(redis_error)?;

        debug!(
            queue = %queue,
            message_id = %id,
            priority = push.priority,
            delay_ms = millis(push.delay),
            "Message pushed"
        );

        Ok(id)
    }

    async fn pop(&self, queue: &str, timeout: Duration) -> QueueResult<Lease> {
        poll_until(queue, timeout, self.poll_interval, move || {
            self.try_reserve(queue)
        })
        .await
    }

    async fn count(&self, queue: &str) -> QueueResult<u64> {
        let mut conn = self.conn().await?;
        let now = score_now();

        // Due delayed messages are ready even before a pop promotes them.
        let (ready, due): (u64, u64) = redis::pipe()
            .zcard(self.keys.ready(queue))
            .zcount(self.keys.delayed(queue), "-inf", now)
            .query_async(&mut *conn)
            .await
            .map_err(redis_error)?;

        Ok(ready + due)
    }

    async fn delete(&self, queue: &str, lease: &Lease) -> QueueResult<()> {
        let mut conn = self.conn().await?;

        let mut invocation = self.delete_script.prepare_invoke();
        for key in self.keys.states(queue) {
            invocation.key(key);
        }
        let deleted: i64 = invocation
            .key(self.keys.message(&lease.id))
            .arg(&lease.id)
            .arg(lease.token.as_deref().unwrap_or_default())
            .invoke_async(&mut *conn)
            .await
            .map_err(redis_error)?;

        if deleted == 0 {
            return Err(Self::lost_lease(lease));
        }

        debug!(queue = %queue, message_id = %lease.id, "Message deleted");
        Ok(())
    }

    async fn release(&self, queue: &str, lease: &Lease, delay: Duration) -> QueueResult<()> {
        let mut conn = self.conn().await?;

        let released: i64 = self
            .release_script
            .key(self.keys.reserved(queue))
            .key(self.keys.ready(queue))
            .key(self.keys.delayed(queue))
            .key(self.keys.message(&lease.id))
            .arg(&lease.id)
            .arg(lease.token.as_deref().unwrap_or_default())
            .arg(score_now())
            .arg(millis(delay))
            .arg(PRIORITY_WEIGHT)
            .invoke_async(&mut *conn)
            .await
            .map_err(redis_error)?;

        if released == 0 {
            return Err(Self::lost_lease(lease));
        }

        debug!(queue = %queue, message_id = %lease.id, delay_ms = millis(delay), "Message released");
        Ok(())
    }

    async fn bury(&self, queue: &str, lease: &Lease) -> QueueResult<()> {
        let mut conn = self.conn().await?;

        let buried: i64 = self
            .bury_script
            .key(self.keys.reserved(queue))
            .key(self.keys.buried(queue))
            .key(self.keys.message(&lease.id))
            .arg(&lease.id)
            .arg(lease.token.as_deref().unwrap_or_default())
            .arg(score_now())
            .invoke_async(&mut *conn)
            .await
            .map_err(redis_error)?;

        if buried == 0 {
            return Err(Self::lost_lease(lease));
        }

        debug!(queue = %queue, message_id = %lease.id, "Message buried");
        Ok(())
    }

    async fn clear(&self, queue: &str) -> QueueResult<()> {
        let mut conn = self.conn().await?;

        for key in self.keys.states(queue) {
            let ids: Vec<String> = conn.zrange(&key, 0, -1).await.map_err(redis_error)?;

            let mut pipe = redis::pipe();
            for id in &ids {
                pipe.del(self.keys.message(id)).ignore();
            }
            pipe.del(&key).ignore();

            let _: () = pipe.query_async(&mut *conn).await.map_err(redis_error)?;
        }

        info!(queue = %queue, "Queue cleared");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_keys() {
        let keys = RedisKeys::new("test");

        assert_eq!(keys.ready("default"), "test:queue:default:ready");
        assert_eq!(keys.delayed("default"), "test:queue:default:delayed");
        assert_eq!(keys.reserved("default"), "test:queue:default:reserved");
        assert_eq!(keys.buried("default"), "test:queue:default:buried");
        assert_eq!(keys.message("123"), "test:message:123");
    }

    #[test]
    fn test_states_cover_every_set() {
        let keys = RedisKeys::default();
        let states = keys.states("emails");
        assert!(states.iter().all(|k| k.starts_with("quay:queue:emails:")));
        assert_eq!(states.len(), 4);
    }

    #[test]
    fn test_priority_score_orders_priority_first() {
        let now = score_now();
        let urgent_late = priority_score(1, now + 60_000);
        let normal_early = priority_score(1024, now);
        assert!(urgent_late < normal_early);
    }

    #[test]
    fn test_priority_score_ties_by_time() {
        let now = score_now();
        assert!(priority_score(0, now) < priority_score(0, now + 1));
    }

    #[test]
    fn test_priority_score_keeps_adjacent_millis_apart() {
        // Thirty years past the epoch at the default and the highest priority.
        let later = 30 * 365 * 24 * 3_600_000_i64;
        for priority in [1024, MAX_PRIORITY] {
            let a = priority_score(priority, later);
            let b = priority_score(priority, later + 1);
            assert!((b - a - 1.0).abs() < f64::EPSILON);
        }
        assert!(priority_score(MAX_PRIORITY, later) < 2_f64.powi(53));
    }

    #[test]
    fn test_priority_score_clamps_priority() {
        let now = score_now();
        assert!(
            (priority_score(u32::MAX, now) - priority_score(MAX_PRIORITY, now)).abs()
                < f64::EPSILON
        );
    }

    #[test]
    fn test_score_now_counts_from_epoch() {
        let now = score_now();
        assert!(now > 0);
        assert!((now as f64) < PRIORITY_WEIGHT);
    }

    #[test]
    fn test_token_checked_before_every_disposition() {
        for script in [RELEASE_SCRIPT, DELETE_SCRIPT, BURY_SCRIPT] {
            assert!(script.contains("'lease') ~= ARGV[2]"));
        }
        // Missing messages delete silently.
        assert!(DELETE_SCRIPT.contains("'EXISTS', KEYS[5]) == 0 then\n  return 1"));
    }

    #[test]
    fn test_millis_saturates() {
        assert_eq!(millis(Duration::from_secs(2)), 2000);
        assert_eq!(millis(Duration::MAX), i64::MAX);
    }
}
