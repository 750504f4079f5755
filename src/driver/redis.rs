use crate::driver::{Job, JobState, QueueDriver, delayed_name, reserved_name};
use crate::{Payload, QueueError, Result, payload};
use async_trait::async_trait;
use deadpool_redis::{Connection, Pool};
use log::error;
use redis::AsyncCommands;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;

/// Pop: promote due delayed envelopes, reclaim expired reservations,
/// LPOP one envelope and install its reservation, all inside one script
/// invocation so the reservation is atomic with the dequeue.
///
/// KEYS: ready list, delayed zset, reserved zset. ARGV: now (unix secs).
/// Returns {popped envelope, reserved-form envelope}, empty strings when
/// nothing is eligible.
const POP_SCRIPT: &str = r#"
local due = redis.call('zrangebyscore', KEYS[2], '-inf', ARGV[1])
if #due > 0 then
    redis.call('zremrangebyscore', KEYS[2], '-inf', ARGV[1])
    for i = 1, #due, 100 do
        redis.call('rpush', KEYS[1], unpack(due, i, math.min(i + 99, #due)))
    end
end

local expired = redis.call('zrangebyscore', KEYS[3], '-inf', ARGV[1])
if #expired > 0 then
    redis.call('zremrangebyscore', KEYS[3], '-inf', ARGV[1])
    for i = #expired, 1, -1 do
        redis.call('lpush', KEYS[1], expired[i])
    end
end

local job = redis.call('lpop', KEYS[1])
if job == false then
    return {'', ''}
end

local decoded = cjson.decode(job)
decoded['Attempts'] = decoded['Attempts'] + 1
if decoded['PopTime'] == 0 then
    decoded['PopTime'] = tonumber(ARGV[1])
end
decoded['TimeoutAt'] = tonumber(ARGV[1]) + decoded['Timeout']
local reserved = cjson.encode(decoded)
redis.call('zadd', KEYS[3], decoded['TimeoutAt'], reserved)
return {job, reserved}
"#;

/// Release: drop the reservation and re-enter the envelope as delayed.
/// KEYS: reserved zset, delayed zset. ARGV: reserved member, available_at.
const RELEASE_SCRIPT: &str = r#"
redis.call('zrem', KEYS[1], ARGV[1])
redis.call('zadd', KEYS[2], ARGV[2], ARGV[1])
return true
"#;

/// Redis backend: ready list `{name}`, delayed zset `{name}:delayed`
/// (score = available_at), reserved zset `{name}:reserved` (score =
/// ReservedUntil). Multi-process safe through script atomicity.
#[derive(Clone)]
pub struct RedisDriver {
    pool: Pool,
    pop_script: Arc<redis::Script>,
    release_script: Arc<redis::Script>,
}

impl RedisDriver {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            pop_script: Arc::new(redis::Script::new(POP_SCRIPT)),
            release_script: Arc::new(redis::Script::new(RELEASE_SCRIPT)),
        }
    }

    async fn get_conn(&self) -> Result<Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| QueueError::Storage(format!("failed to get redis connection: {e}")))
    }
}

#[async_trait]
impl QueueDriver for RedisDriver {
    async fn size(&self, queue: &str) -> Result<i64> {
        let mut conn = self.get_conn().await?;
        let now = OffsetDateTime::now_utc().unix_timestamp();

        let (ready, due_delayed, expired_reserved): (i64, i64, i64) = redis::pipe()
            .llen(queue)
            .zcount(delayed_name(queue), "-inf", now)
            .zcount(reserved_name(queue), "-inf", now)
            .query_async(&mut conn)
            .await?;

        Ok(ready + due_delayed + expired_reserved)
    }

    async fn push(&self, queue: &str, bytes: &[u8]) -> Result<()> {
        let mut conn = self.get_conn().await?;
        let _: () = conn.rpush(queue, bytes).await?;
        Ok(())
    }

    async fn later(&self, queue: &str, delay: Duration, bytes: &[u8]) -> Result<()> {
        self.later_at(queue, OffsetDateTime::now_utc() + delay, bytes)
            .await
    }

    async fn later_at(&self, queue: &str, at: OffsetDateTime, bytes: &[u8]) -> Result<()> {
        let mut conn = self.get_conn().await?;
        let _: () = conn
            .zadd(delayed_name(queue), bytes, at.unix_timestamp())
            .await?;
        Ok(())
    }

    async fn pop(&self, queue: &str) -> Result<Option<Arc<dyn Job>>> {
        let mut conn = self.get_conn().await?;
        let now = OffsetDateTime::now_utc();

        let (_job, reserved): (String, String) = self
            .pop_script
            .key(queue)
            .key(delayed_name(queue))
            .key(reserved_name(queue))
            .arg(now.unix_timestamp())
            .invoke_async(&mut conn)
            .await?;

        if reserved.is_empty() {
            return Ok(None);
        }

        // The reserved-form string is the zset member Release/Delete act
        // on. A decode failure drops the reservation so the poison entry
        // cannot wedge the queue.
        let decoded: Payload = match payload::decode(reserved.as_bytes()) {
            Ok(decoded) => decoded,
            Err(err) => {
                error!("drop undecodable job on queue {queue}: {err}");
                let _: () = conn.zrem(reserved_name(queue), &reserved).await?;
                return Err(QueueError::Storage(format!(
                    "drop undecodable job on queue {queue}: {err}"
                )));
            }
        };

        Ok(Some(Arc::new(RedisJob {
            pool: self.pool.clone(),
            release_script: Arc::clone(&self.release_script),
            queue: queue.to_string(),
            reserved,
            state: JobState::new(decoded, now),
        })))
    }
}

struct RedisJob {
    pool: Pool,
    release_script: Arc<redis::Script>,
    queue: String,
    /// Exact member string held in the `:reserved` zset.
    reserved: String,
    state: JobState,
}

#[async_trait]
impl Job for RedisJob {
    async fn release(&self, delay: i64) -> Result<()> {
        self.state.mark_released();

        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| QueueError::Storage(format!("failed to get redis connection: {e}")))?;
        let available_at = OffsetDateTime::now_utc().unix_timestamp() + delay.max(0);

        let _: () = self
            .release_script
            .key(reserved_name(&self.queue))
            .key(delayed_name(&self.queue))
            .arg(&self.reserved)
            .arg(available_at)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        self.state.mark_deleted();

        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| QueueError::Storage(format!("failed to get redis connection: {e}")))?;
        let _: () = conn
            .zrem(reserved_name(&self.queue), &self.reserved)
            .await?;
        Ok(())
    }

    async fn failed(&self, _err: &QueueError) {}

    fn is_deleted(&self) -> bool {
        self.state.is_deleted()
    }

    fn is_released(&self) -> bool {
        self.state.is_released()
    }

    fn has_failed(&self) -> bool {
        self.state.has_failed()
    }

    fn mark_as_failed(&self) {
        self.state.mark_failed();
    }

    fn attempts(&self) -> i64 {
        self.state.payload().attempts
    }

    fn pop_time(&self) -> OffsetDateTime {
        self.state.pop_time()
    }

    fn timeout(&self) -> Duration {
        self.state.timeout()
    }

    fn timeout_at(&self) -> OffsetDateTime {
        self.state.timeout_at()
    }

    fn name(&self) -> &str {
        &self.queue
    }

    fn payload(&self) -> &Payload {
        self.state.payload()
    }
}
