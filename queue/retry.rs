use chrono::{DateTime, Utc};
use deadpool_redis::Connection;
use lazy_static::lazy_static;

use crate::{error::Error, QueueKeys};

// Count a failed delivery and either reschedule the message or dead-letter
// it. The attempt counter only moves here and in the reclaimer, so
// attempts can never pass max_retries + 1.
// KEYS:
//  1. inflight zset
//  2. delayed zset
//  3. payload hash
//  4. dead list for the topic
//  5. retention zset
//  6. stats hash
// ARGS:
//  1. message id
//  2. current time
//  3. backoff in millis
//  4. error text
//  5. expected lease score
//  6. dead retention window in millis
const RETRY_SCRIPT: &str = r##"
    local score = redis.call("ZSCORE", KEYS[1], ARGV[1])
    if not score or score ~= ARGV[5] then
        return "LOST"
    end

    redis.call("ZREM", KEYS[1], ARGV[1])
    local attempts = redis.call("HINCRBY", KEYS[3], "attempts", 1)
    local max_retries = tonumber(redis.call("HGET", KEYS[3], "max_retries")) or 0
    local expire_at = tonumber(redis.call("HGET", KEYS[3], "expire_at"))
    local next_at = tonumber(ARGV[2]) + tonumber(ARGV[3])

    if attempts > max_retries or (expire_at and next_at >= expire_at) then
        redis.call("HSET", KEYS[3], "state", "DEAD", "last_error", ARGV[4], "lease_expires_at", "")
        redis.call("LPUSH", KEYS[4], ARGV[1])
        redis.call("ZADD", KEYS[5], tonumber(ARGV[2]) + tonumber(ARGV[6]), ARGV[1])
        redis.call("HINCRBY", KEYS[6], "dead", 1)
        return "DEAD"
    end

    redis.call("HSET", KEYS[3], "state", "DELAYED", "scheduled_at", next_at, "last_error", ARGV[4], "lease_expires_at", "")
    redis.call("ZADD", KEYS[2], next_at, ARGV[1])
    redis.call("HINCRBY", KEYS[6], "retried", 1)
    return "RETRY"
"##;

lazy_static! {
    static ref SCRIPT: redis::Script = redis::Script::new(RETRY_SCRIPT);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RetryOutcome {
    Retried,
    Dead,
    /// The lease was lost before the failure was recorded.
    Lost,
}

pub(crate) struct RetryScript(&'static redis::Script);

impl RetryScript {
    pub fn new() -> Self {
        RetryScript(&SCRIPT)
    }

    pub fn source(&self) -> &'static str {
        RETRY_SCRIPT
    }

    pub fn hash(&self) -> &str {
        self.0.get_hash()
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn run(
        &self,
        keys: &QueueKeys,
        conn: &mut Connection,
        id: &str,
        topic: &str,
        now: &DateTime<Utc>,
        backoff_ms: i64,
        error: &str,
        expected_lease: i64,
        dead_retention_ms: i64,
    ) -> Result<RetryOutcome, Error> {
        let outcome: String = self
            .0
            .key(&keys.inflight)
            .key(&keys.delayed)
            .key(keys.payload(id))
            .key(keys.dead(topic))
            .key(&keys.retention)
            .key(&keys.stats)
            .arg(id)
            .arg(now.timestamp_millis())
            .arg(backoff_ms)
            .arg(error)
            .arg(expected_lease)
            .arg(dead_retention_ms)
            .invoke_async(&mut **conn)
            .await?;

        match outcome.as_str() {
            "RETRY" => Ok(RetryOutcome::Retried),
            "DEAD" => Ok(RetryOutcome::Dead),
            "LOST" => Ok(RetryOutcome::Lost),
            other => Err(Error::InvariantViolation(format!("retry returned {}", other))),
        }
    }
}
