use chrono::{DateTime, Utc};
use deadpool_redis::Connection;
use lazy_static::lazy_static;

use crate::{error::Error, QueueKeys};

// Dead-letter an in-flight message without counting another attempt:
// panics, undecodable payloads, and messages that expired before running.
// KEYS:
//  1. inflight zset
//  2. payload hash
//  3. dead list for the topic
//  4. retention zset
//  5. stats hash
// ARGS:
//  1. message id
//  2. current time
//  3. error text
//  4. expected lease score
//  5. dead retention window in millis
const DEAD_LETTER_SCRIPT: &str = r##"
    local score = redis.call("ZSCORE", KEYS[1], ARGV[1])
    if not score or score ~= ARGV[4] then
        return "LOST"
    end

    redis.call("ZREM", KEYS[1], ARGV[1])
    redis.call("HSET", KEYS[2], "state", "DEAD", "last_error", ARGV[3], "lease_expires_at", "")
    redis.call("LPUSH", KEYS[3], ARGV[1])
    redis.call("ZADD", KEYS[4], tonumber(ARGV[2]) + tonumber(ARGV[5]), ARGV[1])
    redis.call("HINCRBY", KEYS[5], "dead", 1)
    return "DEAD"
"##;

lazy_static! {
    static ref SCRIPT: redis::Script = redis::Script::new(DEAD_LETTER_SCRIPT);
}

pub(crate) struct DeadLetterScript(&'static redis::Script);

impl DeadLetterScript {
    pub fn new() -> Self {
        DeadLetterScript(&SCRIPT)
    }

    pub fn source(&self) -> &'static str {
        DEAD_LETTER_SCRIPT
    }

    pub fn hash(&self) -> &str {
        self.0.get_hash()
    }

    /// Returns false when the lease was already lost.
    pub async fn run(
        &self,
        keys: &QueueKeys,
        conn: &mut Connection,
        id: &str,
        topic: &str,
        now: &DateTime<Utc>,
        error: &str,
        expected_lease: i64,
        dead_retention_ms: i64,
    ) -> Result<bool, Error> {
        let outcome: String = self
            .0
            .key(&keys.inflight)
            .key(keys.payload(id))
            .key(keys.dead(topic))
            .key(&keys.retention)
            .key(&keys.stats)
            .arg(id)
            .arg(now.timestamp_millis())
            .arg(error)
            .arg(expected_lease)
            .arg(dead_retention_ms)
            .invoke_async(&mut **conn)
            .await?;

        Ok(outcome == "DEAD")
    }
}
