use chrono::{DateTime, Utc};
use deadpool_redis::Connection;
use lazy_static::lazy_static;

use crate::{error::Error, QueueKeys};

// Mark a message completed and queue its payload for eviction.
// KEYS:
//  1. inflight zset
//  2. retention zset
//  3. payload hash
//  4. stats hash
// ARGS:
//  1. message id
//  2. current time
//  3. retention window in millis
//  4. expected lease score
const ACK_SCRIPT: &str = r##"
    local score = redis.call("ZSCORE", KEYS[1], ARGV[1])
    if not score or score ~= ARGV[4] then
        -- We no longer own this message, so don't touch it.
        return "LOST"
    end

    redis.call("ZREM", KEYS[1], ARGV[1])
    redis.call("HSET", KEYS[3], "state", "COMPLETED", "lease_expires_at", "")
    redis.call("ZADD", KEYS[2], tonumber(ARGV[2]) + tonumber(ARGV[3]), ARGV[1])
    redis.call("HINCRBY", KEYS[4], "completed", 1)
    return "ACKED"
"##;

lazy_static! {
    static ref SCRIPT: redis::Script = redis::Script::new(ACK_SCRIPT);
}

pub(crate) struct AckScript(&'static redis::Script);

impl AckScript {
    pub fn new() -> Self {
        AckScript(&SCRIPT)
    }

    pub fn source(&self) -> &'static str {
        ACK_SCRIPT
    }

    pub fn hash(&self) -> &str {
        self.0.get_hash()
    }

    /// Returns false when the lease was lost before the ack landed.
    pub async fn run(
        &self,
        keys: &QueueKeys,
        conn: &mut Connection,
        id: &str,
        now: &DateTime<Utc>,
        retention_ms: i64,
        expected_lease: i64,
    ) -> Result<bool, Error> {
        let outcome: String = self
            .0
            .key(&keys.inflight)
            .key(&keys.retention)
            .key(keys.payload(id))
            .key(&keys.stats)
            .arg(id)
            .arg(now.timestamp_millis())
            .arg(retention_ms)
            .arg(expected_lease)
            .invoke_async(&mut **conn)
            .await?;

        Ok(outcome == "ACKED")
    }
}
