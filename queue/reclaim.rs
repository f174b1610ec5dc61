use chrono::{DateTime, Utc};
use deadpool_redis::Connection;
use lazy_static::lazy_static;

use crate::{error::Error, QueueKeys};

// Sweep expired leases. Each reclaimed message pays an attempt and goes
// back through the delay queue on the deterministic backoff schedule, or
// to the dead letter list once it is out of attempts. This is the only
// path that recovers messages from a consumer that died.
// KEYS:
//  1. inflight zset
//  2. delayed zset
//  3. retention zset
//  4. stats hash
// ARGS:
//  1. current time
//  2. batch limit
//  3. key prefix
//  4. base backoff in millis
//  5. max backoff in millis
//  6. dead retention window in millis
//  7. error text
const RECLAIM_SCRIPT: &str = r##"
    local expired = redis.call("ZRANGEBYSCORE", KEYS[1], "-inf", ARGV[1], "LIMIT", 0, tonumber(ARGV[2]))
    local retried = 0
    local dead = 0
    for i = 1, #expired do
        local id = expired[i]
        local payload_key = ARGV[3] .. ":payload:" .. id
        redis.call("ZREM", KEYS[1], id)
        if redis.call("EXISTS", payload_key) == 1 then
            local attempts = redis.call("HINCRBY", payload_key, "attempts", 1)
            local max_retries = tonumber(redis.call("HGET", payload_key, "max_retries")) or 0
            local expire_at = tonumber(redis.call("HGET", payload_key, "expire_at"))
            local topic = redis.call("HGET", payload_key, "topic")

            local exp = attempts - 1
            if exp > 20 then
                exp = 20
            end
            local backoff = tonumber(ARGV[4]) * 2 ^ exp
            if backoff > tonumber(ARGV[5]) then
                backoff = tonumber(ARGV[5])
            end
            local next_at = math.floor(tonumber(ARGV[1]) + backoff)

            if attempts > max_retries or (expire_at and next_at >= expire_at) or not topic then
                redis.call("HSET", payload_key, "state", "DEAD", "last_error", ARGV[7], "lease_expires_at", "")
                if topic then
                    redis.call("LPUSH", ARGV[3] .. ":dead:" .. topic, id)
                end
                redis.call("ZADD", KEYS[3], tonumber(ARGV[1]) + tonumber(ARGV[6]), id)
                dead = dead + 1
            else
                redis.call("HSET", payload_key, "state", "DELAYED", "scheduled_at", next_at, "last_error", ARGV[7], "lease_expires_at", "")
                redis.call("ZADD", KEYS[2], next_at, id)
                retried = retried + 1
            end
        end
    end
    if retried > 0 then
        redis.call("HINCRBY", KEYS[4], "reclaimed", retried)
    end
    if dead > 0 then
        redis.call("HINCRBY", KEYS[4], "dead", dead)
    end
    return {retried, dead}
"##;

lazy_static! {
    static ref SCRIPT: redis::Script = redis::Script::new(RECLAIM_SCRIPT);
}

pub(crate) struct ReclaimScript(&'static redis::Script);

impl ReclaimScript {
    pub fn new() -> Self {
        ReclaimScript(&SCRIPT)
    }

    pub fn source(&self) -> &'static str {
        RECLAIM_SCRIPT
    }

    pub fn hash(&self) -> &str {
        self.0.get_hash()
    }

    /// Returns (requeued, dead-lettered) counts.
    pub async fn run(
        &self,
        keys: &QueueKeys,
        conn: &mut Connection,
        now: &DateTime<Utc>,
        batch: usize,
        base_backoff_ms: i64,
        max_backoff_ms: i64,
        dead_retention_ms: i64,
    ) -> Result<(usize, usize), Error> {
        let (retried, dead): (usize, usize) = self
            .0
            .key(&keys.inflight)
            .key(&keys.delayed)
            .key(&keys.retention)
            .key(&keys.stats)
            .arg(now.timestamp_millis())
            .arg(batch)
            .arg(&keys.prefix)
            .arg(base_backoff_ms)
            .arg(max_backoff_ms)
            .arg(dead_retention_ms)
            .arg("lease_expired")
            .invoke_async(&mut **conn)
            .await?;

        Ok((retried, dead))
    }
}
