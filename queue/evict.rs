use chrono::{DateTime, Utc};
use deadpool_redis::Connection;
use lazy_static::lazy_static;

use crate::{error::Error, QueueKeys};

// Delete the payloads of completed and dead messages whose retention
// window has passed. Dead messages also leave the operator list so no id
// can dangle there without an envelope.
// KEYS:
//  1. retention zset
//  2. stats hash
// ARGS:
//  1. current time
//  2. batch limit
//  3. key prefix
const EVICT_SCRIPT: &str = r##"
    local due = redis.call("ZRANGEBYSCORE", KEYS[1], "-inf", ARGV[1], "LIMIT", 0, tonumber(ARGV[2]))
    local evicted = 0
    for i = 1, #due do
        local id = due[i]
        local payload_key = ARGV[3] .. ":payload:" .. id
        if redis.call("HGET", payload_key, "state") == "DEAD" then
            local topic = redis.call("HGET", payload_key, "topic")
            if topic then
                redis.call("LREM", ARGV[3] .. ":dead:" .. topic, 0, id)
            end
        end
        redis.call("DEL", payload_key)
        redis.call("ZREM", KEYS[1], id)
        evicted = evicted + 1
    end
    if evicted > 0 then
        redis.call("HINCRBY", KEYS[2], "evicted", evicted)
    end
    return evicted
"##;

lazy_static! {
    static ref SCRIPT: redis::Script = redis::Script::new(EVICT_SCRIPT);
}

pub(crate) struct EvictScript(&'static redis::Script);

impl EvictScript {
    pub fn new() -> Self {
        EvictScript(&SCRIPT)
    }

    pub fn source(&self) -> &'static str {
        EVICT_SCRIPT
    }

    pub fn hash(&self) -> &str {
        self.0.get_hash()
    }

    pub async fn run(
        &self,
        keys: &QueueKeys,
        conn: &mut Connection,
        now: &DateTime<Utc>,
        batch: usize,
    ) -> Result<usize, Error> {
        let evicted: usize = self
            .0
            .key(&keys.retention)
            .key(&keys.stats)
            .arg(now.timestamp_millis())
            .arg(batch)
            .arg(&keys.prefix)
            .invoke_async(&mut **conn)
            .await?;

        Ok(evicted)
    }
}
