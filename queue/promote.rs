use chrono::{DateTime, Utc};
use deadpool_redis::Connection;
use lazy_static::lazy_static;

use crate::{error::Error, QueueKeys};

// Move each delayed message that has reached its deadline into the ready
// list for its (topic, priority). Ids are discovered server-side, so the
// per-topic keys are built from the prefix inside the script.
// KEYS:
//  1. delayed zset
//  2. stats hash
// ARGS:
//  1. current time
//  2. batch limit
//  3. key prefix
const PROMOTE_SCRIPT: &str = r##"
    local due = redis.call("ZRANGEBYSCORE", KEYS[1], "-inf", ARGV[1], "LIMIT", 0, tonumber(ARGV[2]))
    local promoted = 0
    for i = 1, #due do
        local id = due[i]
        local payload_key = ARGV[3] .. ":payload:" .. id
        local topic = redis.call("HGET", payload_key, "topic")
        local priority = redis.call("HGET", payload_key, "priority")
        if topic and priority then
            redis.call("HSET", payload_key, "state", "READY")
            redis.call("LPUSH", ARGV[3] .. ":ready:" .. topic .. ":" .. priority, id)
            promoted = promoted + 1
        end
        redis.call("ZREM", KEYS[1], id)
    end
    if promoted > 0 then
        redis.call("HINCRBY", KEYS[2], "promoted", promoted)
    end
    return promoted
"##;

lazy_static! {
    static ref SCRIPT: redis::Script = redis::Script::new(PROMOTE_SCRIPT);
}

pub(crate) struct PromoteScript(&'static redis::Script);

impl PromoteScript {
    pub fn new() -> Self {
        PromoteScript(&SCRIPT)
    }

    pub fn source(&self) -> &'static str {
        PROMOTE_SCRIPT
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
        let promoted: usize = self
            .0
            .key(&keys.delayed)
            .key(&keys.stats)
            .arg(now.timestamp_millis())
            .arg(batch)
            .arg(&keys.prefix)
            .invoke_async(&mut **conn)
            .await?;

        Ok(promoted)
    }
}
