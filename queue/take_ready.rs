use std::collections::HashMap;

use chrono::{DateTime, Utc};
use deadpool_redis::Connection;
use lazy_static::lazy_static;

use crate::{error::Error, QueueKeys};

// Pop the tail of one ready list and lease the message.
// KEYS:
//  1. ready list
//  2. inflight zset
// ARGS:
//  1. current time
//  2. lease length in millis
//  3. payload key prefix
//
// Returns nil when the list is empty, {id} when the popped id had no
// envelope, and {id, field, value, ...} for a claimed message.
const TAKE_READY_SCRIPT: &str = r##"
    local id = redis.call("RPOP", KEYS[1])
    if not id then
        return false
    end

    local payload_key = ARGV[3] .. id
    if redis.call("EXISTS", payload_key) == 0 then
        return {id}
    end

    local lease = tonumber(ARGV[1]) + tonumber(ARGV[2])
    redis.call("HSET", payload_key, "state", "IN_FLIGHT", "lease_expires_at", lease)
    redis.call("ZADD", KEYS[2], lease, id)

    local out = {id}
    local data = redis.call("HGETALL", payload_key)
    for i = 1, #data do
        out[i + 1] = data[i]
    end
    return out
"##;

// Lease a specific id that a blocking pop already removed from its ready
// list. The instant between BRPOP and this call is the one window where a
// crash loses the message; the dispatcher keeps it as short as possible.
// KEYS:
//  1. inflight zset
// ARGS:
//  1. message id
//  2. current time
//  3. lease length in millis
//  4. payload key prefix
const CLAIM_READY_SCRIPT: &str = r##"
    local payload_key = ARGV[4] .. ARGV[1]
    if redis.call("EXISTS", payload_key) == 0 then
        return false
    end

    local lease = tonumber(ARGV[2]) + tonumber(ARGV[3])
    redis.call("HSET", payload_key, "state", "IN_FLIGHT", "lease_expires_at", lease)
    redis.call("ZADD", KEYS[1], lease, ARGV[1])
    return redis.call("HGETALL", payload_key)
"##;

lazy_static! {
    static ref TAKE_SCRIPT: redis::Script = redis::Script::new(TAKE_READY_SCRIPT);
    static ref CLAIM_SCRIPT: redis::Script = redis::Script::new(CLAIM_READY_SCRIPT);
}

pub(crate) enum TakeOutcome {
    Empty,
    /// The ready list referenced an id with no envelope.
    Orphan(String),
    Claimed(HashMap<String, String>),
}

pub(crate) struct TakeReadyScript(&'static redis::Script);

impl TakeReadyScript {
    pub fn new() -> Self {
        TakeReadyScript(&TAKE_SCRIPT)
    }

    pub fn source(&self) -> &'static str {
        TAKE_READY_SCRIPT
    }

    pub fn hash(&self) -> &str {
        self.0.get_hash()
    }

    pub async fn run(
        &self,
        keys: &QueueKeys,
        conn: &mut Connection,
        ready_key: &str,
        now: &DateTime<Utc>,
        lease_ms: i64,
    ) -> Result<TakeOutcome, Error> {
        let reply: Option<Vec<String>> = self
            .0
            .key(ready_key)
            .key(&keys.inflight)
            .arg(now.timestamp_millis())
            .arg(lease_ms)
            .arg(&keys.payload_prefix)
            .invoke_async(&mut **conn)
            .await?;

        Ok(match reply {
            None => TakeOutcome::Empty,
            Some(mut parts) => {
                if parts.len() <= 1 {
                    TakeOutcome::Orphan(parts.pop().unwrap_or_default())
                } else {
                    let mut fields = HashMap::with_capacity(parts.len() / 2);
                    let mut iter = parts.drain(1..);
                    while let (Some(field), Some(value)) = (iter.next(), iter.next()) {
                        fields.insert(field, value);
                    }
                    TakeOutcome::Claimed(fields)
                }
            }
        })
    }
}

pub(crate) struct ClaimReadyScript(&'static redis::Script);

impl ClaimReadyScript {
    pub fn new() -> Self {
        ClaimReadyScript(&CLAIM_SCRIPT)
    }

    pub fn source(&self) -> &'static str {
        CLAIM_READY_SCRIPT
    }

    pub fn hash(&self) -> &str {
        self.0.get_hash()
    }

    pub async fn run(
        &self,
        keys: &QueueKeys,
        conn: &mut Connection,
        id: &str,
        now: &DateTime<Utc>,
        lease_ms: i64,
    ) -> Result<Option<HashMap<String, String>>, Error> {
        let fields: Option<HashMap<String, String>> = self
            .0
            .key(&keys.inflight)
            .arg(id)
            .arg(now.timestamp_millis())
            .arg(lease_ms)
            .arg(&keys.payload_prefix)
            .invoke_async(&mut **conn)
            .await?;

        Ok(fields)
    }
}
