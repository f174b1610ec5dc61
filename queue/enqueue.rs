use chrono::{DateTime, Utc};
use deadpool_redis::Connection;
use lazy_static::lazy_static;

use crate::{error::Error, message::MessagePriority, QueueKeys};

// Write the envelope and place the id in its first index.
// KEYS:
//  1. payload hash
//  2. topics set
//  3. delayed zset
//  4. ready list for (topic, priority)
//  5. stats hash
// ARGS:
//  1. message id
//  2. topic
//  3. priority
//  4. payload JSON
//  5. created_at
//  6. scheduled_at
//  7. expire_at, or "" for none
//  8. max retries
//  9. current time
const ENQUEUE_SCRIPT: &str = r##"
    if redis.call("EXISTS", KEYS[1]) == 1 then
        return "DUPLICATE"
    end

    redis.call("HSET", KEYS[1],
        "id", ARGV[1],
        "topic", ARGV[2],
        "priority", ARGV[3],
        "payload", ARGV[4],
        "created_at", ARGV[5],
        "scheduled_at", ARGV[6],
        "expire_at", ARGV[7],
        "max_retries", ARGV[8],
        "attempts", 0,
        "last_error", "",
        "lease_expires_at", "")
    redis.call("SADD", KEYS[2], ARGV[2])
    redis.call("HINCRBY", KEYS[5], "enqueued", 1)

    if tonumber(ARGV[6]) > tonumber(ARGV[9]) then
        redis.call("HSET", KEYS[1], "state", "DELAYED")
        redis.call("ZADD", KEYS[3], tonumber(ARGV[6]), ARGV[1])
        redis.call("HINCRBY", KEYS[5], "delayed", 1)
        return "DELAYED"
    end

    redis.call("HSET", KEYS[1], "state", "READY")
    redis.call("LPUSH", KEYS[4], ARGV[1])
    return "QUEUED"
"##;

lazy_static! {
    static ref SCRIPT: redis::Script = redis::Script::new(ENQUEUE_SCRIPT);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Placement {
    Queued,
    Delayed,
    /// The id already has an envelope; nothing was written.
    Duplicate,
}

pub(crate) struct EnqueueScript(&'static redis::Script);

impl EnqueueScript {
    pub fn new() -> Self {
        EnqueueScript(&SCRIPT)
    }

    pub fn source(&self) -> &'static str {
        ENQUEUE_SCRIPT
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
        priority: MessagePriority,
        payload: &str,
        created_at: &DateTime<Utc>,
        scheduled_at: &DateTime<Utc>,
        expire_at: Option<&DateTime<Utc>>,
        max_retries: u32,
        now: &DateTime<Utc>,
    ) -> Result<Placement, Error> {
        let placement: String = self
            .0
            .key(keys.payload(id))
            .key(&keys.topics)
            .key(&keys.delayed)
            .key(keys.ready(topic, priority))
            .key(&keys.stats)
            .arg(id)
            .arg(topic)
            .arg(priority.as_str())
            .arg(payload)
            .arg(created_at.timestamp_millis())
            .arg(scheduled_at.timestamp_millis())
            .arg(
                expire_at
                    .map(|t| t.timestamp_millis().to_string())
                    .unwrap_or_default(),
            )
            .arg(max_retries)
            .arg(now.timestamp_millis())
            .invoke_async(&mut **conn)
            .await?;

        match placement.as_str() {
            "QUEUED" => Ok(Placement::Queued),
            "DELAYED" => Ok(Placement::Delayed),
            "DUPLICATE" => Ok(Placement::Duplicate),
            other => Err(Error::InvariantViolation(format!(
                "enqueue returned {}",
                other
            ))),
        }
    }
}
