use deadpool_redis::Connection;
use lazy_static::lazy_static;

use crate::{error::Error, QueueKeys};

// Push an in-flight lease forward. GT keeps the lease monotonic when an
// extension races a newer claim.
// KEYS:
//  1. inflight zset
//  2. payload hash
// ARGS:
//  1. message id
//  2. new expiry
const EXTEND_LEASE_SCRIPT: &str = r##"
    redis.call("ZADD", KEYS[1], "XX", "GT", tonumber(ARGV[2]), ARGV[1])
    local score = redis.call("ZSCORE", KEYS[1], ARGV[1])
    if not score then
        return false
    end
    redis.call("HSET", KEYS[2], "lease_expires_at", score)
    return score
"##;

lazy_static! {
    static ref SCRIPT: redis::Script = redis::Script::new(EXTEND_LEASE_SCRIPT);
}

pub(crate) struct ExtendLeaseScript(&'static redis::Script);

impl ExtendLeaseScript {
    pub fn new() -> Self {
        ExtendLeaseScript(&SCRIPT)
    }

    pub fn source(&self) -> &'static str {
        EXTEND_LEASE_SCRIPT
    }

    pub fn hash(&self) -> &str {
        self.0.get_hash()
    }

    /// Returns the lease now in effect, or None when the message is no
    /// longer in flight.
    pub async fn run(
        &self,
        keys: &QueueKeys,
        conn: &mut Connection,
        id: &str,
        new_expiry: i64,
    ) -> Result<Option<i64>, Error> {
        let score: Option<i64> = self
            .0
            .key(&keys.inflight)
            .key(keys.payload(id))
            .arg(id)
            .arg(new_expiry)
            .invoke_async(&mut **conn)
            .await?;

        Ok(score)
    }
}
