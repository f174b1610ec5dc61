use std::{
    env,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use deadpool::managed::Timeouts;
use deadpool_redis::{Connection, Pool, PoolConfig};
use tracing::{event, Level};

use crate::error::Error;

const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// Shared Redis connection pool. Every queue loop takes a connection per
/// operation; blocking reads hold theirs for at most their own timeout.
#[derive(Clone)]
pub struct RedisPool {
    pool: Pool,
    closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for RedisPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisPool")
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl RedisPool {
    /// Create a pool from an explicit URL, falling back to the `REDIS_URL`
    /// environment variable and then to localhost.
    pub fn new(
        url: Option<String>,
        size: Option<usize>,
        connect_timeout: Option<Duration>,
    ) -> Result<RedisPool, Error> {
        let url = url
            .filter(|u| !u.is_empty())
            .or_else(|| env::var("REDIS_URL").ok())
            .unwrap_or_else(|| String::from(DEFAULT_REDIS_URL));

        let mut pool_config = PoolConfig::new(size.unwrap_or(8));
        pool_config.timeouts = Timeouts {
            wait: connect_timeout,
            create: connect_timeout,
            recycle: None,
        };

        let pool = deadpool_redis::Config {
            url: Some(url),
            connection: None,
            pool: Some(pool_config),
        }
        .create_pool()?;

        Ok(RedisPool {
            pool,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    pub async fn get(&self) -> Result<Connection, Error> {
        if self.is_closed() {
            return Err(Error::PoolClosed);
        }

        self.pool.get().await.map_err(Error::from)
    }

    /// Stop handing out connections. Checked-out connections finish their
    /// work and are dropped on return.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            event!(Level::DEBUG, "Redis pool closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn build_with_defaults() {
        // Pool creation parses the URL but performs no I/O.
        RedisPool::new(None, None, None).expect("Creating pool with defaults");
    }

    #[tokio::test]
    async fn closed_pool_refuses_connections() {
        let pool = RedisPool::new(
            Some("redis://127.0.0.1:6379".to_string()),
            Some(1),
            Some(Duration::from_millis(100)),
        )
        .expect("Creating pool");

        pool.close();
        assert!(pool.is_closed());

        match pool.get().await {
            Err(Error::PoolClosed) => {}
            x => panic!("Expected PoolClosed, got {:?}", x.map(|_| ())),
        }
    }
}
