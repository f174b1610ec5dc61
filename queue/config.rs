use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Queue configuration. Every field has a working default; construct with
/// struct update syntax when overriding a few of them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MQConfig {
    /// Connection string. `None` falls back to the `REDIS_URL` environment
    /// variable, then to localhost.
    pub redis_url: Option<String>,

    /// Namespace for every key this queue touches.
    pub queue_prefix: String,

    /// Connection pool size. `None` sizes it from `max_workers`.
    pub pool_size: Option<usize>,

    /// Number of parallel handler tasks.
    pub max_workers: usize,

    /// Capacity of the local task channel between the dispatcher and the
    /// workers. The channel filling up is the backpressure mechanism.
    pub task_queue_size: usize,

    #[serde(with = "serde_millis")]
    pub connect_timeout: Duration,

    /// Per-message handler deadline.
    #[serde(with = "serde_millis")]
    pub processing_timeout: Duration,

    /// Initial in-flight lease. Size generously relative to handler latency;
    /// a lease expiring mid-handler costs the message an attempt.
    #[serde(with = "serde_millis")]
    pub lease_timeout: Duration,

    /// Default per-message retry cap.
    pub max_retries: u32,

    #[serde(with = "serde_millis")]
    pub retry_base_backoff: Duration,

    #[serde(with = "serde_millis")]
    pub retry_max_backoff: Duration,

    #[serde(with = "serde_millis")]
    pub blocking_pop_timeout: Duration,

    #[serde(with = "serde_millis")]
    pub promote_interval: Duration,

    #[serde(with = "serde_millis")]
    pub reclaim_interval: Duration,

    #[serde(with = "serde_millis")]
    pub gc_interval: Duration,

    pub promote_batch: usize,

    pub reclaim_batch: usize,

    pub gc_batch: usize,

    #[serde(with = "serde_millis")]
    pub completed_retention: Duration,

    #[serde(with = "serde_millis")]
    pub dead_retention: Duration,

    #[serde(with = "serde_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for MQConfig {
    fn default() -> MQConfig {
        MQConfig {
            redis_url: None,
            queue_prefix: String::from("mxrmq"),
            pool_size: None,
            max_workers: 4,
            task_queue_size: 10,
            connect_timeout: Duration::from_secs(5),
            processing_timeout: Duration::from_secs(30),
            lease_timeout: Duration::from_secs(60),
            max_retries: 3,
            retry_base_backoff: Duration::from_secs(5),
            retry_max_backoff: Duration::from_secs(600),
            blocking_pop_timeout: Duration::from_secs(1),
            promote_interval: Duration::from_secs(1),
            reclaim_interval: Duration::from_secs(5),
            gc_interval: Duration::from_secs(60),
            promote_batch: 200,
            reclaim_batch: 100,
            gc_batch: 500,
            completed_retention: Duration::from_secs(3600),
            dead_retention: Duration::from_secs(7 * 24 * 3600),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl MQConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.queue_prefix.is_empty() {
            return Err(Error::ConfigError("queue_prefix may not be empty".into()));
        }
        if self.queue_prefix.contains(':') {
            return Err(Error::ConfigError(
                "queue_prefix may not contain ':'".into(),
            ));
        }
        if self.max_workers == 0 {
            return Err(Error::ConfigError("max_workers must be at least 1".into()));
        }
        if self.task_queue_size == 0 {
            return Err(Error::ConfigError(
                "task_queue_size must be at least 1".into(),
            ));
        }
        if self.lease_timeout < Duration::from_secs(1) {
            return Err(Error::ConfigError(
                "lease_timeout must be at least one second".into(),
            ));
        }
        if self.retry_max_backoff < self.retry_base_backoff {
            return Err(Error::ConfigError(
                "retry_max_backoff must be >= retry_base_backoff".into(),
            ));
        }
        if self.promote_batch == 0 || self.reclaim_batch == 0 || self.gc_batch == 0 {
            return Err(Error::ConfigError("batch sizes must be at least 1".into()));
        }

        Ok(())
    }

    /// Leases are refreshed at a third of their length so two refresh
    /// failures still leave time for a third before expiry.
    pub fn lease_refresh_interval(&self) -> Duration {
        self.lease_timeout / 3
    }

    pub(crate) fn pool_size(&self) -> usize {
        self.pool_size.unwrap_or(self.max_workers + 4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = MQConfig::default();
        config.validate().expect("default config validates");
        assert_eq!(config.queue_prefix, "mxrmq");
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.task_queue_size, 10);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.completed_retention, Duration::from_secs(3600));
        assert_eq!(config.dead_retention, Duration::from_secs(604800));
        assert_eq!(config.pool_size(), 8);
    }

    #[test]
    fn rejects_bad_values() {
        let config = MQConfig {
            queue_prefix: String::new(),
            ..MQConfig::default()
        };
        assert!(config.validate().is_err());

        let config = MQConfig {
            queue_prefix: String::from("a:b"),
            ..MQConfig::default()
        };
        assert!(config.validate().is_err());

        let config = MQConfig {
            max_workers: 0,
            ..MQConfig::default()
        };
        assert!(config.validate().is_err());

        let config = MQConfig {
            retry_base_backoff: Duration::from_secs(60),
            retry_max_backoff: Duration::from_secs(30),
            ..MQConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn refresh_interval_is_a_third_of_the_lease() {
        let config = MQConfig {
            lease_timeout: Duration::from_secs(30),
            ..MQConfig::default()
        };
        assert_eq!(config.lease_refresh_interval(), Duration::from_secs(10));
    }

    #[test]
    fn deserializes_durations_as_millis() {
        let config: MQConfig =
            serde_json::from_str(r##"{"processing_timeout": 1500, "max_workers": 2}"##)
                .expect("parsing config");
        assert_eq!(config.processing_timeout, Duration::from_millis(1500));
        assert_eq!(config.max_workers, 2);
        // Everything else keeps its default.
        assert_eq!(config.task_queue_size, 10);
    }
}
