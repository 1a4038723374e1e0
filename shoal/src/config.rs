use std::time::Duration;

use anyhow::ensure;
use serde::{Deserialize, Serialize};

/// Configuration for a [`WorkerPool`](crate::runtime::WorkerPool).
///
/// Durations are expressed in milliseconds when serialized.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct PoolConfig {
    /// Number of workers kept alive while the pool is running.
    pub size: usize,
    /// Deadline applied to jobs submitted without their own timeout.
    #[serde(with = "serde_millis", rename = "default_timeout_ms")]
    pub default_timeout: Duration,
    /// Upper bound on how long shutdown waits for in-flight jobs.
    #[serde(with = "serde_millis", rename = "shutdown_grace_ms")]
    pub shutdown_grace: Duration,
    /// How often the shutdown wait re-checks the active job count.
    #[serde(with = "serde_millis", rename = "drain_poll_interval_ms")]
    pub drain_poll_interval: Duration,
    /// Times a job is requeued after its worker crashes before it is failed.
    pub max_crash_retries: u32,
    /// Base delay before restarting a worker that keeps exiting abnormally.
    #[serde(with = "serde_millis", rename = "restart_backoff_ms")]
    pub restart_backoff: Duration,
    /// Cap on the restart delay.
    #[serde(with = "serde_millis", rename = "max_restart_backoff_ms")]
    pub max_restart_backoff: Duration,
    /// Buffered lifecycle events per subscriber before it lags.
    pub event_capacity: usize,
}

impl PoolConfig {
    /// Create a configuration with `size` workers and default timings.
    pub fn new(size: usize) -> Self {
        Self {
            size,
            ..Self::default()
        }
    }

    /// Set the number of workers.
    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    /// Set the default per-job timeout.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Set the shutdown grace period.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Set the shutdown drain polling interval.
    pub fn with_drain_poll_interval(mut self, interval: Duration) -> Self {
        self.drain_poll_interval = interval;
        self
    }

    /// Set the crash retry ceiling.
    pub fn with_max_crash_retries(mut self, retries: u32) -> Self {
        self.max_crash_retries = retries;
        self
    }

    /// Set the base and maximum restart backoff.
    pub fn with_restart_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.restart_backoff = base;
        self.max_restart_backoff = max;
        self
    }

    /// Set the lifecycle event buffer size.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Check the configuration for values the pool cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(self.size > 0, "pool size must be greater than 0");
        ensure!(
            !self.default_timeout.is_zero(),
            "default timeout must be greater than 0"
        );
        ensure!(
            !self.drain_poll_interval.is_zero(),
            "drain poll interval must be greater than 0"
        );
        ensure!(
            self.restart_backoff <= self.max_restart_backoff,
            "restart backoff ({:?}) exceeds its maximum ({:?})",
            self.restart_backoff,
            self.max_restart_backoff
        );
        ensure!(self.event_capacity > 0, "event capacity must be greater than 0");
        Ok(())
    }

    /// Delay before restarting a slot that has exited abnormally
    /// `consecutive_failures` times in a row.
    pub(crate) fn restart_delay(&self, consecutive_failures: u32) -> Duration {
        if consecutive_failures <= 1 {
            return Duration::ZERO;
        }
        self.restart_backoff
            .saturating_mul(consecutive_failures - 1)
            .min(self.max_restart_backoff)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: default_pool_size(),
            default_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(30),
            drain_poll_interval: Duration::from_millis(100),
            max_crash_retries: 3,
            restart_backoff: Duration::from_millis(100),
            max_restart_backoff: Duration::from_secs(5),
            event_capacity: 1024,
        }
    }
}

/// One worker per core, leaving a core for the request-handling process.
pub fn default_pool_size() -> usize {
    num_cpus::get().saturating_sub(1).max(1)
}

pub(crate) mod serde_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = PoolConfig::default();
        assert!(config.size >= 1);
        config.validate().expect("default config should validate");
    }

    #[test]
    fn zero_size_is_rejected() {
        let err = PoolConfig::new(0).validate().unwrap_err();
        assert!(err.to_string().contains("pool size"));
    }

    #[test]
    fn backoff_above_cap_is_rejected() {
        let config = PoolConfig::new(2).with_restart_backoff(
            Duration::from_secs(10),
            Duration::from_secs(1),
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn restart_delay_grows_and_caps() {
        let config = PoolConfig::new(1).with_restart_backoff(
            Duration::from_millis(100),
            Duration::from_millis(250),
        );

        assert_eq!(config.restart_delay(0), Duration::ZERO);
        assert_eq!(config.restart_delay(1), Duration::ZERO);
        assert_eq!(config.restart_delay(2), Duration::from_millis(100));
        assert_eq!(config.restart_delay(3), Duration::from_millis(200));
        assert_eq!(config.restart_delay(9), Duration::from_millis(250));
    }

    #[test]
    fn deserializes_millisecond_fields_with_defaults() {
        let config: PoolConfig = serde_json::from_str(
            r#"{"size": 4, "default_timeout_ms": 1500, "max_crash_retries": 1}"#,
        )
        .unwrap();

        assert_eq!(config.size, 4);
        assert_eq!(config.default_timeout, Duration::from_millis(1500));
        assert_eq!(config.max_crash_retries, 1);
        assert_eq!(config.shutdown_grace, Duration::from_secs(30));
    }
}
