use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::config::PoolConfig;
use crate::program::WorkerProgram;

use super::supervisor::WorkerPool;

/// Builder for a [`WorkerPool`].
///
/// The worker program is required; every other setting falls back to
/// [`PoolConfig::default`].
///
/// # Example
///
/// ```ignore
/// use shoal::*;
///
/// let pool = WorkerPoolBuilder::new()
///     .with_size(4)
///     .with_default_timeout(Duration::from_secs(10))
///     .with_program(CommandProgram::new("./analyze-worker"))
///     .build()?;
/// ```
#[derive(Default)]
pub struct WorkerPoolBuilder {
    config: PoolConfig,
    program: Option<Arc<dyn WorkerProgram>>,
}

impl fmt::Debug for WorkerPoolBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPoolBuilder")
            .field("config", &self.config)
            .field("program_set", &self.program.is_some())
            .finish()
    }
}

impl WorkerPoolBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing configuration.
    pub fn from_config(config: PoolConfig) -> Self {
        Self {
            config,
            program: None,
        }
    }

    pub fn with_program<P: WorkerProgram>(mut self, program: P) -> Self {
        self.program = Some(Arc::new(program));
        self
    }

    pub fn with_shared_program(mut self, program: Arc<dyn WorkerProgram>) -> Self {
        self.program = Some(program);
        self
    }

    pub fn with_size(mut self, size: usize) -> Self {
        self.config.size = size;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.config.default_timeout = timeout;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.config.shutdown_grace = grace;
        self
    }

    pub fn with_max_crash_retries(mut self, retries: u32) -> Self {
        self.config.max_crash_retries = retries;
        self
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Validate the configuration and start the pool.
    pub fn build(self) -> anyhow::Result<WorkerPool> {
        let program = self
            .program
            .ok_or_else(|| anyhow::anyhow!("worker program missing"))?;
        WorkerPool::start_shared(self.config, program)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::BlockingProgram;
    use serde_json::Value;

    #[tokio::test]
    async fn build_requires_program() {
        let err = WorkerPoolBuilder::new().with_size(2).build().unwrap_err();
        assert!(err.to_string().contains("worker program missing"));
    }

    #[tokio::test]
    async fn build_applies_settings() {
        let pool = WorkerPoolBuilder::new()
            .with_size(3)
            .with_default_timeout(Duration::from_millis(500))
            .with_max_crash_retries(1)
            .with_program(BlockingProgram::new(|_| Ok(Value::Null)))
            .build()
            .unwrap();

        assert_eq!(pool.config().size, 3);
        assert_eq!(pool.config().default_timeout, Duration::from_millis(500));
        assert_eq!(pool.stats().pool_size, 3);
        pool.shutdown(Duration::from_millis(100)).await;
    }

    #[test]
    fn debug_hides_program() {
        let builder = WorkerPoolBuilder::new()
            .with_program(BlockingProgram::new(|_| Ok(Value::Null)));
        assert!(format!("{builder:?}").contains("program_set: true"));
    }
}
