/// Builder for starting pools.
pub mod builder;
/// Registry of unresolved jobs and the caller-facing result future.
pub mod registry;
/// Pool state, dispatch, crash recovery and shutdown.
pub mod supervisor;
/// Worker tasks and their exit reporting.
pub mod worker;

pub use builder::WorkerPoolBuilder;
pub use registry::PendingJob;
pub use supervisor::{PoolState, ShutdownReport, WorkerPool};
pub use worker::{WorkerExit, WorkerId};
