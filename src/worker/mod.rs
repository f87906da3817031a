//! Execution side of the engine.
//!
//! - **Executor**: runs the slicer binary against a stored model
//! - **Heartbeat**: renews a job's lease while it is held
//! - **Pool**: claim loops, the bounded holding area and execution slots
//!
//! # Components
//!
//! - [`SlicerExecutor`]: capability the pool executes jobs with
//! - [`ProcessExecutor`]: child-process implementation
//! - [`HeartbeatSender`]: interval-driven lease renewal
//! - [`WorkerPool`]: bounded concurrent execution with back-pressure
//!
//! # Execution Flow
//!
//! 1. A claim loop takes admission permits and claims that many jobs
//! 2. Each job waits in the holding area for an execution slot
//! 3. The job is marked running and the executor is invoked under
//!    `worker_timeout`, while heartbeats renew the lease
//! 4. The artifact is stored and the outcome proposed to the coordinator

pub mod executor;
pub mod heartbeat;
pub mod pool;

pub use executor::{ExecutionResult, ProcessExecutor, SliceRequest, SlicerExecutor};
pub use heartbeat::HeartbeatSender;
pub use pool::{PoolShutdown, PoolStatsSnapshot, WorkerPool};
