pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod shutdown;
pub mod storage;
pub mod worker;

pub use engine::{Engine, ShutdownReport};
pub use error::{Result, SlicerError};
