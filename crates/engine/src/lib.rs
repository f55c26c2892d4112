//! The scheduling engine.
//!
//! A [`Worker`] polls the store on a fixed cadence, claims due jobs through
//! the [`JobPicker`]'s atomic conditional update, and hands each claim to
//! the [`JobExecutor`] as an independent task. All coordination between
//! workers happens through the store; the engine holds no timers per job
//! and no cross-process state.

pub mod events;
pub mod executor;
pub mod lock;
pub mod picker;
pub mod registry;
pub mod stats;
pub mod worker;

pub use events::WorkerEvent;
pub use executor::{ExecutionOutcome, FailureReason, JobExecutor};
pub use lock::{LockManager, RenewalGuard, WithLock};
pub use picker::JobPicker;
pub use registry::{HandlerContext, HandlerError, HandlerRegistry, JobHandler};
pub use stats::{WorkerStats, WorkerStatsSnapshot};
pub use worker::{Worker, WorkerConfig, WorkerState};
