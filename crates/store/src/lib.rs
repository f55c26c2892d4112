//! Persistence layer: the store contract the engine coordinates through,
//! plus the in-memory reference store and the Postgres store.
//!
//! The single primitive the engine's correctness rests on is
//! [`JobStore::find_one_and_update`]: match a typed filter and apply a typed
//! update in one atomic step. Everything else (claiming, state transitions,
//! stale recovery) is built from it.

pub mod filter;
pub mod job_store;
pub mod memory;
pub mod postgres;
pub mod stats;

pub use filter::{JobFilter, JobQuery, JobSort, JobUpdate, LockFilter, LockUpdate};
pub use job_store::{
    JobPage, JobStore, Lock, LockStore, LogUpdate, StoreError, StoreResult, JOB_SEQUENCE,
};
pub use memory::MemoryJobStore;
pub use postgres::PostgresJobStore;
pub use stats::{HourlyBucket, JobStats};
