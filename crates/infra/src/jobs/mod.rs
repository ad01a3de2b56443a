//! Lease-scheduled recurring jobs.
//!
//! ## Design
//!
//! - One lease record per job name, shared by every process
//! - The heartbeat commits before the body runs (a crash skips the cycle, never doubles it)
//! - Read-then-write is not atomic across processes; two processes can both run one cycle
//!
//! ## Components
//!
//! - `Cadence`: fixed interval or cron expression
//! - `LeaseStore`: persistence for lease records (in-memory or Postgres)
//! - `LeaseScheduler`: per-job loop gated on readiness prerequisites

pub mod postgres;
pub mod scheduler;
pub mod store;
pub mod types;

pub use postgres::PostgresLeaseStore;
pub use scheduler::{FnJob, LeaseScheduler, ScheduledJob, SchedulerConfig, SchedulerError, TickOutcome};
pub use store::{InMemoryLeaseStore, LeaseStore};
pub use types::{Cadence, CadenceError, JobLeaseRecord};
