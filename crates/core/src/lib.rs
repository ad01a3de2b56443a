//! `billrun-core`: primitives shared by the scheduler and the workflow runtime.
//!
//! This crate contains **pure** building blocks (no I/O, no async runtime).

pub mod clock;
pub mod error;
pub mod id;
pub mod retry;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Cancelled, StoreError, StoreResult};
pub use id::{InstanceId, JobName};
pub use retry::RetryPolicy;
