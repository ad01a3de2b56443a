//! Runtime and persistence: readiness gates, the lease scheduler, the
//! workflow dispatcher, Postgres stores and environment configuration.

pub mod config;
pub mod db;
pub mod jobs;
pub mod readiness;
pub mod workflow;


pub use config::{ConfigError, RuntimeConfig};
pub use readiness::{Prerequisite, ReadinessGate};
