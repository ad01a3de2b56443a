//! Process configuration read from the environment.
//!
//! | Variable | Default | Meaning |
//! |----------|---------|---------|
//! | `DATABASE_URL` | unset | Postgres URL; unset runs on in-memory stores |
//! | `BILLRUN_LOG_FORMAT` | `json` | `json` or `pretty` |
//! | `BILLRUN_INSTANCE_NAME` | `billrun` | Name of this process in logs |
//! | `BILLRUN_MAX_CONCURRENT_ORCHESTRATIONS` | `16` | Instances advanced at once |
//! | `BILLRUN_MAX_CONCURRENT_ACTIVITIES` | `32` | Activity attempts running at once |
//! | `BILLRUN_POLL_INTERVAL_MS` | `500` | Dispatcher poll interval |
//! | `BILLRUN_SHUTDOWN_TIMEOUT_SECS` | `30` | Drain deadline on shutdown |
//! | `BILLRUN_INVOICE_RUN_CRON` | `0 0 2 * * * *` | Cadence of the invoice run |

use std::str::FromStr;
use std::time::Duration;

use billrun_observability::LogFormat;

use crate::jobs::{Cadence, SchedulerConfig};
use crate::workflow::DispatcherConfig;

pub const DEFAULT_INVOICE_RUN_CRON: &str = "0 0 2 * * * *";

/// Invalid configuration value.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("invalid value for {key} ({value:?}): {reason}")]
pub struct ConfigError {
    pub key: &'static str,
    pub value: String,
    pub reason: String,
}

/// Everything the worker process needs to wire itself up.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub database_url: Option<String>,
    pub log_format: LogFormat,
    pub scheduler: SchedulerConfig,
    pub dispatcher: DispatcherConfig,
    pub invoice_run: Cadence,
}

impl RuntimeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (the environment in production).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let log_format = match get("BILLRUN_LOG_FORMAT") {
            Some(value) => value.parse::<LogFormat>().map_err(|e| ConfigError {
                key: "BILLRUN_LOG_FORMAT",
                value: value.clone(),
                reason: e.to_string(),
            })?,
            None => LogFormat::default(),
        };

        let mut scheduler = SchedulerConfig::default();
        if let Some(name) = get("BILLRUN_INSTANCE_NAME") {
            scheduler = scheduler.with_instance_name(name);
        }

        let mut dispatcher = DispatcherConfig::default().with_name(format!("{}-dispatcher", scheduler.instance_name));
        if let Some(max) = positive::<usize>(&get, "BILLRUN_MAX_CONCURRENT_ORCHESTRATIONS")? {
            dispatcher = dispatcher.with_max_concurrent_orchestrations(max);
        }
        if let Some(max) = positive::<usize>(&get, "BILLRUN_MAX_CONCURRENT_ACTIVITIES")? {
            dispatcher = dispatcher.with_max_concurrent_activities(max);
        }
        if let Some(ms) = positive::<u64>(&get, "BILLRUN_POLL_INTERVAL_MS")? {
            dispatcher = dispatcher.with_poll_interval(Duration::from_millis(ms));
        }
        if let Some(secs) = parse::<u64>(&get, "BILLRUN_SHUTDOWN_TIMEOUT_SECS")? {
            dispatcher = dispatcher.with_shutdown_timeout(Duration::from_secs(secs));
        }

        let cron = get("BILLRUN_INVOICE_RUN_CRON").unwrap_or_else(|| DEFAULT_INVOICE_RUN_CRON.to_string());
        let invoice_run = Cadence::cron(&cron).map_err(|e| ConfigError {
            key: "BILLRUN_INVOICE_RUN_CRON",
            value: cron.clone(),
            reason: e.source.to_string(),
        })?;

        Ok(Self {
            database_url: get("DATABASE_URL"),
            log_format,
            scheduler,
            dispatcher,
            invoice_run,
        })
    }
}

fn parse<T>(get: &impl Fn(&str) -> Option<String>, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    get(key)
        .map(|value| {
            value.trim().parse::<T>().map_err(|e| ConfigError {
                key,
                value: value.clone(),
                reason: e.to_string(),
            })
        })
        .transpose()
}

fn positive<T>(get: &impl Fn(&str) -> Option<String>, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr + PartialEq + Default + std::fmt::Display,
    T::Err: std::fmt::Display,
{
    match parse::<T>(get, key)? {
        Some(value) if value == T::default() => Err(ConfigError {
            key,
            value: value.to_string(),
            reason: "must be greater than zero".to_string(),
        }),
        other => Ok(other),
    }
}
