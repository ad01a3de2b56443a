//! Lease records and job cadences.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use billrun_core::JobName;

/// Persisted heartbeat for a named job.
///
/// One record per job name, shared by every process in the fleet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobLeaseRecord {
    pub name: JobName,
    /// When the last cycle started (committed before its body ran)
    pub last_executed: DateTime<Utc>,
    pub execution_count: u64,
}

/// Invalid cron expression.
#[derive(Debug, thiserror::Error)]
#[error("invalid cron expression '{expression}': {source}")]
pub struct CadenceError {
    pub expression: String,
    #[source]
    pub source: cron::error::Error,
}

/// How often a job becomes eligible.
#[derive(Debug, Clone)]
pub enum Cadence {
    /// Fixed interval since the last execution.
    Every(Duration),
    /// Next fire time of a cron expression (seconds field first).
    Cron {
        expression: String,
        schedule: Box<cron::Schedule>,
    },
}

impl Cadence {
    pub fn every(interval: Duration) -> Self {
        Self::Every(interval)
    }

    pub fn cron(expression: &str) -> Result<Self, CadenceError> {
        let schedule = cron::Schedule::from_str(expression).map_err(|source| CadenceError {
            expression: expression.to_string(),
            source,
        })?;
        Ok(Self::Cron {
            expression: expression.to_string(),
            schedule: Box::new(schedule),
        })
    }

    /// Earliest instant the job may run again after running at `last`.
    ///
    /// A job that never ran is treated as last executed at the epoch. `None`
    /// means the job never becomes eligible again.
    pub fn next_eligible(&self, last: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
        let last = last.unwrap_or(DateTime::UNIX_EPOCH);
        match self {
            Cadence::Every(interval) => {
                let interval = chrono::Duration::from_std(*interval).ok()?;
                last.checked_add_signed(interval)
            }
            Cadence::Cron { schedule, .. } => schedule.after(&last).next(),
        }
    }

    pub fn is_eligible(&self, last: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        self.next_eligible(last).is_some_and(|next| next <= now)
    }

    /// Length of the cycle starting at `now`; bounds how long one body run may take.
    pub fn period_after(&self, now: DateTime<Utc>) -> Duration {
        match self {
            Cadence::Every(interval) => *interval,
            Cadence::Cron { schedule, .. } => schedule
                .after(&now)
                .next()
                .and_then(|next| (next - now).to_std().ok())
                .unwrap_or(FALLBACK_CRON_PERIOD),
        }
    }
}

const FALLBACK_CRON_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

impl std::fmt::Display for Cadence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Cadence::Every(interval) => write!(f, "every {interval:?}"),
            Cadence::Cron { expression, .. } => write!(f, "cron '{expression}'"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, h, m, 0).unwrap()
    }

    #[test]
    fn interval_eligibility_boundary() {
        let cadence = Cadence::every(Duration::from_secs(3600));
        let last = at(10, 0);

        assert!(!cadence.is_eligible(Some(last), last));
        assert!(!cadence.is_eligible(Some(last), at(10, 59)));
        assert!(cadence.is_eligible(Some(last), at(11, 0) + chrono::Duration::milliseconds(1)));
        assert_eq!(cadence.next_eligible(Some(last)), Some(at(11, 0)));
    }

    #[test]
    fn never_run_job_is_eligible() {
        let cadence = Cadence::every(Duration::from_secs(3600));
        assert!(cadence.is_eligible(None, at(0, 0)));
    }

    #[test]
    fn cron_next_fire_time() {
        let cadence = Cadence::cron("0 30 2 * * * *").unwrap();
        let last = at(2, 30);

        let next = cadence.next_eligible(Some(last)).unwrap();
        assert_eq!(next, last + chrono::Duration::days(1));
        assert!(!cadence.is_eligible(Some(last), at(23, 0)));
        assert_eq!(cadence.period_after(at(2, 0)), Duration::from_secs(30 * 60));
    }

    #[test]
    fn invalid_cron_is_rejected() {
        let err = Cadence::cron("every tuesday").unwrap_err();
        assert!(err.to_string().contains("every tuesday"));
    }

    #[test]
    fn huge_interval_is_never_eligible() {
        let cadence = Cadence::every(Duration::MAX);
        assert_eq!(cadence.next_eligible(Some(at(0, 0))), None);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 256,
                ..ProptestConfig::default()
            })]

            /// Property: an interval job is eligible exactly when a full
            /// interval has passed since its last execution.
            #[test]
            fn interval_eligible_iff_full_interval_elapsed(
                interval_secs in 1u64..10_000_000,
                elapsed_secs in 0i64..20_000_000,
            ) {
                let cadence = Cadence::every(Duration::from_secs(interval_secs));
                let last = at(12, 0);
                let now = last + chrono::Duration::seconds(elapsed_secs);

                prop_assert_eq!(
                    cadence.is_eligible(Some(last), now),
                    elapsed_secs as u64 >= interval_secs
                );
            }
        }
    }
}
