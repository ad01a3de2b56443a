//! Strongly-typed identifiers used across the scheduler and workflow runtime.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Name of a lease-scheduled job (unique key of its lease record).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobName(String);

/// Caller-chosen, globally unique identifier of a workflow instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

macro_rules! impl_string_newtype {
    ($t:ty) => {
        impl $t {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $t {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $t {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl AsRef<str> for $t {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

impl_string_newtype!(JobName);
impl_string_newtype!(InstanceId);

impl InstanceId {
    /// Derive an id from the content that triggers the workflow.
    ///
    /// Identical `(category, payload)` pairs always yield the same id, so
    /// creating the instance twice is recognised as "already scheduled".
    /// The payload is hashed through its `serde_json` serialization; map keys
    /// of `serde_json::Value` are ordered, which keeps the digest stable.
    pub fn derive<T: Serialize + ?Sized>(
        category: &str,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        let canonical = serde_json::to_vec(&serde_json::to_value(payload)?)?;
        let mut hasher = Sha256::new();
        hasher.update(category.as_bytes());
        hasher.update([0u8]);
        hasher.update(&canonical);
        Ok(Self(format!("{category}-{:x}", hasher.finalize())))
    }

    /// A fresh, time-ordered id for work that needs no de-duplication.
    pub fn random(category: &str) -> Self {
        Self(format!("{category}-{}", Uuid::now_v7()))
    }

    /// Deterministic id of the child instance started by step `step_index`
    /// of this instance on its `attempt`-th try.
    pub fn child(&self, step_index: u32, attempt: u32) -> Self {
        Self(format!("{}/{}.{}", self.0, step_index, attempt))
    }
}
