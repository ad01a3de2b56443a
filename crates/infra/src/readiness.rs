//! One-shot broadcast readiness gates.
//!
//! A gate starts pending and is signaled exactly once, optionally carrying a
//! payload (for example the client published by a dispatcher that has
//! finished starting up). Any number of waiters observe the same signal, and
//! waiters that arrive after signaling resolve immediately. Cancelling one
//! waiter never consumes or disturbs the signal for the others.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use billrun_core::Cancelled;

struct GateInner<T> {
    name: String,
    tx: watch::Sender<Option<T>>,
}

/// Broadcast completion signal carrying a payload of type `T`.
///
/// Clones share the same underlying signal.
pub struct ReadinessGate<T = ()> {
    inner: Arc<GateInner<T>>,
}

impl<T> Clone for ReadinessGate<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for ReadinessGate<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadinessGate")
            .field("name", &self.inner.name)
            .field("ready", &self.inner.tx.borrow().is_some())
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> ReadinessGate<T> {
    pub fn new(name: impl Into<String>) -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            inner: Arc::new(GateInner {
                name: name.into(),
                tx,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Transition pending → signaled and wake every waiter.
    ///
    /// Returns `false` if the gate was already signaled; the first payload is
    /// kept and the new one is dropped.
    pub fn signal_completion(&self, payload: T) -> bool {
        let signaled = self.inner.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(payload);
            true
        });

        if signaled {
            debug!(gate = %self.inner.name, "readiness gate signaled");
        } else {
            warn!(gate = %self.inner.name, "readiness gate signaled twice; keeping first payload");
        }
        signaled
    }

    pub fn is_ready(&self) -> bool {
        self.inner.tx.borrow().is_some()
    }

    /// Payload if already signaled.
    pub fn payload(&self) -> Option<T> {
        self.inner.tx.borrow().clone()
    }

    /// Wait until the gate is signaled and return its payload.
    ///
    /// Fails with [`Cancelled`] if `token` fires first.
    pub async fn wait_for_completion(&self, token: &CancellationToken) -> Result<T, Cancelled> {
        let mut rx = self.inner.tx.subscribe();
        tokio::select! {
            biased;
            signaled = rx.wait_for(Option::is_some) => {
                let payload = match signaled {
                    Ok(value) => value.clone(),
                    Err(_) => None,
                };
                payload.ok_or(Cancelled)
            }
            _ = token.cancelled() => Err(Cancelled),
        }
    }
}

impl ReadinessGate<()> {
    /// Signal a gate that carries no payload.
    pub fn signal(&self) -> bool {
        self.signal_completion(())
    }
}

/// Type-erased view of a gate, used where gates with different payloads are
/// awaited together (scheduler prerequisites).
#[async_trait]
pub trait Prerequisite: Send + Sync {
    fn name(&self) -> &str;

    fn is_ready(&self) -> bool;

    async fn wait_ready(&self, token: &CancellationToken) -> Result<(), Cancelled>;
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> Prerequisite for ReadinessGate<T> {
    fn name(&self) -> &str {
        ReadinessGate::name(self)
    }

    fn is_ready(&self) -> bool {
        ReadinessGate::is_ready(self)
    }

    async fn wait_ready(&self, token: &CancellationToken) -> Result<(), Cancelled> {
        self.wait_for_completion(token).await.map(|_| ())
    }
}

/// Await every prerequisite in order.
pub async fn wait_all(
    prerequisites: &[Arc<dyn Prerequisite>],
    token: &CancellationToken,
) -> Result<(), Cancelled> {
    for prerequisite in prerequisites {
        if !prerequisite.is_ready() {
            debug!(gate = prerequisite.name(), "waiting for prerequisite");
        }
        prerequisite.wait_ready(token).await?;
    }
    Ok(())
}
