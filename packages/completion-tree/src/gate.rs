//! External gates: one-shot signals that additionally hold back termination.
//!
//! A transport that must finish flushing a response before the work can be
//! released creates a gate pair, hands the [`ExternalGate`] to the node
//! factory and keeps the [`GateTrigger`]:
//!
//! ```ignore
//! let (trigger, gate) = ExternalGate::pair();
//! let root = tree.create_root(metadata, Some(gate));
//!
//! root.resolve_success(Some(reply.clone()))?; // completion fires, termination waits
//! transport.write(reply).await?;
//! trigger.complete();                          // termination fires
//! ```
//!
//! A gate only affects termination, never completion.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;
use tracing::{debug, warn};

type GateCallback = Box<dyn FnOnce() + Send + 'static>;

enum GateState {
    Waiting(Vec<GateCallback>),
    Released,
}

struct GateShared {
    state: Mutex<GateState>,
    notify: Notify,
}

impl GateShared {
    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            warn!("gate mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn release(&self) {
        let callbacks = {
            let mut state = self.lock();
            match std::mem::replace(&mut *state, GateState::Released) {
                GateState::Waiting(callbacks) => callbacks,
                GateState::Released => return,
            }
        };
        self.notify.notify_waiters();
        for callback in callbacks {
            callback();
        }
    }
}

/// Observer side of a one-shot external signal.
///
/// Cheap to clone; all clones observe the same signal.
#[derive(Clone)]
pub struct ExternalGate {
    shared: Arc<GateShared>,
}

impl ExternalGate {
    /// Create a connected trigger/gate pair.
    pub fn pair() -> (GateTrigger, ExternalGate) {
        let shared = Arc::new(GateShared {
            state: Mutex::new(GateState::Waiting(Vec::new())),
            notify: Notify::new(),
        });
        (
            GateTrigger {
                shared: Some(shared.clone()),
            },
            ExternalGate { shared },
        )
    }

    /// Gate released when `future` finishes.
    ///
    /// Must be called within a Tokio runtime: the future is driven by a
    /// spawned task.
    pub fn from_future<F>(future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let (trigger, gate) = Self::pair();
        tokio::spawn(async move {
            future.await;
            trigger.complete();
        });
        gate
    }

    pub fn is_released(&self) -> bool {
        matches!(*self.shared.lock(), GateState::Released)
    }

    /// Run `callback` once the gate is released (immediately if it already is).
    pub(crate) fn subscribe(&self, callback: impl FnOnce() + Send + 'static) {
        {
            let mut state = self.shared.lock();
            if let GateState::Waiting(callbacks) = &mut *state {
                callbacks.push(Box::new(callback));
                return;
            }
        }
        callback();
    }

    /// Wait until the gate is released.
    pub async fn released(&self) {
        loop {
            // Register before checking so a release in between is not lost
            let notified = self.shared.notify.notified();
            if self.is_released() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for ExternalGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalGate")
            .field("released", &self.is_released())
            .finish()
    }
}

/// Completer side of an [`ExternalGate`].
///
/// Dropping an unfired trigger releases the gate: once the trigger is gone
/// nothing else could ever release it.
pub struct GateTrigger {
    shared: Option<Arc<GateShared>>,
}

impl GateTrigger {
    /// Release the gate. Observers run on this thread.
    pub fn complete(mut self) {
        if let Some(shared) = self.shared.take() {
            shared.release();
        }
    }
}

impl Drop for GateTrigger {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            debug!("gate trigger dropped without completing, releasing gate");
            shared.release();
        }
    }
}

impl std::fmt::Debug for GateTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GateTrigger").finish_non_exhaustive()
    }
}
