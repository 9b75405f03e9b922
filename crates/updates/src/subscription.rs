//! Listener registry for state change broadcasts.
//!
//! Listeners are identified by a [`SubscriptionId`] handed back from
//! [`SubscriptionRegistry::subscribe`]; the subscriber owns the decision to
//! stop listening by calling [`SubscriptionRegistry::unsubscribe`].

use crate::error::UpdatesError;
use std::cell::RefCell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::warn;

static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    // Ids whose callback is running on this thread.
    static DELIVERING: RefCell<Vec<SubscriptionId>> = const { RefCell::new(Vec::new()) };
}

/// Opaque handle for one registered listener. Unique within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

type Callback<E> = Box<dyn Fn(&E) -> anyhow::Result<()> + Send + Sync>;

struct Listener<E> {
    id: SubscriptionId,
    callback: Callback<E>,
    active: AtomicBool,
    delivery: Mutex<()>,
}

/// Result of one [`SubscriptionRegistry::emit`] call.
#[derive(Debug, Default)]
pub struct EmitOutcome {
    /// Listeners whose callback returned successfully.
    pub delivered: usize,
    /// Listeners whose callback failed or panicked.
    pub failures: Vec<(SubscriptionId, UpdatesError)>,
}

/// Thread-safe publish/subscribe registry.
///
/// Emission is synchronous on the caller's thread and walks listeners in
/// registration order. There is no buffering: a listener only sees events
/// emitted while it is registered.
pub struct SubscriptionRegistry<E> {
    listeners: Mutex<Vec<Arc<Listener<E>>>>,
}

impl<E> Default for SubscriptionRegistry<E> {
    fn default() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
        }
    }
}

impl<E> fmt::Debug for SubscriptionRegistry<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("listeners", &self.len())
            .finish()
    }
}

impl<E> SubscriptionRegistry<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback`. Always succeeds.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&E) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = SubscriptionId(NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed));
        lock(&self.listeners).push(Arc::new(Listener {
            id,
            callback: Box::new(callback),
            active: AtomicBool::new(true),
            delivery: Mutex::new(()),
        }));
        id
    }

    /// Remove a listener. Unknown or already removed ids are a no-op.
    ///
    /// Returns whether a listener was removed. Once this returns, the
    /// listener receives nothing further. When called from inside a
    /// callback, a delivery already running on another thread may still
    /// complete.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = {
            let mut listeners = lock(&self.listeners);
            listeners
                .iter()
                .position(|listener| listener.id == id)
                .map(|index| listeners.remove(index))
        };
        let Some(listener) = removed else {
            return false;
        };

        listener.active.store(false, Ordering::SeqCst);
        let inside_callback = DELIVERING.with(|delivering| !delivering.borrow().is_empty());
        if !inside_callback {
            // Wait out a delivery in flight on another thread.
            drop(lock(&listener.delivery));
        }
        true
    }

    /// Deliver `event` to every registered listener, in registration order.
    ///
    /// A failing or panicking callback is logged and recorded in the
    /// outcome; the remaining listeners still receive the event.
    pub fn emit(&self, event: &E) -> EmitOutcome {
        let listeners: Vec<Arc<Listener<E>>> = lock(&self.listeners).clone();
        let mut outcome = EmitOutcome::default();

        for listener in listeners {
            let _delivery = lock(&listener.delivery);
            if !listener.active.load(Ordering::SeqCst) {
                continue;
            }

            DELIVERING.with(|delivering| delivering.borrow_mut().push(listener.id));
            let result = panic::catch_unwind(AssertUnwindSafe(|| (listener.callback)(event)));
            DELIVERING.with(|delivering| {
                delivering.borrow_mut().pop();
            });

            let failure = match result {
                Ok(Ok(())) => {
                    outcome.delivered += 1;
                    continue;
                }
                Ok(Err(err)) => err.to_string(),
                Err(payload) => panic_message(payload.as_ref()),
            };
            warn!(subscription = %listener.id, error = %failure, "state listener failed");
            outcome
                .failures
                .push((listener.id, UpdatesError::SubscriptionCallback(failure)));
        }

        outcome
    }

    pub fn len(&self) -> usize {
        lock(&self.listeners).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panicked: {message}")
    } else {
        "panicked".to_string()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
