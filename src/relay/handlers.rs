//! Subscriber registries for relay messages, state changes and errors.
//!
//! Registrations are stable: dropping a [`Subscription`] leaves the handler
//! installed. Only [`Subscription::unsubscribe`] removes it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use callcore::{ConnectionState, SignalEnvelope};

use super::error::TransportError;

pub type MessageHandler = dyn Fn(&SignalEnvelope) + Send + Sync;
pub type StateHandler = dyn Fn(ConnectionState) + Send + Sync;
pub type ErrorHandler = dyn Fn(&TransportError) + Send + Sync;

pub(crate) struct Registry<H: ?Sized> {
    next_id: AtomicU64,
    entries: RwLock<Vec<(u64, Arc<H>)>>,
}

impl<H: ?Sized + Send + Sync + 'static> Registry<H> {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(0),
            entries: RwLock::new(Vec::new()),
        })
    }

    pub(crate) fn add(self: &Arc<Self>, handler: Arc<H>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries
            .write()
            .expect("RwLock should not be poisoned")
            .push((id, handler));

        let registry: Weak<Self> = Arc::downgrade(self);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(registry) = registry.upgrade() {
                    registry.remove(id);
                }
            })),
        }
    }

    fn remove(&self, id: u64) {
        self.entries
            .write()
            .expect("RwLock should not be poisoned")
            .retain(|(entry_id, _)| *entry_id != id);
    }

    /// Handlers in subscription order. Invoked outside the lock so a handler
    /// may subscribe or unsubscribe without deadlocking.
    pub(crate) fn snapshot(&self) -> Vec<Arc<H>> {
        self.entries
            .read()
            .expect("RwLock should not be poisoned")
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries
            .read()
            .expect("RwLock should not be poisoned")
            .len()
    }
}

/// Handle to a registered handler.
#[must_use = "keep the subscription to be able to unsubscribe later"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}
