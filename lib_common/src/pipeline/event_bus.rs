//! # In-Process Event Bus
//!
//! Decouples producers (the ingestion relay) from consumers (the push gateway).
//! Handlers run synchronously on the publisher's context, in subscription
//! order, so they must only enqueue work. Events published while nobody is
//! subscribed are dropped; there is no replay buffer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::trace;

/// Event type the push gateway listens on for broadcast-ready envelopes.
pub const NEW_EVENT: &str = "newEvent";

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Returned by [`EventBus::subscribe`]; pass to [`EventBus::unsubscribe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    event_type: String,
    id: u64,
}

impl SubscriptionHandle {
    pub fn event_type(&self) -> &str {
        &self.event_type
    }
}

struct Registry<E> {
    next_id: u64,
    handlers: HashMap<String, Vec<(u64, Handler<E>)>>,
}

pub struct EventBus<E> {
    registry: Mutex<Registry<E>>,
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> EventBus<E> {
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(Registry {
                next_id: 0,
                handlers: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry<E>> {
        self.registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe<F>(&self, event_type: &str, handler: F) -> SubscriptionHandle
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let mut registry = self.lock();
        registry.next_id += 1;
        let id = registry.next_id;
        registry
            .handlers
            .entry(event_type.to_string())
            .or_default()
            .push((id, Arc::new(handler)));
        SubscriptionHandle {
            event_type: event_type.to_string(),
            id,
        }
    }

    /// Returns `false` if the handle was already removed.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let mut registry = self.lock();
        let Some(handlers) = registry.handlers.get_mut(&handle.event_type) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(id, _)| *id != handle.id);
        let removed = handlers.len() != before;
        if handlers.is_empty() {
            registry.handlers.remove(&handle.event_type);
        }
        removed
    }

    /// Invokes every handler registered for `event_type` and returns how many ran.
    ///
    /// The handler list is snapshotted and the lock released before any handler
    /// runs, so handlers may subscribe or unsubscribe without deadlocking.
    pub fn publish(&self, event_type: &str, event: &E) -> usize {
        let snapshot: Vec<Handler<E>> = match self.lock().handlers.get(event_type) {
            Some(handlers) => handlers.iter().map(|(_, h)| Arc::clone(h)).collect(),
            None => Vec::new(),
        };
        for handler in &snapshot {
            handler(event);
        }
        trace!(event_type, handlers = snapshot.len(), "Event published");
        snapshot.len()
    }

    /// Event types with their current handler counts, sorted by type.
    pub fn list_subscriptions(&self) -> Vec<(String, usize)> {
        let mut listing: Vec<(String, usize)> = self
            .lock()
            .handlers
            .iter()
            .map(|(event_type, handlers)| (event_type.clone(), handlers.len()))
            .collect();
        listing.sort();
        listing
    }
}
