//! Entity listener broadcasting.
//!
//! Listeners are callbacks registered per entity type and lifecycle event.
//! The executor broadcasts before and after each operation phase and
//! counts how many listeners actually ran: a non-zero count forces a
//! recompute of changed columns, because listeners may mutate entities.

use relorm_core::EntityRef;
use std::collections::HashMap;

/// Lifecycle event a listener can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerEvent {
    /// Before an entity row is inserted.
    BeforeInsert,
    /// After an entity row was inserted.
    AfterInsert,
    /// Before an entity row is updated.
    BeforeUpdate,
    /// After an entity row was updated.
    AfterUpdate,
    /// Before an entity row is deleted.
    BeforeRemove,
    /// After an entity row was deleted.
    AfterRemove,
    /// Before a soft-remove timestamp is set.
    BeforeSoftRemove,
    /// After a soft-remove timestamp was set.
    AfterSoftRemove,
    /// Before a soft-removed row is recovered.
    BeforeRecover,
    /// After a soft-removed row was recovered.
    AfterRecover,
}

type ListenerFn = Box<dyn Fn(&EntityRef) + Send + Sync>;

/// Registry and dispatcher for entity listeners.
#[derive(Default)]
pub struct Broadcaster {
    listeners: HashMap<(String, ListenerEvent), Vec<ListenerFn>>,
}

impl std::fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broadcaster")
            .field("registrations", &self.listeners.len())
            .finish()
    }
}

impl Broadcaster {
    /// Create an empty broadcaster.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for one entity type and event.
    pub fn on<F>(&mut self, entity_name: impl Into<String>, event: ListenerEvent, listener: F)
    where
        F: Fn(&EntityRef) + Send + Sync + 'static,
    {
        self.listeners
            .entry((entity_name.into(), event))
            .or_default()
            .push(Box::new(listener));
    }

    /// Invoke all listeners for the given entity and event.
    ///
    /// Returns how many listeners ran.
    pub fn broadcast(&self, entity_name: &str, event: ListenerEvent, entity: &EntityRef) -> usize {
        match self.listeners.get(&(entity_name.to_string(), event)) {
            Some(listeners) => {
                for listener in listeners {
                    listener(entity);
                }
                listeners.len()
            }
            None => 0,
        }
    }

    /// Whether any listener is registered for the entity type at all.
    pub fn has_listeners(&self, entity_name: &str) -> bool {
        self.listeners.keys().any(|(name, _)| name == entity_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relorm_core::{Value, entity_from_values};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_broadcast_counts_executed_listeners() {
        let mut broadcaster = Broadcaster::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        broadcaster.on("post", ListenerEvent::BeforeInsert, move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        let entity = entity_from_values(std::collections::BTreeMap::new());
        let ran = broadcaster.broadcast("post", ListenerEvent::BeforeInsert, &entity);
        assert_eq!(ran, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Different event and different entity: nothing runs.
        assert_eq!(
            broadcaster.broadcast("post", ListenerEvent::AfterInsert, &entity),
            0
        );
        assert_eq!(
            broadcaster.broadcast("author", ListenerEvent::BeforeInsert, &entity),
            0
        );
    }

    #[test]
    fn test_listener_can_mutate_entity() {
        let mut broadcaster = Broadcaster::new();
        broadcaster.on("post", ListenerEvent::BeforeInsert, |entity| {
            let mut data = entity.lock().expect("entity lock poisoned");
            data.set("title", Value::Text("from listener".into()));
        });
        let entity = entity_from_values(std::collections::BTreeMap::new());
        broadcaster.broadcast("post", ListenerEvent::BeforeInsert, &entity);
        let data = entity.lock().unwrap();
        assert_eq!(data.get("title"), Some(&Value::Text("from listener".into())));
    }
}
