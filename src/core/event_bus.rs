//! Typed pub/sub bus for preview notifications.
//!
//! `subscribe::<E>()` registers a callback, invoked synchronously by `emit()`.
//! Nothing is buffered: an event with no subscribers is dropped.
//!
//! Callbacks run on the emitting thread (often the render thread), so they
//! must be cheap and must not call back into the scheduler while it emits.
//! Within one event type callbacks fire in subscription order.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use log::trace;

type Callback = Arc<dyn Fn(&dyn Any) + Send + Sync>;

#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<RwLock<HashMap<TypeId, Vec<Callback>>>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let types = self.subscribers.read().map(|s| s.len()).unwrap_or(0);
        f.debug_struct("EventBus").field("event_types", &types).finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events of type `E`.
    ///
    /// # Example
    /// ```ignore
    /// bus.subscribe::<ChunkRendered, _>(move |e| {
    ///     println!("chunk {} ready at {}", e.id, e.path.display());
    /// });
    /// ```
    pub fn subscribe<E, F>(&self, callback: F)
    where
        E: Any + Send + Sync,
        F: Fn(&E) + Send + Sync + 'static,
    {
        let wrapped: Callback = Arc::new(move |any: &dyn Any| {
            if let Some(event) = any.downcast_ref::<E>() {
                callback(event);
            }
        });
        self.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(TypeId::of::<E>())
            .or_default()
            .push(wrapped);
    }

    /// Invoke every subscriber of `E` on the calling thread.
    pub fn emit<E: Any + Send + Sync>(&self, event: E) {
        let callbacks = self
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&TypeId::of::<E>())
            .cloned();
        let Some(callbacks) = callbacks else {
            trace!("No subscribers for {}", std::any::type_name::<E>());
            return;
        };
        // Lock released before invoking, so callbacks may subscribe
        for cb in &callbacks {
            cb(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};

    #[derive(Clone, Debug)]
    struct Rendered {
        id: i32,
    }

    #[derive(Clone, Debug)]
    struct Dirtied {
        ids: Vec<i32>,
    }

    #[test]
    fn test_subscribers_called_per_type() {
        let bus = EventBus::new();
        let rendered = Arc::new(AtomicI32::new(0));
        let dirtied = Arc::new(AtomicI32::new(0));

        let r = Arc::clone(&rendered);
        bus.subscribe::<Rendered, _>(move |e| {
            r.fetch_add(e.id, Ordering::SeqCst);
        });
        let d = Arc::clone(&dirtied);
        bus.subscribe::<Dirtied, _>(move |e| {
            d.fetch_add(e.ids.len() as i32, Ordering::SeqCst);
        });

        bus.emit(Rendered { id: 25 });
        bus.emit(Dirtied { ids: vec![0, 25, 50] });
        assert_eq!(rendered.load(Ordering::SeqCst), 25);
        assert_eq!(dirtied.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_subscription_order_and_clones_share_subscribers() {
        let bus = EventBus::new();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        for tag in ["first", "second"] {
            let seen = Arc::clone(&seen);
            bus.subscribe::<Rendered, _>(move |e| seen.lock().unwrap().push((tag, e.id)));
        }

        bus.clone().emit(Rendered { id: 50 });
        assert_eq!(*seen.lock().unwrap(), vec![("first", 50), ("second", 50)]);
    }

    #[test]
    fn test_emit_without_subscribers_keeps_nothing() {
        let bus = EventBus::new();
        for id in 0..2000 {
            bus.emit(Rendered { id });
        }
        // Late subscribers only see later events
        let count = Arc::new(AtomicI32::new(0));
        let c = Arc::clone(&count);
        bus.subscribe::<Rendered, _>(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit(Rendered { id: 0 });
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
