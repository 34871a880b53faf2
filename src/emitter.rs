//! In-process publish/subscribe for instance lifecycle and activation
//! events.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::evaluation::VariationEvaluation;
use crate::Context;

/// The fixed set of event names an instance emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum EventName {
    /// Fired exactly once, when the instance has a usable datafile.
    Ready,
    /// Fired after every successful refresh.
    Refresh,
    /// Fired after a refresh that installed a different revision.
    Update,
    /// Fired when [`crate::Instance::activate`] resolves a variation.
    Activation,
}

/// An emitted event with its payload.
#[derive(Debug, Clone)]
pub enum Event {
    Ready,
    Refresh,
    Update,
    Activation(ActivationEvent),
}

impl Event {
    pub fn name(&self) -> EventName {
        match self {
            Event::Ready => EventName::Ready,
            Event::Refresh => EventName::Refresh,
            Event::Update => EventName::Update,
            Event::Activation(_) => EventName::Activation,
        }
    }
}

/// Payload of an [`EventName::Activation`] event.
#[derive(Debug, Clone)]
pub struct ActivationEvent {
    pub feature_key: String,
    pub variation_value: String,
    /// The context the variation was evaluated with (after interception).
    pub context: Context,
    /// The subset of `context` whose attributes are marked `capture` in the
    /// datafile.
    pub captured_context: Context,
    pub evaluation: VariationEvaluation,
}

/// Identifies a registered listener so it can be removed later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

/// A synchronous event bus.
///
/// Listeners for the same event fire in registration order on the emitting
/// thread. Registration and removal are serialized with respect to
/// emissions: an emission dispatches to the listener list as it was when the
/// emission started.
pub struct Emitter {
    inner: Mutex<EmitterInner>,
}

struct EmitterInner {
    listeners: HashMap<EventName, Vec<(ListenerId, Listener)>>,
    next_id: u64,
}

impl Emitter {
    pub fn new() -> Emitter {
        Emitter {
            inner: Mutex::new(EmitterInner {
                listeners: HashMap::new(),
                next_id: 0,
            }),
        }
    }

    /// Register a listener for an event. Returns an id usable with
    /// [`Emitter::remove_listener`].
    pub fn add_listener(
        &self,
        event: EventName,
        listener: impl Fn(&Event) + Send + Sync + 'static,
    ) -> ListenerId {
        let mut inner = self.lock();
        let id = ListenerId(inner.next_id);
        inner.next_id += 1;
        inner
            .listeners
            .entry(event)
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    /// Alias of [`Emitter::add_listener`].
    pub fn on(
        &self,
        event: EventName,
        listener: impl Fn(&Event) + Send + Sync + 'static,
    ) -> ListenerId {
        self.add_listener(event, listener)
    }

    /// Remove a previously registered listener. Returns `false` if it was
    /// already removed.
    pub fn remove_listener(&self, event: EventName, id: ListenerId) -> bool {
        let mut inner = self.lock();
        let Some(listeners) = inner.listeners.get_mut(&event) else {
            return false;
        };
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() < before
    }

    /// Alias of [`Emitter::remove_listener`].
    pub fn off(&self, event: EventName, id: ListenerId) -> bool {
        self.remove_listener(event, id)
    }

    /// Remove all listeners for one event, or for every event.
    pub fn remove_all_listeners(&self, event: Option<EventName>) {
        let mut inner = self.lock();
        match event {
            Some(event) => {
                inner.listeners.remove(&event);
            }
            None => inner.listeners.clear(),
        }
    }

    /// Dispatch an event to its listeners, synchronously, in registration
    /// order.
    pub fn emit(&self, event: &Event) {
        // Snapshot the listener list before dispatching so that listeners
        // can register or remove listeners without deadlocking.
        let listeners: Vec<Listener> = {
            let inner = self.lock();
            inner
                .listeners
                .get(&event.name())
                .map(|listeners| listeners.iter().map(|(_, l)| l.clone()).collect())
                .unwrap_or_default()
        };

        for listener in listeners {
            listener(event);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EmitterInner> {
        self.inner
            .lock()
            .expect("thread holding emitter lock should not panic")
    }
}

impl Default for Emitter {
    fn default() -> Emitter {
        Emitter::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;

    #[test]
    fn listeners_fire_in_registration_order() {
        let emitter = Emitter::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for label in ["first", "second", "third"] {
            let order = order.clone();
            emitter.on(EventName::Ready, move |_| {
                order.lock().unwrap().push(label);
            });
        }

        emitter.emit(&Event::Ready);
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn listeners_only_receive_their_event() {
        let emitter = Emitter::new();
        let refreshes = Arc::new(AtomicUsize::new(0));

        {
            let refreshes = refreshes.clone();
            emitter.on(EventName::Refresh, move |_| {
                refreshes.fetch_add(1, Ordering::SeqCst);
            });
        }

        emitter.emit(&Event::Ready);
        emitter.emit(&Event::Refresh);
        emitter.emit(&Event::Update);
        assert_eq!(refreshes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn remove_listener() {
        let emitter = Emitter::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let id = {
            let calls = calls.clone();
            emitter.add_listener(EventName::Update, move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            })
        };

        emitter.emit(&Event::Update);
        assert!(emitter.remove_listener(EventName::Update, id));
        emitter.emit(&Event::Update);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // Removing again reports false.
        assert!(!emitter.remove_listener(EventName::Update, id));
    }

    #[test]
    fn remove_all_listeners() {
        let emitter = Emitter::new();
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let calls = calls.clone();
            emitter.on(EventName::Ready, move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            });
        }
        {
            let calls = calls.clone();
            emitter.on(EventName::Refresh, move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            });
        }

        emitter.remove_all_listeners(Some(EventName::Ready));
        emitter.emit(&Event::Ready);
        emitter.emit(&Event::Refresh);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        emitter.remove_all_listeners(None);
        emitter.emit(&Event::Refresh);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listener_may_mutate_the_emitter() {
        let emitter = Arc::new(Emitter::new());
        let calls = Arc::new(AtomicUsize::new(0));

        {
            let emitter_inside = emitter.clone();
            let calls = calls.clone();
            emitter.on(EventName::Ready, move |_| {
                let calls = calls.clone();
                // Registering from inside a listener must not deadlock.
                emitter_inside.on(EventName::Refresh, move |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                });
            });
        }

        emitter.emit(&Event::Ready);
        emitter.emit(&Event::Refresh);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
