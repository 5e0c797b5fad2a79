//! Event Bus
//!
//! Type-indexed synchronous publish/subscribe for observability
//! signals. Explicitly constructed and handed to the sessions that
//! need it; fan-out happens in subscription order, and a panicking
//! handler does not prevent later handlers from running.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::types::FinishReason;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct SessionCreated {
    pub session_id: String,
}

#[derive(Debug, Clone)]
pub struct SessionEnded {
    pub session_id: String,
    pub reason: FinishReason,
}

#[derive(Debug, Clone, Default)]
pub struct StreamDelta {
    pub session_id: String,
    pub text: String,
}

#[derive(Debug, Clone, Default)]
pub struct ToolCallStarted {
    pub session_id: String,
    pub tool_id: String,
    pub tool_name: String,
}

#[derive(Debug, Clone, Default)]
pub struct ToolCallCompleted {
    pub session_id: String,
    pub tool_id: String,
    pub tool_name: String,
    pub success: bool,
}

/// An MCP server announced that its tool list changed.
#[derive(Debug, Clone, Default)]
pub struct McpToolsChanged {
    pub server_name: String,
}

// ---------------------------------------------------------------------------
// Bus
// ---------------------------------------------------------------------------

/// Handle returned from `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&dyn Any) + Send + Sync>;

struct Subscription {
    id: u64,
    handler: Handler,
}

#[derive(Default)]
struct BusInner {
    next_id: u64,
    subscriptions: HashMap<TypeId, Vec<Subscription>>,
}

/// Process-wide publish/subscribe, indexed by event type.
#[derive(Default)]
pub struct EventBus {
    inner: Mutex<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events of type `E`. The handler runs synchronously
    /// on the publishing thread.
    pub fn subscribe<E: Any + Send + Sync>(
        &self,
        handler: impl Fn(&E) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.next_id += 1;
        let id = inner.next_id;
        let erased: Handler = Arc::new(move |event: &dyn Any| {
            if let Some(event) = event.downcast_ref::<E>() {
                handler(event);
            }
        });
        inner
            .subscriptions
            .entry(TypeId::of::<E>())
            .or_default()
            .push(Subscription { id, handler: erased });
        SubscriptionId(id)
    }

    /// Remove a subscription. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        for subs in inner.subscriptions.values_mut() {
            subs.retain(|s| s.id != id.0);
        }
    }

    /// Publish an event to all subscribers of its type, in
    /// subscription order. Handlers run outside the bus lock.
    pub fn publish<E: Any + Send + Sync>(&self, event: &E) {
        let handlers: Vec<Handler> = {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner
                .subscriptions
                .get(&TypeId::of::<E>())
                .map(|subs| subs.iter().map(|s| Arc::clone(&s.handler)).collect())
                .unwrap_or_default()
        };
        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                warn!("event handler panicked");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn subscribe_and_publish() {
        let bus = EventBus::new();
        let received = Arc::new(Mutex::new(String::new()));

        let r = received.clone();
        bus.subscribe::<SessionCreated>(move |e| {
            *r.lock().unwrap() = e.session_id.clone();
        });

        bus.publish(&SessionCreated {
            session_id: "sess_001".into(),
        });
        assert_eq!(*received.lock().unwrap(), "sess_001");
    }

    #[test]
    fn multiple_subscribers_in_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["a", "b", "c"] {
            let order = order.clone();
            bus.subscribe::<StreamDelta>(move |_| {
                order.lock().unwrap().push(tag);
            });
        }

        bus.publish(&StreamDelta::default());
        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        let sub = bus.subscribe::<SessionEnded>(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        let event = SessionEnded {
            session_id: "s".into(),
            reason: FinishReason::Stop,
        };
        bus.publish(&event);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        bus.unsubscribe(sub);
        bus.publish(&event);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn event_types_are_isolated() {
        let bus = EventBus::new();
        let session_called = Arc::new(AtomicUsize::new(0));
        let stream_called = Arc::new(AtomicUsize::new(0));

        let s = session_called.clone();
        bus.subscribe::<SessionCreated>(move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        });
        let s = stream_called.clone();
        bus.subscribe::<StreamDelta>(move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(&StreamDelta::default());
        assert_eq!(session_called.load(Ordering::SeqCst), 0);
        assert_eq!(stream_called.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn publish_with_no_subscribers() {
        let bus = EventBus::new();
        bus.publish(&McpToolsChanged {
            server_name: "filesystem".into(),
        });
    }

    #[test]
    fn panicking_handler_does_not_block_others() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        bus.subscribe::<SessionCreated>(|_| panic!("boom"));
        let c = count.clone();
        bus.subscribe::<SessionCreated>(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(&SessionCreated::default());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
