//! Event names, payloads and the handler registry
//!
//! Lifecycle events use the fixed [`EventName`] variants. Message types
//! arriving from the server are free-form strings routed through
//! [`EventName::Custom`], so consumers can subscribe either to the generic
//! `message` event or to one specific type.

use crate::traits::error::TransportError;
use crate::traits::message::Message;
use crate::traits::transport::{SwitchReason, TransportKind};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::error;

/// Name an event is published under
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventName {
    Open,
    Close,
    Error,
    Message,
    Reconnecting,
    Reconnected,
    Latency,
    TransportSwitch,
    Fallback,
    /// Message-type routing (`{"type": "chat", ...}` is published as `chat`)
    Custom(String),
}

impl EventName {
    pub fn as_str(&self) -> &str {
        match self {
            EventName::Open => "open",
            EventName::Close => "close",
            EventName::Error => "error",
            EventName::Message => "message",
            EventName::Reconnecting => "reconnecting",
            EventName::Reconnected => "reconnected",
            EventName::Latency => "latency",
            EventName::TransportSwitch => "transport_switch",
            EventName::Fallback => "fallback",
            EventName::Custom(name) => name,
        }
    }
}

impl From<&str> for EventName {
    fn from(name: &str) -> Self {
        match name {
            "open" => EventName::Open,
            "close" => EventName::Close,
            "error" => EventName::Error,
            "message" => EventName::Message,
            "reconnecting" => EventName::Reconnecting,
            "reconnected" => EventName::Reconnected,
            "latency" => EventName::Latency,
            "transport_switch" => EventName::TransportSwitch,
            "fallback" => EventName::Fallback,
            other => EventName::Custom(other.to_string()),
        }
    }
}

impl From<String> for EventName {
    fn from(name: String) -> Self {
        EventName::from(name.as_str())
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event payload
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    /// `open`, `close`, `reconnected`
    Empty,
    Error(TransportError),
    /// Generic `message` and type-routed events
    Message(Message),
    Reconnecting { attempt: u32, delay: Duration },
    /// Round trip in milliseconds
    Latency { latency: u64 },
    TransportSwitch {
        from: Option<TransportKind>,
        to: TransportKind,
        reason: SwitchReason,
        error: Option<TransportError>,
    },
    Fallback { from: TransportKind, to: TransportKind },
}

/// An event as delivered to handlers
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub name: EventName,
    pub payload: EventPayload,
    /// Adapter that produced the event
    pub transport: Option<TransportKind>,
    /// Reason of the orchestrator's latest switch, when relayed by one
    pub switch_reason: Option<SwitchReason>,
}

impl Event {
    pub fn new(name: EventName, payload: EventPayload) -> Self {
        Self {
            name,
            payload,
            transport: None,
            switch_reason: None,
        }
    }

    pub fn from_transport(mut self, kind: TransportKind) -> Self {
        self.transport = Some(kind);
        self
    }

    /// The message carried by `message` and type-routed events
    pub fn message(&self) -> Option<&Message> {
        match &self.payload {
            EventPayload::Message(msg) => Some(msg),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&TransportError> {
        match &self.payload {
            EventPayload::Error(err) => Some(err),
            _ => None,
        }
    }
}

/// Event handler callback
pub type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Wrap a closure as a [`Handler`]
pub fn handler<F>(f: F) -> Handler
where
    F: Fn(&Event) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Capability to remove a previously registered handler
///
/// Dropping the subscription without calling [`Subscription::unsubscribe`]
/// leaves the handler registered.
#[must_use = "keep the subscription to be able to unsubscribe"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new<F>(cancel: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A subscription with nothing to undo
    pub fn noop() -> Self {
        Self { cancel: None }
    }

    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Mapping from event name to the handlers registered under it
///
/// A handler is stored at most once per name. Dispatch works on a snapshot,
/// so handlers may subscribe or unsubscribe while an event is in flight.
#[derive(Default)]
pub struct EventHandlers {
    handlers: Mutex<HashMap<String, Vec<(u64, Handler)>>>,
    next_id: AtomicU64,
}

impl EventHandlers {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register `handler` under `name`
    pub fn add(self: &Arc<Self>, name: &EventName, handler: Handler) -> Subscription {
        let key = name.as_str().to_string();
        let id = {
            let mut handlers = self.handlers.lock();
            let entries = handlers.entry(key.clone()).or_default();
            match entries.iter().find(|(_, h)| Arc::ptr_eq(h, &handler)) {
                Some((id, _)) => *id,
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    entries.push((id, handler));
                    id
                }
            }
        };

        let registry: Weak<Self> = Arc::downgrade(self);
        Subscription::new(move || {
            if let Some(registry) = registry.upgrade() {
                registry.remove(&key, id);
            }
        })
    }

    fn remove(&self, name: &str, id: u64) {
        let mut handlers = self.handlers.lock();
        if let Some(entries) = handlers.get_mut(name) {
            entries.retain(|(entry_id, _)| *entry_id != id);
            if entries.is_empty() {
                handlers.remove(name);
            }
        }
    }

    /// Invoke every handler registered under the event's name
    ///
    /// A panicking handler is logged and does not stop the others.
    pub fn emit(&self, event: &Event) {
        let snapshot: Vec<Handler> = {
            let handlers = self.handlers.lock();
            match handlers.get(event.name.as_str()) {
                Some(entries) => entries.iter().map(|(_, h)| Arc::clone(h)).collect(),
                None => return,
            }
        };

        for handler in snapshot {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                error!("Handler for '{}' event panicked", event.name);
            }
        }
    }

    /// Names that currently have at least one handler
    pub fn names(&self) -> Vec<EventName> {
        self.handlers
            .lock()
            .keys()
            .map(|name| EventName::from(name.as_str()))
            .collect()
    }

    pub fn handler_count(&self, name: &EventName) -> usize {
        self.handlers
            .lock()
            .get(name.as_str())
            .map_or(0, Vec::len)
    }

    pub fn clear(&self) {
        self.handlers.lock().clear();
    }
}

impl fmt::Debug for EventHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handlers = self.handlers.lock();
        let counts: HashMap<&str, usize> = handlers
            .iter()
            .map(|(name, entries)| (name.as_str(), entries.len()))
            .collect();
        f.debug_struct("EventHandlers").field("handlers", &counts).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, Handler) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        (count, handler(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        }))
    }

    #[test]
    fn test_event_name_round_trip() {
        assert_eq!(EventName::from("open"), EventName::Open);
        assert_eq!(EventName::from("transport_switch"), EventName::TransportSwitch);
        assert_eq!(EventName::from("chat"), EventName::Custom("chat".into()));
        assert_eq!(EventName::Custom("chat".into()).as_str(), "chat");
    }

    #[test]
    fn test_emit_and_unsubscribe() {
        let registry = EventHandlers::new();
        let (count, h) = counter();
        let sub = registry.add(&EventName::Open, h);

        registry.emit(&Event::new(EventName::Open, EventPayload::Empty));
        registry.emit(&Event::new(EventName::Close, EventPayload::Empty));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        sub.unsubscribe();
        registry.emit(&Event::new(EventName::Open, EventPayload::Empty));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(registry.handler_count(&EventName::Open), 0);
    }

    #[test]
    fn test_same_handler_stored_once_per_name() {
        let registry = EventHandlers::new();
        let (count, h) = counter();
        let _a = registry.add(&EventName::Open, Arc::clone(&h));
        let _b = registry.add(&EventName::Open, Arc::clone(&h));
        let _c = registry.add(&EventName::Close, h);

        assert_eq!(registry.handler_count(&EventName::Open), 1);
        registry.emit(&Event::new(EventName::Open, EventPayload::Empty));
        registry.emit(&Event::new(EventName::Close, EventPayload::Empty));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_panicking_handler_does_not_block_others() {
        let registry = EventHandlers::new();
        let _bad = registry.add(&EventName::Message, handler(|_| panic!("handler failure")));
        let (count, h) = counter();
        let _good = registry.add(&EventName::Message, h);

        registry.emit(&Event::new(EventName::Message, EventPayload::Empty));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_clear_drops_everything() {
        let registry = EventHandlers::new();
        let (count, h) = counter();
        let _sub = registry.add(&EventName::Custom("chat".into()), h);
        registry.clear();
        registry.emit(&Event::new(EventName::Custom("chat".into()), EventPayload::Empty));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(registry.names().is_empty());
    }
}
