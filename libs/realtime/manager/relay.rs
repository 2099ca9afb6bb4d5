//! Forwarding of consumer handlers onto the active adapter
//!
//! The orchestrator owns the consumer registry. While an adapter is attached,
//! one forwarding handler per event name is registered on it; detaching
//! unsubscribes every forwarder and bumps the relay generation, so an event
//! still in flight on the old adapter is dropped instead of reaching
//! consumers after the switch.

use crate::traits::*;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Events orchestrators observe internally; forwarded ahead of their own
/// listeners so consumers see the triggering event before any switch
const OBSERVED: [EventName; 7] = [
    EventName::Open,
    EventName::Close,
    EventName::Error,
    EventName::Message,
    EventName::Reconnecting,
    EventName::Reconnected,
    EventName::Latency,
];

pub(crate) struct Relay {
    shared: Arc<RelayShared>,
}

struct RelayShared {
    consumers: Arc<EventHandlers>,
    generation: AtomicU64,
    reason: Mutex<Option<SwitchReason>>,
    attached: Mutex<Option<Attached>>,
}

struct Attached {
    transport: Arc<dyn Transport>,
    generation: u64,
    forwarded: HashSet<String>,
    subscriptions: Vec<Subscription>,
}

impl Relay {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(RelayShared {
                consumers: EventHandlers::new(),
                generation: AtomicU64::new(0),
                reason: Mutex::new(None),
                attached: Mutex::new(None),
            }),
        }
    }

    /// Register a consumer handler
    pub fn on(&self, name: EventName, handler: Handler) -> Subscription {
        let subscription = self.shared.consumers.add(&name, handler);
        if let Some(attached) = self.shared.attached.lock().as_mut() {
            self.shared.forward(attached, &name);
        }
        subscription
    }

    /// Route consumer handlers to `transport`, replacing any previous adapter
    pub fn attach(&self, transport: Arc<dyn Transport>) {
        self.detach();
        let generation = self.shared.generation.load(Ordering::Acquire);
        let mut attached = Attached {
            transport,
            generation,
            forwarded: HashSet::new(),
            subscriptions: Vec::new(),
        };
        for name in OBSERVED.iter().cloned().chain(self.shared.consumers.names()) {
            self.shared.forward(&mut attached, &name);
        }
        *self.shared.attached.lock() = Some(attached);
    }

    /// Remove every forwarder from the attached adapter
    pub fn detach(&self) {
        self.shared.generation.fetch_add(1, Ordering::AcqRel);
        let attached = self.shared.attached.lock().take();
        if let Some(attached) = attached {
            for subscription in attached.subscriptions {
                subscription.unsubscribe();
            }
        }
    }

    /// Set the switch reason attached to relayed events
    pub fn set_reason(&self, reason: Option<SwitchReason>) {
        *self.shared.reason.lock() = reason;
    }

    /// Publish an orchestrator-level event to consumers
    pub fn emit(&self, mut event: Event) {
        if event.switch_reason.is_none() {
            event.switch_reason = *self.shared.reason.lock();
        }
        self.shared.consumers.emit(&event);
    }

    pub fn clear(&self) {
        self.detach();
        self.shared.consumers.clear();
    }
}

impl RelayShared {
    fn forward(self: &Arc<Self>, attached: &mut Attached, name: &EventName) {
        if !attached.forwarded.insert(name.as_str().to_string()) {
            return;
        }
        let shared = Arc::downgrade(self);
        let generation = attached.generation;
        let forwarder = handler(move |event| {
            let Some(shared) = shared.upgrade() else {
                return;
            };
            if shared.generation.load(Ordering::Acquire) != generation {
                return;
            }
            let mut event = event.clone();
            event.switch_reason = *shared.reason.lock();
            shared.consumers.emit(&event);
        });
        let subscription = attached.transport.on(name.clone(), forwarder);
        attached.subscriptions.push(subscription);
    }
}
