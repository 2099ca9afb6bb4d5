//! State and bookkeeping shared by the three adapters
//!
//! Every adapter wraps one [`AdapterCore`]. It owns the connection state,
//! the handler registry, the resumption cursor, heartbeat and latency
//! bookkeeping, and the background tasks of the current connection.
//!
//! Each connection attempt gets a fresh generation number. Callbacks carry
//! the generation they were started with and are ignored once it is stale,
//! so nothing from a torn-down connection can leak into the next one.

use crate::core::config::TransportConfig;
use crate::core::heartbeat::PendingPings;
use crate::core::latency::LatencySampler;
use crate::traits::*;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub(crate) struct AdapterCore {
    kind: TransportKind,
    pub(crate) config: TransportConfig,
    handlers: std::sync::Arc<EventHandlers>,
    state: Mutex<ConnectionState>,
    cursor: ResumeCursor,
    backoff: ExponentialBackoff,
    sampler: Mutex<LatencySampler>,
    pings: Mutex<PendingPings>,
    /// One-shot delay requested by the server (`retry:` line)
    retry_override: Mutex<Option<Duration>>,
    destroyed: AtomicBool,
    explicit_stop: AtomicBool,
    generation: AtomicU64,
    /// Tasks belonging to the current connection
    tasks: Mutex<Vec<JoinHandle<()>>>,
    reconnect_timer: Mutex<Option<JoinHandle<()>>>,
}

impl AdapterCore {
    pub fn new(kind: TransportKind, config: TransportConfig) -> Self {
        let cursor = ResumeCursor::new(
            std::sync::Arc::clone(&config.cursor_store),
            config.cursor_key.clone(),
        );
        let state = ConnectionState {
            last_event_id: cursor.load(),
            ..ConnectionState::default()
        };
        let backoff = config.backoff();

        Self {
            kind,
            config,
            handlers: EventHandlers::new(),
            state: Mutex::new(state),
            cursor,
            backoff,
            sampler: Mutex::new(LatencySampler::new()),
            pings: Mutex::new(PendingPings::new()),
            retry_override: Mutex::new(None),
            destroyed: AtomicBool::new(false),
            explicit_stop: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            tasks: Mutex::new(Vec::new()),
            reconnect_timer: Mutex::new(None),
        }
    }

    pub fn on(&self, event: EventName, handler: Handler) -> Subscription {
        self.handlers.add(&event, handler)
    }

    // ---- lifecycle flags ----

    #[inline]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.explicit_stop.load(Ordering::Acquire)
    }

    /// Validate a `connect` call and clear the explicit-stop flag
    pub fn begin_connect(&self) -> Result<()> {
        if self.is_destroyed() {
            return Err(TransportError::Destroyed);
        }
        self.explicit_stop.store(false, Ordering::Release);
        Ok(())
    }

    /// Start a new connection generation, invalidating the previous one
    pub fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_current(&self, generation: u64) -> bool {
        !self.is_destroyed() && self.generation.load(Ordering::Acquire) == generation
    }

    // ---- state ----

    pub fn state(&self) -> ConnectionState {
        self.state.lock().clone()
    }

    #[inline]
    pub fn status(&self) -> ConnectionStatus {
        self.state.lock().status
    }

    pub fn set_status(&self, status: ConnectionStatus) {
        self.state.lock().status = status;
    }

    pub fn last_event_id(&self) -> Option<String> {
        self.state.lock().last_event_id.clone()
    }

    /// Record a successful (re)connection; true if it ended a reconnect cycle
    pub fn mark_connected(&self, status: ConnectionStatus) -> bool {
        let mut state = self.state.lock();
        let was_reconnect = state.reconnect_attempts > 0;
        state.reconnect_attempts = 0;
        state.error = None;
        state.status = status;
        was_reconnect
    }

    /// Reset the attempt counter after a successful exchange
    pub fn reset_attempts(&self) {
        let mut state = self.state.lock();
        state.reconnect_attempts = 0;
        state.error = None;
    }

    // ---- events ----

    pub fn emit(&self, name: EventName, payload: EventPayload) {
        let event = Event::new(name, payload).from_transport(self.kind);
        self.handlers.emit(&event);
    }

    /// Store the error in state and publish it
    pub fn emit_error(&self, error: TransportError) {
        warn!("[{}] {}", self.kind, error);
        self.state.lock().error = Some(error.clone());
        self.emit(EventName::Error, EventPayload::Error(error));
    }

    pub fn clear_handlers(&self) {
        self.handlers.clear();
    }

    /// Handle one inbound record
    ///
    /// Advances the cursor when the record has an id, publishes it as
    /// `message`, and again under its `type` when it carries `data`.
    pub fn deliver(&self, message: Message) {
        if let Some(id) = message.id.as_deref() {
            self.advance_cursor(id);
        }

        let routed = message
            .routing_type()
            .map(EventName::from)
            .filter(|name| matches!(name, EventName::Custom(_)));

        match routed {
            Some(name) => {
                self.emit(EventName::Message, EventPayload::Message(message.clone()));
                self.emit(name, EventPayload::Message(message));
            }
            None => self.emit(EventName::Message, EventPayload::Message(message)),
        }
    }

    /// Update and persist the resumption cursor
    pub fn advance_cursor(&self, id: &str) {
        self.state.lock().last_event_id = Some(id.to_string());
        self.cursor.persist(id);
    }

    // ---- heartbeat & latency ----

    /// Create a ping and mark it pending; returns its correlation id
    ///
    /// Pings left unanswered for twice the longer of the heartbeat timeout
    /// and the sampling interval are dropped first.
    pub fn next_ping(&self) -> (i64, Message) {
        let correlation = {
            let mut pings = self.pings.lock();
            let dropped = pings.prune(self.ping_lifetime());
            if dropped > 0 {
                debug!("[{}] Dropped {} unanswered pings", self.kind, dropped);
            }
            pings.record(now_millis())
        };
        (correlation, Message::ping(correlation))
    }

    fn ping_lifetime(&self) -> Duration {
        let config = &self.config;
        config
            .heartbeat_timeout
            .max(config.latency_sampling_interval)
            .saturating_mul(2)
    }

    #[cfg(test)]
    fn pending_pings(&self) -> usize {
        self.pings.lock().len()
    }

    /// Match a pong against the pending pings; returns the round trip in ms
    pub fn resolve_pong(&self, pong: &Message) -> Option<u64> {
        let correlation = pong.correlation()?;
        self.pings
            .lock()
            .resolve(correlation)
            .map(|rtt| rtt.as_millis() as u64)
    }

    /// True if the ping was still unanswered when its timeout fired
    pub fn expire_ping(&self, correlation: i64) -> bool {
        self.pings.lock().expire(correlation)
    }

    /// Store a round-trip measurement and publish it
    pub fn record_latency(&self, latency: u64) {
        let average = {
            let mut sampler = self.sampler.lock();
            sampler.record(latency);
            sampler.average()
        };
        {
            let mut state = self.state.lock();
            state.latency = Some(latency);
            state.average_latency = average;
        }
        debug!("[{}] Latency: {}ms (avg {:?})", self.kind, latency, average);
        self.emit(EventName::Latency, EventPayload::Latency { latency });
    }

    pub fn set_retry_override(&self, delay: Duration) {
        *self.retry_override.lock() = Some(delay);
    }

    // ---- tasks ----

    /// Attach a task to the current connection
    pub fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    /// Abort every task of the current connection and forget pending pings
    pub fn stop_tasks(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            task.abort();
        }
        self.pings.lock().clear();
    }

    // ---- reconnection ----

    /// Whether a lost connection should be retried
    pub fn can_reconnect(&self) -> bool {
        let attempts = self.state.lock().reconnect_attempts;
        !self.is_destroyed() && !self.is_stopped() && self.backoff.should_reconnect(attempts)
    }

    /// React to losing connection `generation`
    ///
    /// Tears down the connection's tasks, settles the status, emits `close`
    /// when asked to, and schedules `reconnect` if attempts remain.
    pub fn handle_connection_loss<F>(&self, generation: u64, emit_close: bool, reconnect: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.is_current(generation) {
            return;
        }
        self.next_generation();
        self.stop_tasks();

        let will_retry = self.can_reconnect();
        self.set_status(if will_retry {
            ConnectionStatus::Reconnecting
        } else {
            ConnectionStatus::Disconnected
        });

        if emit_close {
            self.emit(EventName::Close, EventPayload::Empty);
        }

        if will_retry {
            self.schedule_reconnect(reconnect);
        } else if !self.is_stopped() {
            warn!("[{}] Reconnection attempts exhausted, staying disconnected", self.kind);
        }
    }

    /// Schedule `reconnect` after the next backoff delay
    ///
    /// A server-provided retry delay, if any, replaces the computed backoff
    /// for this attempt only.
    pub fn schedule_reconnect<F>(&self, reconnect: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let attempt = {
            let mut state = self.state.lock();
            state.reconnect_attempts += 1;
            state.reconnect_attempts
        };

        let delay = match self.retry_override.lock().take() {
            Some(delay) => Some(delay),
            None => self.backoff.next_delay(attempt),
        };
        let Some(delay) = delay else {
            self.set_status(ConnectionStatus::Disconnected);
            return false;
        };

        self.set_status(ConnectionStatus::Reconnecting);
        info!("[{}] Reconnecting in {:?} (attempt {})", self.kind, delay, attempt);
        self.emit(
            EventName::Reconnecting,
            EventPayload::Reconnecting { attempt, delay },
        );

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            reconnect();
        });
        if let Some(previous) = self.reconnect_timer.lock().replace(handle) {
            previous.abort();
        }
        true
    }

    /// Drop a pending reconnect timer
    pub fn cancel_reconnect(&self) {
        if let Some(timer) = self.reconnect_timer.lock().take() {
            timer.abort();
        }
    }

    /// Explicit stop: no reconnection until the next `connect`
    ///
    /// Returns the status before stopping.
    pub fn stop(&self) -> ConnectionStatus {
        self.explicit_stop.store(true, Ordering::Release);
        self.next_generation();
        self.cancel_reconnect();
        self.stop_tasks();
        std::mem::replace(&mut self.state.lock().status, ConnectionStatus::Disconnected)
    }

    /// Mark the instance unusable; returns false if it already was
    pub fn mark_destroyed(&self) -> bool {
        !self.destroyed.swap(true, Ordering::AcqRel)
    }
}

impl Drop for AdapterCore {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
        if let Some(timer) = self.reconnect_timer.get_mut().take() {
            timer.abort();
        }
    }
}
