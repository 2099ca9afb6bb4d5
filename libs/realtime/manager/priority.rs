//! Priority-ordered transport manager
//!
//! ```text
//!   websocket ──fallback──> push-stream ──fallback──> polling ──> (give up)
//!       ^                        │                        │
//!       └──────── upgrade ───────┴──────── upgrade ───────┘
//! ```
//!
//! Consecutive failures are counted per active adapter. A fatal error, or
//! reaching `failure_threshold`, moves to the next supported transport. With
//! upgrades enabled, a timer periodically tries the best supported transport
//! above the current one, keeping the old adapter as a short-lived backup.

use crate::core::config::{millis, TransportConfig};
use crate::core::factory::{AdapterFactory, TransportFactory};
use crate::manager::relay::Relay;
use crate::traits::transport::ensure_can_send;
use crate::traits::*;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long a replaced adapter is kept after a successful upgrade
pub const UPGRADE_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Configuration for [`PriorityManager`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityConfig {
    pub socket_url: String,
    pub stream_url: String,
    pub polling_url: String,

    /// Shared settings; each adapter gets its own copy
    pub transport: TransportConfig,

    /// Consecutive errors tolerated before moving down the list
    pub failure_threshold: u32,

    pub enable_upgrade: bool,

    #[serde(with = "millis")]
    pub upgrade_interval: Duration,

    /// Start on this transport instead of the best supported one
    pub force_transport: Option<TransportKind>,

    #[serde(skip, default = "default_support")]
    pub support: Arc<dyn TransportSupport>,
}

fn default_support() -> Arc<dyn TransportSupport> {
    Arc::new(AllSupported)
}

impl Default for PriorityConfig {
    fn default() -> Self {
        Self {
            socket_url: String::new(),
            stream_url: String::new(),
            polling_url: String::new(),
            transport: TransportConfig::default(),
            failure_threshold: 3,
            enable_upgrade: false,
            upgrade_interval: Duration::from_secs(60),
            force_transport: None,
            support: default_support(),
        }
    }
}

impl PriorityConfig {
    pub fn new(
        socket_url: impl Into<String>,
        stream_url: impl Into<String>,
        polling_url: impl Into<String>,
    ) -> Self {
        Self {
            socket_url: socket_url.into(),
            stream_url: stream_url.into(),
            polling_url: polling_url.into(),
            ..Self::default()
        }
    }

    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn with_upgrade(mut self, interval: Duration) -> Self {
        self.enable_upgrade = true;
        self.upgrade_interval = interval;
        self
    }

    pub fn with_forced(mut self, kind: TransportKind) -> Self {
        self.force_transport = Some(kind);
        self
    }

    pub fn with_support(mut self, support: Arc<dyn TransportSupport>) -> Self {
        self.support = support;
        self
    }

    pub fn url_for(&self, kind: TransportKind) -> &str {
        match kind {
            TransportKind::WebSocket => &self.socket_url,
            TransportKind::PushStream => &self.stream_url,
            TransportKind::Polling => &self.polling_url,
        }
    }

    fn config_for(&self, kind: TransportKind) -> TransportConfig {
        self.transport.with_url(self.url_for(kind))
    }
}

/// Manager-level view merged with the live adapter
#[derive(Debug, Clone, PartialEq)]
pub struct PriorityState {
    pub connection: ConnectionState,
    pub active_transport: Option<TransportKind>,
    pub failure_count: u32,
    pub can_fallback: bool,
    pub transport_priority: Vec<TransportKind>,
    pub switch_reason: Option<SwitchReason>,
}

/// What happens to the outgoing adapter during a switch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Retire {
    Destroy,
    /// Keep it alive as a backup
    Keep,
}

/// N-level transport manager with fallback and optional upgrades
pub struct PriorityManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    config: PriorityConfig,
    factory: Arc<dyn TransportFactory>,
    relay: Relay,
    /// Supported kinds at construction, best first
    priority: Vec<TransportKind>,
    state: Mutex<ManagerState>,
    destroyed: AtomicBool,
    /// Bumped on every switch; listeners of older adapters ignore events
    generation: AtomicU64,
}

#[derive(Default)]
struct ManagerState {
    current: Option<Arc<dyn Transport>>,
    active: Option<TransportKind>,
    reason: Option<SwitchReason>,
    status: ConnectionStatus,
    failure_count: u32,
    reconnect_attempts: u32,
    explicit_stop: bool,
    latency: Option<u64>,
    average_latency: Option<u64>,
    last_event_id: Option<String>,
    error: Option<TransportError>,
    listeners: Vec<Subscription>,
    upgrade_timer: Option<JoinHandle<()>>,
    /// Adapters replaced by an upgrade, awaiting destruction
    backups: HashMap<u64, Backup>,
    next_backup: u64,
}

struct Backup {
    transport: Arc<dyn Transport>,
    timer: JoinHandle<()>,
}

impl PriorityManager {
    pub fn new(config: PriorityConfig) -> Self {
        Self::with_factory(config, Arc::new(AdapterFactory::new()))
    }

    pub fn with_factory(config: PriorityConfig, factory: Arc<dyn TransportFactory>) -> Self {
        let priority = config.support.supported();
        info!("Transport priority: {:?}", priority);
        let state = ManagerState {
            last_event_id: config
                .transport
                .cursor_store
                .get(&config.transport.cursor_key)
                .ok()
                .flatten(),
            ..ManagerState::default()
        };

        Self {
            inner: Arc::new(ManagerInner {
                config,
                factory,
                relay: Relay::new(),
                priority,
                state: Mutex::new(state),
                destroyed: AtomicBool::new(false),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Manual override; a no-op when `kind` is already active
    pub fn switch_transport(&self, kind: TransportKind, reason: SwitchReason) -> Result<()> {
        let inner = &self.inner;
        if inner.is_destroyed() {
            return Err(TransportError::Destroyed);
        }
        if inner.state.lock().active == Some(kind) {
            return Ok(());
        }
        if !inner.config.support.is_supported(kind) {
            return Err(TransportError::Unsupported(kind));
        }
        inner.switch_to(kind, reason, None, Retire::Destroy)
    }

    /// Manager-level view: failure count, priority list and switch reason
    /// alongside the merged connection state
    pub fn priority_state(&self) -> PriorityState {
        self.inner.snapshot()
    }

    pub fn active_transport(&self) -> Option<TransportKind> {
        self.inner.state.lock().active
    }

    pub fn transport_priority(&self) -> &[TransportKind] {
        &self.inner.priority
    }

    pub fn can_fallback(&self) -> bool {
        self.inner.priority.len() > 1
    }
}

#[async_trait]
impl Transport for PriorityManager {
    /// Active transport, or the one `connect` would start with
    fn kind(&self) -> TransportKind {
        let inner = &self.inner;
        inner
            .state
            .lock()
            .active
            .or(inner.config.force_transport)
            .or_else(|| inner.priority.first().copied())
            .unwrap_or(TransportKind::Polling)
    }

    /// Connect the best supported (or forced) transport
    ///
    /// A no-op while the active adapter is connected or still connecting.
    fn connect(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.is_destroyed() {
            return Err(TransportError::Destroyed);
        }

        let current = {
            let mut state = inner.state.lock();
            state.explicit_stop = false;
            state.current.clone()
        };
        if let Some(current) = current {
            let status = current.state().status;
            if status != ConnectionStatus::Disconnected {
                debug!("Connect ignored, {} is {:?}", current.kind(), status);
                return Ok(());
            }
        }

        let (kind, reason) = match inner.config.force_transport {
            Some(forced) => {
                if !inner.config.support.is_supported(forced) {
                    return Err(TransportError::Configuration(format!(
                        "forced transport {} is not supported",
                        forced
                    )));
                }
                (forced, SwitchReason::Forced)
            }
            None => {
                let best = inner.priority.first().copied().ok_or_else(|| {
                    TransportError::Configuration("no supported transport available".into())
                })?;
                (best, SwitchReason::FeatureDetection)
            }
        };

        inner.switch_to(kind, reason, None, Retire::Destroy)
    }

    /// Stop the active adapter; no fallback or upgrade until `connect`
    fn disconnect(&self) {
        let inner = &self.inner;
        let (current, timer) = {
            let mut state = inner.state.lock();
            state.explicit_stop = true;
            state.status = ConnectionStatus::Disconnected;
            (state.current.clone(), state.upgrade_timer.take())
        };
        if let Some(timer) = timer {
            timer.abort();
        }
        if let Some(current) = current {
            current.disconnect();
        }
        info!("Transport manager disconnected");
    }

    /// Tear everything down; the manager cannot be used afterwards
    fn destroy(&self) {
        let inner = &self.inner;
        if inner.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        inner.generation.fetch_add(1, Ordering::AcqRel);

        let (current, listeners, timer, backups) = {
            let mut state = inner.state.lock();
            state.status = ConnectionStatus::Disconnected;
            (
                state.current.take(),
                std::mem::take(&mut state.listeners),
                state.upgrade_timer.take(),
                std::mem::take(&mut state.backups),
            )
        };

        if let Some(timer) = timer {
            timer.abort();
        }
        for listener in listeners {
            listener.unsubscribe();
        }
        inner.relay.detach();
        if let Some(current) = current {
            current.destroy();
        }
        for (_, backup) in backups {
            backup.timer.abort();
            backup.transport.destroy();
        }
        inner.relay.clear();
        info!("Transport manager destroyed");
    }

    async fn send(&self, message: Message) -> Result<()> {
        if self.inner.is_destroyed() {
            return Err(TransportError::Destroyed);
        }
        let current = self.inner.state.lock().current.clone();
        let current = current.ok_or(TransportError::NotConnected)?;
        ensure_can_send(current.as_ref())?;
        current.send(message).await
    }

    fn supports_send(&self) -> bool {
        let current = self.inner.state.lock().current.clone();
        current.map_or(true, |t| t.supports_send())
    }

    fn on(&self, event: EventName, handler: Handler) -> Subscription {
        self.inner.relay.on(event, handler)
    }

    /// Connection state merged with the live adapter
    fn state(&self) -> ConnectionState {
        self.inner.snapshot().connection
    }

    fn is_connected(&self) -> bool {
        self.inner.state.lock().status.is_connected()
    }
}

impl Drop for PriorityManager {
    fn drop(&mut self) {
        if let Some(timer) = self.inner.state.lock().upgrade_timer.take() {
            timer.abort();
        }
    }
}

impl ManagerInner {
    #[inline]
    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Replace the active adapter with a fresh one of `kind`
    ///
    /// The new adapter is created first, so a failed creation leaves the
    /// current one untouched. Then the old adapter loses its subscriptions
    /// and is retired, the new one is subscribed, `transport_switch` is
    /// emitted and the new adapter connects.
    fn switch_to(
        self: &Arc<Self>,
        kind: TransportKind,
        reason: SwitchReason,
        error: Option<TransportError>,
        retire: Retire,
    ) -> Result<()> {
        let next = self.factory.create(kind, self.config.config_for(kind))?;
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;

        let (previous, listeners, from) = {
            let mut state = self.state.lock();
            let from = state.active;
            state.active = Some(kind);
            state.reason = Some(reason);
            state.failure_count = 0;
            state.reconnect_attempts = 0;
            state.status = ConnectionStatus::Connecting;
            (
                state.current.replace(Arc::clone(&next)),
                std::mem::take(&mut state.listeners),
                from,
            )
        };

        for listener in listeners {
            listener.unsubscribe();
        }
        self.relay.detach();
        if let Some(previous) = previous {
            if retire == Retire::Destroy {
                previous.destroy();
            }
        }

        self.relay.set_reason(Some(reason));
        self.relay.attach(Arc::clone(&next));
        let listeners = self.install_listeners(&next, generation);
        self.state.lock().listeners = listeners;

        match from {
            Some(from) => info!("Switching transport {} -> {} ({})", from, kind, reason),
            None => info!("Starting with {} ({})", kind, reason),
        }
        self.relay.emit(
            Event::new(
                EventName::TransportSwitch,
                EventPayload::TransportSwitch {
                    from,
                    to: kind,
                    reason,
                    error,
                },
            )
            .from_transport(kind),
        );

        next.connect()
    }

    fn install_listeners(
        self: &Arc<Self>,
        transport: &Arc<dyn Transport>,
        generation: u64,
    ) -> Vec<Subscription> {
        const WATCHED: [EventName; 7] = [
            EventName::Open,
            EventName::Error,
            EventName::Close,
            EventName::Reconnecting,
            EventName::Reconnected,
            EventName::Latency,
            EventName::Message,
        ];

        WATCHED
            .iter()
            .map(|name| {
                let weak: Weak<Self> = Arc::downgrade(self);
                transport.on(
                    name.clone(),
                    handler(move |event| {
                        if let Some(inner) = weak.upgrade() {
                            inner.observe(generation, event);
                        }
                    }),
                )
            })
            .collect()
    }

    fn observe(self: &Arc<Self>, generation: u64, event: &Event) {
        if self.generation.load(Ordering::Acquire) != generation || self.is_destroyed() {
            return;
        }

        match (&event.name, &event.payload) {
            (EventName::Open, _) => {
                {
                    let mut state = self.state.lock();
                    state.failure_count = 0;
                    state.reconnect_attempts = 0;
                    state.error = None;
                    state.status = ConnectionStatus::Connected;
                }
                self.arm_upgrade();
            }
            (EventName::Error, EventPayload::Error(error)) => {
                let (failures, fatal) = {
                    let mut state = self.state.lock();
                    state.failure_count += 1;
                    state.error = Some(error.clone());
                    (state.failure_count, error.is_fatal())
                };
                if fatal || failures >= self.config.failure_threshold {
                    debug!(
                        "Escalating after {} failure(s) (fatal: {}): {}",
                        failures, fatal, error
                    );
                    self.attempt_fallback(Some(error.clone()));
                }
            }
            (EventName::Close, _) => {
                let (explicit, failures, current) = {
                    let state = self.state.lock();
                    (state.explicit_stop, state.failure_count, state.current.clone())
                };
                if explicit {
                    return;
                }
                let gave_up = current
                    .map(|t| t.state().status == ConnectionStatus::Disconnected)
                    .unwrap_or(true);
                if gave_up || failures >= self.config.failure_threshold {
                    self.attempt_fallback(None);
                } else {
                    self.state.lock().status = ConnectionStatus::Reconnecting;
                }
            }
            (EventName::Reconnecting, EventPayload::Reconnecting { attempt, .. }) => {
                let mut state = self.state.lock();
                state.status = ConnectionStatus::Reconnecting;
                state.reconnect_attempts = *attempt;
            }
            (EventName::Reconnected, _) => {
                let mut state = self.state.lock();
                state.status = ConnectionStatus::Connected;
                state.reconnect_attempts = 0;
            }
            (EventName::Latency, EventPayload::Latency { latency }) => {
                self.state.lock().latency = Some(*latency);
            }
            (EventName::Message, EventPayload::Message(message)) => {
                if let Some(id) = &message.id {
                    self.state.lock().last_event_id = Some(id.clone());
                }
            }
            _ => {}
        }
    }

    /// Move to the next supported transport after the current one
    fn attempt_fallback(self: &Arc<Self>, error: Option<TransportError>) {
        let current_kind = {
            let state = self.state.lock();
            if state.explicit_stop {
                return;
            }
            state.active
        };
        if self.is_destroyed() {
            return;
        }

        let candidates: Vec<TransportKind> = self
            .priority
            .iter()
            .copied()
            .filter(|kind| current_kind.map_or(true, |current| kind.rank() > current.rank()))
            .collect();

        for kind in candidates {
            if let Some(backup) = self.take_backup(kind) {
                info!("Falling back to retained {} adapter", kind);
                self.restore(backup, SwitchReason::Fallback, error.clone());
                return;
            }
            match self.switch_to(kind, SwitchReason::Fallback, error.clone(), Retire::Destroy) {
                Ok(()) => return,
                Err(e) => warn!("Fallback to {} failed: {}", kind, e),
            }
        }

        self.give_up();
    }

    /// No transport left: settle disconnected and tell consumers
    fn give_up(self: &Arc<Self>) {
        warn!("No transport left to fall back to");
        self.generation.fetch_add(1, Ordering::AcqRel);
        let (current, listeners, timer) = {
            let mut state = self.state.lock();
            state.status = ConnectionStatus::Disconnected;
            (
                state.current.take(),
                std::mem::take(&mut state.listeners),
                state.upgrade_timer.take(),
            )
        };
        if let Some(timer) = timer {
            timer.abort();
        }
        for listener in listeners {
            listener.unsubscribe();
        }
        self.relay.detach();
        let kind = current.as_ref().map(|t| t.kind());
        if let Some(current) = current {
            current.destroy();
        }

        let mut close = Event::new(EventName::Close, EventPayload::Empty);
        close.transport = kind;
        self.relay.emit(close);
    }

    /// Start the upgrade loop unless it already runs
    fn arm_upgrade(self: &Arc<Self>) {
        if !self.config.enable_upgrade {
            return;
        }
        let mut state = self.state.lock();
        if state.upgrade_timer.is_some() {
            return;
        }

        let interval = self.config.upgrade_interval;
        let weak = Arc::downgrade(self);
        state.upgrade_timer = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                match weak.upgrade() {
                    Some(inner) if !inner.is_destroyed() => inner.attempt_upgrade(),
                    _ => break,
                }
            }
        }));
        debug!("Upgrade checks every {:?}", interval);
    }

    /// Try the best supported transport above the current one
    fn attempt_upgrade(self: &Arc<Self>) {
        let (current_kind, backup, connected) = {
            let state = self.state.lock();
            (state.active, state.current.clone(), state.status.is_connected())
        };
        let (Some(current_kind), Some(backup)) = (current_kind, backup) else {
            return;
        };
        if !connected {
            return;
        }

        let candidate = TransportKind::PRIORITY
            .into_iter()
            .filter(|kind| kind.rank() < current_kind.rank())
            .find(|kind| self.config.support.is_supported(*kind));
        let Some(kind) = candidate else {
            return;
        };

        info!("Attempting upgrade {} -> {}", current_kind, kind);
        let reason = self.state.lock().reason;
        match self.switch_to(kind, SwitchReason::Upgrade, None, Retire::Keep) {
            Ok(()) => self.retain_backup(backup),
            Err(e) => {
                warn!("Upgrade to {} failed: {}, keeping {}", kind, e, current_kind);
                // Creation failures leave the backup in place
                let replaced = self
                    .state
                    .lock()
                    .current
                    .as_ref()
                    .map_or(false, |current| !Arc::ptr_eq(current, &backup));
                if replaced {
                    self.restore(backup, reason.unwrap_or(SwitchReason::Fallback), Some(e));
                }
            }
        }
    }

    /// Keep a replaced adapter for the grace period, then destroy it
    fn retain_backup(self: &Arc<Self>, transport: Arc<dyn Transport>) {
        let weak = Arc::downgrade(self);
        let mut state = self.state.lock();
        let id = state.next_backup;
        state.next_backup += 1;

        let timer = tokio::spawn(async move {
            tokio::time::sleep(UPGRADE_GRACE_PERIOD).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let backup = inner.state.lock().backups.remove(&id);
            if let Some(backup) = backup {
                debug!("Grace period over, destroying {} backup", backup.transport.kind());
                backup.transport.destroy();
            }
        });
        state.backups.insert(id, Backup { transport, timer });
    }

    fn take_backup(&self, kind: TransportKind) -> Option<Arc<dyn Transport>> {
        let mut state = self.state.lock();
        let id = state
            .backups
            .iter()
            .find(|(_, backup)| backup.transport.kind() == kind)
            .map(|(id, _)| *id)?;
        let backup = state.backups.remove(&id)?;
        backup.timer.abort();
        Some(backup.transport)
    }

    /// Make a retained adapter current again without recreating it
    fn restore(
        self: &Arc<Self>,
        transport: Arc<dyn Transport>,
        reason: SwitchReason,
        error: Option<TransportError>,
    ) {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let kind = transport.kind();
        let live = transport.state();

        let (failed, listeners, from) = {
            let mut state = self.state.lock();
            let from = state.active;
            state.active = Some(kind);
            state.reason = Some(reason);
            state.failure_count = 0;
            state.status = if live.status.is_connected() {
                ConnectionStatus::Connected
            } else {
                live.status
            };
            (
                state.current.replace(Arc::clone(&transport)),
                std::mem::take(&mut state.listeners),
                from,
            )
        };

        for listener in listeners {
            listener.unsubscribe();
        }
        self.relay.detach();
        if let Some(failed) = failed {
            if !Arc::ptr_eq(&failed, &transport) {
                failed.destroy();
            }
        }

        self.relay.set_reason(Some(reason));
        self.relay.attach(Arc::clone(&transport));
        let listeners = self.install_listeners(&transport, generation);
        self.state.lock().listeners = listeners;

        self.relay.emit(
            Event::new(
                EventName::TransportSwitch,
                EventPayload::TransportSwitch {
                    from,
                    to: kind,
                    reason,
                    error,
                },
            )
            .from_transport(kind),
        );

        if !live.status.is_connected() {
            if let Err(e) = transport.connect() {
                warn!("Restored {} adapter failed to connect: {}", kind, e);
            }
        }
    }

    /// Merge manager state with the live adapter's
    fn snapshot(&self) -> PriorityState {
        let (mut connection, active, failure_count, reason, current) = {
            let state = self.state.lock();
            (
                ConnectionState {
                    status: state.status,
                    reconnect_attempts: state.reconnect_attempts,
                    latency: state.latency,
                    average_latency: state.average_latency,
                    error: state.error.clone(),
                    last_event_id: state.last_event_id.clone(),
                },
                state.active,
                state.failure_count,
                state.reason,
                state.current.clone(),
            )
        };

        // A misbehaving adapter must not break the merged view
        let live = current.and_then(|t| catch_unwind(AssertUnwindSafe(|| t.state())).ok());
        if let Some(live) = live {
            connection.latency = live.latency.or(connection.latency);
            connection.average_latency = live.average_latency.or(connection.average_latency);
            connection.last_event_id = live.last_event_id.or(connection.last_event_id);
        }

        PriorityState {
            connection,
            active_transport: active,
            failure_count,
            can_fallback: self.priority.len() > 1,
            transport_priority: self.priority.clone(),
            switch_reason: reason,
        }
    }
}
