//! Two-level fallback: push stream first, polling once it proves unusable
//!
//! The switch happens at most once per instance and is never undone.

use crate::core::config::TransportConfig;
use crate::core::factory::{AdapterFactory, TransportFactory};
use crate::manager::relay::Relay;
use crate::traits::transport::ensure_can_send;
use crate::traits::*;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

const PRIMARY: TransportKind = TransportKind::PushStream;
const SECONDARY: TransportKind = TransportKind::Polling;

/// Configuration for [`TwoLevelFallback`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    /// Push-stream endpoint
    pub stream_url: String,
    /// Polling endpoint
    pub polling_url: String,
    /// Shared settings; each adapter gets its own copy
    pub transport: TransportConfig,
    /// Switch to polling by itself on a fatal error
    pub auto_fallback: bool,
    /// Skip the push stream entirely
    pub force_secondary: bool,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            stream_url: String::new(),
            polling_url: String::new(),
            transport: TransportConfig::default(),
            auto_fallback: true,
            force_secondary: false,
        }
    }
}

impl FallbackConfig {
    pub fn new(stream_url: impl Into<String>, polling_url: impl Into<String>) -> Self {
        Self {
            stream_url: stream_url.into(),
            polling_url: polling_url.into(),
            ..Self::default()
        }
    }

    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_auto_fallback(mut self, enabled: bool) -> Self {
        self.auto_fallback = enabled;
        self
    }

    pub fn with_force_secondary(mut self, forced: bool) -> Self {
        self.force_secondary = forced;
        self
    }

    fn config_for(&self, kind: TransportKind) -> TransportConfig {
        let url = match kind {
            TransportKind::PushStream => &self.stream_url,
            _ => &self.polling_url,
        };
        self.transport.with_url(url.clone())
    }
}

/// Push stream with a one-time, irreversible fallback to polling
pub struct TwoLevelFallback {
    inner: Arc<FallbackInner>,
}

struct FallbackInner {
    config: FallbackConfig,
    factory: Arc<dyn TransportFactory>,
    relay: Relay,
    state: Mutex<FallbackState>,
    destroyed: AtomicBool,
    generation: AtomicU64,
}

#[derive(Default)]
struct FallbackState {
    current: Option<Arc<dyn Transport>>,
    fallback_attempted: bool,
    watcher: Option<Subscription>,
}

impl TwoLevelFallback {
    pub fn new(config: FallbackConfig) -> Self {
        Self::with_factory(config, Arc::new(AdapterFactory::new()))
    }

    pub fn with_factory(config: FallbackConfig, factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            inner: Arc::new(FallbackInner {
                config,
                factory,
                relay: Relay::new(),
                state: Mutex::new(FallbackState::default()),
                destroyed: AtomicBool::new(false),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Kind of the adapter currently in use
    pub fn active_kind(&self) -> Option<TransportKind> {
        self.inner.state.lock().current.as_ref().map(|t| t.kind())
    }

    /// Whether the switch to polling already happened
    pub fn fallback_attempted(&self) -> bool {
        self.inner.state.lock().fallback_attempted
    }
}

#[async_trait]
impl Transport for TwoLevelFallback {
    /// Active adapter's kind, or the one `connect` would start with
    fn kind(&self) -> TransportKind {
        let state = self.inner.state.lock();
        match &state.current {
            Some(current) => current.kind(),
            None if self.inner.config.force_secondary || state.fallback_attempted => SECONDARY,
            None => PRIMARY,
        }
    }

    /// Connect the primary, or the secondary once the primary was given up
    fn connect(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.destroyed.load(Ordering::Acquire) {
            return Err(TransportError::Destroyed);
        }

        let (current, use_secondary) = {
            let state = inner.state.lock();
            (
                state.current.clone(),
                inner.config.force_secondary || state.fallback_attempted,
            )
        };
        if let Some(current) = current {
            return current.connect();
        }

        if use_secondary {
            return inner.activate(SECONDARY);
        }

        let primary = match inner.create(PRIMARY) {
            Ok(primary) => primary,
            Err(e) if inner.config.auto_fallback => {
                warn!("[fallback] Primary unavailable ({}), using {}", e, SECONDARY);
                return inner.fall_back_now();
            }
            Err(e) => {
                warn!("[fallback] Primary creation failed ({}), retrying once", e);
                inner.create(PRIMARY)?
            }
        };
        inner.install_primary(primary)
    }

    async fn send(&self, message: Message) -> Result<()> {
        let current = self.inner.state.lock().current.clone();
        let current = current.ok_or(TransportError::NotConnected)?;
        ensure_can_send(current.as_ref())?;
        current.send(message).await
    }

    /// State of the active adapter
    fn state(&self) -> ConnectionState {
        let current = self.inner.state.lock().current.clone();
        current.map(|t| t.state()).unwrap_or_default()
    }

    fn on(&self, event: EventName, handler: Handler) -> Subscription {
        self.inner.relay.on(event, handler)
    }

    fn disconnect(&self) {
        let current = self.inner.state.lock().current.clone();
        if let Some(current) = current {
            current.disconnect();
        }
    }

    fn destroy(&self) {
        let inner = &self.inner;
        if inner.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        inner.generation.fetch_add(1, Ordering::AcqRel);
        let (current, watcher) = {
            let mut state = inner.state.lock();
            (state.current.take(), state.watcher.take())
        };
        if let Some(watcher) = watcher {
            watcher.unsubscribe();
        }
        inner.relay.detach();
        if let Some(current) = current {
            current.destroy();
        }
        inner.relay.clear();
        info!("[fallback] Destroyed");
    }

    fn supports_send(&self) -> bool {
        let current = self.inner.state.lock().current.clone();
        current.map_or(true, |t| t.supports_send())
    }
}

impl FallbackInner {
    fn create(&self, kind: TransportKind) -> Result<Arc<dyn Transport>> {
        self.factory.create(kind, self.config.config_for(kind))
    }

    /// Make `primary` current, watch it for fatal errors and connect it
    fn install_primary(self: &Arc<Self>, primary: Arc<dyn Transport>) -> Result<()> {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.relay.attach(Arc::clone(&primary));

        let watcher = self.config.auto_fallback.then(|| {
            let weak = Arc::downgrade(self);
            primary.on(
                EventName::Error,
                handler(move |event| {
                    let Some(inner) = weak.upgrade() else {
                        return;
                    };
                    match event.error() {
                        Some(error) if error.is_fatal() => inner.on_fatal(generation, error),
                        _ => {}
                    }
                }),
            )
        });

        {
            let mut state = self.state.lock();
            state.current = Some(Arc::clone(&primary));
            state.watcher = watcher;
        }
        info!("[fallback] Using {}", PRIMARY);

        match primary.connect() {
            Ok(()) => Ok(()),
            Err(e) if self.config.auto_fallback => {
                warn!("[fallback] Primary failed to start ({}), using {}", e, SECONDARY);
                self.fall_back_now()
            }
            Err(e) => Err(e),
        }
    }

    fn on_fatal(self: &Arc<Self>, generation: u64, error: &TransportError) {
        if self.generation.load(Ordering::Acquire) != generation
            || self.destroyed.load(Ordering::Acquire)
        {
            return;
        }
        warn!("[fallback] Fatal {} error: {}", PRIMARY, error);
        if let Err(e) = self.fall_back_now() {
            self.relay
                .emit(Event::new(EventName::Error, EventPayload::Error(e)).from_transport(SECONDARY));
        }
    }

    /// Irreversibly replace the primary with the secondary
    fn fall_back_now(self: &Arc<Self>) -> Result<()> {
        let (primary, watcher) = {
            let mut state = self.state.lock();
            if state.fallback_attempted {
                return Ok(());
            }
            state.fallback_attempted = true;
            (state.current.take(), state.watcher.take())
        };
        self.generation.fetch_add(1, Ordering::AcqRel);

        if let Some(watcher) = watcher {
            watcher.unsubscribe();
        }
        self.relay.detach();
        if let Some(primary) = primary {
            primary.destroy();
        }

        let secondary = self.create(SECONDARY)?;
        self.relay.attach(Arc::clone(&secondary));
        self.state.lock().current = Some(Arc::clone(&secondary));

        info!("[fallback] Switched {} -> {}", PRIMARY, SECONDARY);
        self.relay.emit(
            Event::new(
                EventName::Fallback,
                EventPayload::Fallback {
                    from: PRIMARY,
                    to: SECONDARY,
                },
            )
            .from_transport(SECONDARY),
        );
        secondary.connect()
    }

    /// Connect straight to `kind` without any fallback watching
    fn activate(self: &Arc<Self>, kind: TransportKind) -> Result<()> {
        let transport = self.create(kind)?;
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.relay.attach(Arc::clone(&transport));
        self.state.lock().current = Some(Arc::clone(&transport));
        info!("[fallback] Using {}", kind);
        transport.connect()
    }
}
