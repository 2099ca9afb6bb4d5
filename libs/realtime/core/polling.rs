//! Request/response polling adapter
//!
//! ```text
//! connect ──> Polling ──GET /poll──> Waiting ──interval + jitter──> Polling ...
//!                │
//!                └── 3 consecutive failures ──> Reconnecting ──backoff──> Polling
//! ```

use crate::core::adapter::AdapterCore;
use crate::core::config::{append_query, join_path, TransportConfig};
use crate::core::http::{HttpExchange, ReqwestExchange};
use crate::traits::*;
use async_trait::async_trait;
use rand::Rng;
use serde_json::Value;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Consecutive failed polls treated as a lost connection
pub const MAX_CONSECUTIVE_ERRORS: u32 = 3;

/// Upper bound of the random extra delay between polls, as a fraction
const POLL_JITTER: f64 = 0.1;

/// Polling transport
pub struct PollingTransport {
    inner: Arc<PollingInner>,
}

struct PollingInner {
    core: AdapterCore,
    http: Arc<dyn HttpExchange>,
    consecutive_errors: AtomicU32,
}

impl PollingTransport {
    pub fn new(config: TransportConfig) -> Result<Self> {
        let http = Arc::new(ReqwestExchange::new(&config)?);
        Ok(Self::with_exchange(config, http))
    }

    pub fn with_exchange(config: TransportConfig, http: Arc<dyn HttpExchange>) -> Self {
        Self {
            inner: Arc::new(PollingInner {
                core: AdapterCore::new(TransportKind::Polling, config),
                http,
                consecutive_errors: AtomicU32::new(0),
            }),
        }
    }

    fn shutdown(&self) {
        let previous = self.inner.core.stop();
        if previous != ConnectionStatus::Disconnected {
            info!("[polling] Stopped");
            self.inner.core.emit(EventName::Close, EventPayload::Empty);
        }
    }
}

impl PollingInner {
    fn endpoint(&self, path: &str, last_event_id: Option<&str>) -> Result<reqwest::Url> {
        let config = &self.core.config;
        let mut url = join_path(&config.endpoint()?, path);
        append_query(&mut url, &config.resume_query(last_event_id));
        Ok(url)
    }

    /// Enter the poll loop
    ///
    /// The attempt counter survives until a poll succeeds, so a server that
    /// keeps failing still exhausts the reconnect budget.
    fn start(self: &Arc<Self>) -> Result<()> {
        self.core.config.endpoint()?;
        let generation = self.core.next_generation();
        self.core.stop_tasks();
        self.consecutive_errors.store(0, Ordering::Release);

        let was_reconnect = self.core.state().reconnect_attempts > 0;
        self.core.set_status(ConnectionStatus::Polling);
        info!("[polling] Polling {}", self.core.config.url);

        self.core.emit(EventName::Open, EventPayload::Empty);
        if was_reconnect {
            self.core.emit(EventName::Reconnected, EventPayload::Empty);
        }

        let handle = tokio::spawn(poll_loop(Arc::downgrade(self), generation));
        self.core.track(handle);
        Ok(())
    }

    fn restart(self: &Arc<Self>) {
        if self.core.is_destroyed() || self.core.is_stopped() {
            return;
        }
        if let Err(e) = self.start() {
            self.core.emit_error(e);
            self.core.set_status(ConnectionStatus::Disconnected);
        }
    }

    fn poll_succeeded(&self, elapsed: Duration, body: Value) {
        if self.core.config.latency_sampling {
            self.core.record_latency(elapsed.as_millis() as u64);
        }
        self.consecutive_errors.store(0, Ordering::Release);
        self.core.reset_attempts();

        let records = match body {
            Value::Null => Vec::new(),
            Value::Array(items) => items,
            single => vec![single],
        };
        for record in records {
            match Message::from_value(record) {
                Ok(message) => self.core.deliver(message),
                Err(e) => self.core.emit_error(e),
            }
        }
    }

    /// Count a failed exchange; false once the failure ended the loop
    fn exchange_failed(self: &Arc<Self>, generation: u64, error: TransportError) -> bool {
        let failures = self.consecutive_errors.fetch_add(1, Ordering::AcqRel) + 1;
        self.core.emit_error(error);
        if failures < MAX_CONSECUTIVE_ERRORS {
            return true;
        }

        debug!("[polling] {} consecutive failures, treating as disconnect", failures);
        let weak = Arc::downgrade(self);
        self.core.handle_connection_loss(generation, true, move || {
            if let Some(inner) = weak.upgrade() {
                inner.restart();
            }
        });
        false
    }

    fn next_delay(&self) -> Duration {
        let interval = self.core.config.polling_interval;
        let jitter: f64 = rand::thread_rng().gen::<f64>() * POLL_JITTER;
        interval + interval.mul_f64(jitter)
    }
}

async fn poll_loop(inner: Weak<PollingInner>, generation: u64) {
    loop {
        let (http, url, headers, timeout) = {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            if !inner.core.is_current(generation) {
                return;
            }
            inner.core.set_status(ConnectionStatus::Polling);
            let last_event_id = inner.core.last_event_id();
            let url = match inner.endpoint("poll", last_event_id.as_deref()) {
                Ok(url) => url,
                Err(e) => {
                    inner.core.emit_error(e);
                    return;
                }
            };
            let config = &inner.core.config;
            (
                Arc::clone(&inner.http),
                url,
                config.headers.clone(),
                config.request_timeout,
            )
        };

        let started = Instant::now();
        let outcome = tokio::time::timeout(timeout, http.get_json(&url, &[], &headers, timeout))
            .await
            .unwrap_or(Err(TransportError::Timeout(timeout)));

        let delay = {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            if !inner.core.is_current(generation) {
                return;
            }
            match outcome {
                Ok(body) => inner.poll_succeeded(started.elapsed(), body),
                Err(e) => {
                    if !inner.exchange_failed(generation, e) {
                        return;
                    }
                }
            }
            if !inner.core.is_current(generation) {
                return;
            }
            inner.core.set_status(ConnectionStatus::Waiting);
            inner.next_delay()
        };

        tokio::time::sleep(delay).await;
    }
}

#[async_trait]
impl Transport for PollingTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Polling
    }

    fn connect(&self) -> Result<()> {
        let core = &self.inner.core;
        core.begin_connect()?;
        match core.status() {
            ConnectionStatus::Polling | ConnectionStatus::Waiting => return Ok(()),
            _ => {}
        }
        core.cancel_reconnect();
        self.inner.start()
    }

    fn disconnect(&self) {
        self.shutdown();
    }

    fn destroy(&self) {
        if !self.inner.core.mark_destroyed() {
            return;
        }
        self.shutdown();
        self.inner.core.clear_handlers();
    }

    async fn send(&self, mut message: Message) -> Result<()> {
        let inner = &self.inner;
        if inner.core.is_destroyed() {
            return Err(TransportError::Destroyed);
        }
        if !matches!(
            inner.core.status(),
            ConnectionStatus::Polling | ConnectionStatus::Waiting
        ) {
            return Err(TransportError::NotConnected);
        }

        message.stamp();
        let body = message.to_value()?;
        let url = inner.endpoint("send", None)?;
        let generation = inner.core.generation();
        let config = &inner.core.config;

        let result = inner
            .http
            .post_json(&url, &body, &config.headers, config.request_timeout)
            .await;
        if let Err(e) = &result {
            if inner.core.is_current(generation) {
                inner.exchange_failed(generation, e.clone());
            }
        }
        result
    }

    fn on(&self, event: EventName, handler: Handler) -> Subscription {
        self.inner.core.on(event, handler)
    }

    fn state(&self) -> ConnectionState {
        self.inner.core.state()
    }
}
