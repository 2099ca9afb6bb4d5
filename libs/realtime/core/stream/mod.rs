//! Server-push stream adapter
//!
//! The stream itself is receive-only. Sends and heartbeat pings are POSTed
//! to `<url>/send` and `<url>/ping`; pongs come back over the stream.

pub mod parser;
pub mod source;

pub use parser::{parse_line, LineBuffer, StreamItem, StreamLine, StreamParser};
pub use source::{
    select_stream_mode, ByteStream, HttpStreamSource, StreamMode, StreamRequest, StreamSource,
};

use crate::core::adapter::AdapterCore;
use crate::core::config::{append_query, join_path, TransportConfig};
use crate::core::heartbeat::spawn_ticker;
use crate::core::http::{HttpExchange, ReqwestExchange};
use crate::traits::*;
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Push-stream transport
pub struct PushStreamTransport {
    inner: Arc<StreamInner>,
}

struct StreamInner {
    core: AdapterCore,
    source: Arc<dyn StreamSource>,
    http: Arc<dyn HttpExchange>,
}

impl PushStreamTransport {
    pub fn new(config: TransportConfig) -> Result<Self> {
        let source = Arc::new(HttpStreamSource::new(&config)?);
        let http = Arc::new(ReqwestExchange::new(&config)?);
        Ok(Self::with_parts(config, source, http))
    }

    pub fn with_parts(
        config: TransportConfig,
        source: Arc<dyn StreamSource>,
        http: Arc<dyn HttpExchange>,
    ) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                core: AdapterCore::new(TransportKind::PushStream, config),
                source,
                http,
            }),
        }
    }

    fn shutdown(&self) {
        let previous = self.inner.core.stop();
        if previous != ConnectionStatus::Disconnected {
            info!("[push-stream] Disconnected");
            self.inner.core.emit(EventName::Close, EventPayload::Empty);
        }
    }
}

impl StreamInner {
    /// Auxiliary endpoint (`send`, `ping`) carrying the auth token
    fn aux_url(&self, path: &str) -> Result<reqwest::Url> {
        let config = &self.core.config;
        let mut url = join_path(&config.endpoint()?, path);
        append_query(&mut url, &config.resume_query(None));
        Ok(url)
    }

    fn open(self: &Arc<Self>) -> Result<()> {
        let last_event_id = self.core.last_event_id();
        let request = StreamRequest::build(&self.core.config, last_event_id.as_deref())?;
        let generation = self.core.next_generation();
        self.core.stop_tasks();
        self.core.set_status(ConnectionStatus::Connecting);
        debug!("[push-stream] Connecting to {} ({:?})", request.url, request.mode);

        let weak = Arc::downgrade(self);
        let source = Arc::clone(&self.source);

        let handle = tokio::spawn(async move {
            let opened = source.open(&request).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if !inner.core.is_current(generation) {
                return;
            }

            let body = match opened {
                Ok(body) => body,
                Err(e) => {
                    // Never opened: no close event for a connection that never was
                    inner.core.emit_error(e);
                    inner.lost(generation, false);
                    return;
                }
            };

            inner.opened(generation);
            drop(inner);

            let failure = read_stream(body, &weak, generation).await;

            if let Some(inner) = weak.upgrade() {
                if !inner.core.is_current(generation) {
                    return;
                }
                match failure {
                    Some(e) => inner.core.emit_error(e),
                    None => debug!("[push-stream] Stream ended by server"),
                }
                inner.lost(generation, true);
            }
        });
        self.core.track(handle);
        Ok(())
    }

    fn opened(self: &Arc<Self>, generation: u64) {
        let was_reconnect = self.core.mark_connected(ConnectionStatus::Connected);
        info!("[push-stream] Connected to {}", self.core.config.url);

        let config = &self.core.config;
        if config.has_heartbeat() {
            let handle = spawn_ticker(config.heartbeat_interval, Arc::downgrade(self), move |inner| {
                inner.heartbeat(generation)
            });
            self.core.track(handle);
        }
        if config.latency_sampling {
            let handle = spawn_ticker(
                config.latency_sampling_interval,
                Arc::downgrade(self),
                move |inner| inner.sample_latency(generation),
            );
            self.core.track(handle);
        }

        self.core.emit(EventName::Open, EventPayload::Empty);
        if was_reconnect {
            self.core.emit(EventName::Reconnected, EventPayload::Empty);
        }
    }

    fn lost(self: &Arc<Self>, generation: u64, emit_close: bool) {
        let weak = Arc::downgrade(self);
        self.core.handle_connection_loss(generation, emit_close, move || {
            if let Some(inner) = weak.upgrade() {
                inner.reconnect();
            }
        });
    }

    fn reconnect(self: &Arc<Self>) {
        if self.core.is_destroyed() || self.core.is_stopped() {
            return;
        }
        if let Err(e) = self.open() {
            self.core.emit_error(e);
            self.core.set_status(ConnectionStatus::Disconnected);
        }
    }

    fn handle_item(&self, generation: u64, item: StreamItem) {
        if !self.core.is_current(generation) {
            return;
        }
        match item {
            StreamItem::Message(message) if message.is_pong() => {
                if let Some(latency) = self.core.resolve_pong(&message) {
                    self.core.record_latency(latency);
                }
            }
            StreamItem::Message(message) => self.core.deliver(message),
            StreamItem::Id(id) => self.core.advance_cursor(&id),
            StreamItem::Retry(delay) => {
                debug!("[push-stream] Server requested retry delay {:?}", delay);
                self.core.set_retry_override(delay);
            }
        }
    }

    /// POST a ping in the background
    fn post_ping(self: &Arc<Self>, ping: Message) {
        let url = match self.aux_url("ping") {
            Ok(url) => url,
            Err(e) => {
                debug!("[push-stream] Ping skipped: {}", e);
                return;
            }
        };
        let body = match ping.to_value() {
            Ok(body) => body,
            Err(e) => {
                debug!("[push-stream] Ping skipped: {}", e);
                return;
            }
        };
        let http = Arc::clone(&self.http);
        let headers = self.core.config.headers.clone();
        let timeout = self.core.config.request_timeout;
        let handle = tokio::spawn(async move {
            if let Err(e) = http.post_json(&url, &body, &headers, timeout).await {
                debug!("[push-stream] Ping request failed: {}", e);
            }
        });
        self.core.track(handle);
    }

    fn heartbeat(self: &Arc<Self>, generation: u64) {
        if !self.core.is_current(generation) {
            return;
        }
        let (correlation, ping) = self.core.next_ping();
        self.post_ping(ping);

        let timeout = self.core.config.heartbeat_timeout;
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if inner.core.is_current(generation) && inner.core.expire_ping(correlation) {
                warn!("[push-stream] No pong within {:?}, closing stream", timeout);
                inner.core.emit_error(TransportError::HeartbeatTimeout(timeout));
                inner.lost(generation, true);
            }
        });
        self.core.track(handle);
    }

    fn sample_latency(self: &Arc<Self>, generation: u64) {
        if !self.core.is_current(generation) {
            return;
        }
        let (_, ping) = self.core.next_ping();
        self.post_ping(ping);
    }
}

/// Read the body until it ends; returns the failure, if any
async fn read_stream(
    mut body: ByteStream,
    inner: &Weak<StreamInner>,
    generation: u64,
) -> Option<TransportError> {
    let mut lines = LineBuffer::new();
    let mut parser = StreamParser::new();

    while let Some(chunk) = body.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => return Some(e),
        };
        let inner = inner.upgrade()?;
        for line in lines.push(&chunk) {
            if let Some(item) = parser.feed(&line) {
                inner.handle_item(generation, item);
            }
        }
    }
    None
}

#[async_trait]
impl Transport for PushStreamTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::PushStream
    }

    fn connect(&self) -> Result<()> {
        let core = &self.inner.core;
        core.begin_connect()?;
        match core.status() {
            ConnectionStatus::Connecting | ConnectionStatus::Connected => return Ok(()),
            _ => {}
        }
        core.cancel_reconnect();
        self.inner.open()
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
        if inner.core.status() != ConnectionStatus::Connected {
            return Err(TransportError::NotConnected);
        }

        message.stamp();
        let body = message.to_value()?;
        let url = inner.aux_url("send")?;
        let config = &inner.core.config;
        inner
            .http
            .post_json(&url, &body, &config.headers, config.request_timeout)
            .await
    }

    fn on(&self, event: EventName, handler: Handler) -> Subscription {
        self.inner.core.on(event, handler)
    }

    fn state(&self) -> ConnectionState {
        self.inner.core.state()
    }
}
