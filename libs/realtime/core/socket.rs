//! Persistent socket adapter
//!
//! One driver task per connection owns both halves of the socket. Outbound
//! frames (application sends, heartbeat pings, close requests) reach it over
//! an unbounded channel; inbound frames are parsed and dispatched in place.

use crate::core::adapter::AdapterCore;
use crate::core::config::{append_query, TransportConfig};
use crate::core::heartbeat::spawn_ticker;
use crate::traits::*;
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, Weak};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{http, Error as WsError, Message as WsFrame};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

/// Write half of an open socket
#[async_trait]
pub trait SocketSink: Send {
    async fn send(&mut self, text: String) -> Result<()>;
    async fn close(&mut self) -> Result<()>;
}

/// Read half of an open socket
#[async_trait]
pub trait SocketStream: Send {
    /// Next text frame; `None` once the peer closed the connection
    async fn recv(&mut self) -> Option<Result<String>>;
}

/// Opens socket connections
#[async_trait]
pub trait SocketConnector: Send + Sync + Debug {
    async fn open(
        &self,
        url: &reqwest::Url,
        headers: &HashMap<String, String>,
    ) -> Result<(Box<dyn SocketSink>, Box<dyn SocketStream>)>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connector backed by tokio-tungstenite
#[derive(Debug, Default, Clone, Copy)]
pub struct TungsteniteConnector;

struct TungsteniteSink(SplitSink<WsStream, WsFrame>);

struct TungsteniteStream(SplitStream<WsStream>);

#[async_trait]
impl SocketConnector for TungsteniteConnector {
    async fn open(
        &self,
        url: &reqwest::Url,
        headers: &HashMap<String, String>,
    ) -> Result<(Box<dyn SocketSink>, Box<dyn SocketStream>)> {
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Configuration(e.to_string()))?;

        for (key, value) in headers {
            match (
                http::HeaderName::from_bytes(key.as_bytes()),
                http::HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    request.headers_mut().insert(name, value);
                }
                _ => warn!("Skipping invalid header '{}'", key),
            }
        }

        let (ws_stream, _) = connect_async(request).await.map_err(map_connect_error)?;
        let (write, read) = ws_stream.split();
        Ok((
            Box::new(TungsteniteSink(write)),
            Box::new(TungsteniteStream(read)),
        ))
    }
}

#[async_trait]
impl SocketSink for TungsteniteSink {
    async fn send(&mut self, text: String) -> Result<()> {
        self.0
            .send(WsFrame::Text(text))
            .await
            .map_err(|e| TransportError::Closed(e.to_string()))
    }

    async fn close(&mut self) -> Result<()> {
        self.0
            .close()
            .await
            .map_err(|e| TransportError::Closed(e.to_string()))
    }
}

#[async_trait]
impl SocketStream for TungsteniteStream {
    async fn recv(&mut self) -> Option<Result<String>> {
        loop {
            match self.0.next().await? {
                Ok(WsFrame::Text(text)) => return Some(Ok(text)),
                Ok(WsFrame::Binary(data)) => {
                    return Some(
                        String::from_utf8(data).map_err(|e| TransportError::Parse(e.to_string())),
                    )
                }
                Ok(WsFrame::Close(_)) => return None,
                // Protocol-level ping/pong is answered by tungstenite itself
                Ok(_) => continue,
                Err(e) => return Some(Err(TransportError::Closed(e.to_string()))),
            }
        }
    }
}

fn map_connect_error(error: WsError) -> TransportError {
    match error {
        WsError::Http(response) => TransportError::http(
            response.status().as_u16(),
            response
                .status()
                .canonical_reason()
                .unwrap_or("handshake rejected"),
        ),
        WsError::Url(e) => TransportError::Configuration(e.to_string()),
        other => TransportError::Network(other.to_string()),
    }
}

enum Outbound {
    Text(String, Option<oneshot::Sender<Result<()>>>),
    Close,
}

/// Bidirectional socket transport
pub struct SocketTransport {
    inner: Arc<SocketInner>,
}

struct SocketInner {
    core: AdapterCore,
    connector: Arc<dyn SocketConnector>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Outbound>>>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl SocketTransport {
    pub fn new(config: TransportConfig) -> Self {
        Self::with_connector(config, Arc::new(TungsteniteConnector))
    }

    pub fn with_connector(config: TransportConfig, connector: Arc<dyn SocketConnector>) -> Self {
        Self {
            inner: Arc::new(SocketInner {
                core: AdapterCore::new(TransportKind::WebSocket, config),
                connector,
                outbound: Mutex::new(None),
                driver: Mutex::new(None),
            }),
        }
    }

    /// Tear down the connection, emitting `close` if one was up
    fn shutdown(&self) {
        let inner = &self.inner;
        match inner.outbound.lock().take() {
            // Let the driver send a close frame on its own
            Some(tx) => {
                let _ = tx.send(Outbound::Close);
            }
            None => {
                if let Some(driver) = inner.driver.lock().take() {
                    driver.abort();
                }
            }
        }

        let previous = inner.core.stop();
        if previous != ConnectionStatus::Disconnected {
            info!("[websocket] Disconnected");
            inner.core.emit(EventName::Close, EventPayload::Empty);
        }
    }
}

impl SocketInner {
    fn build_url(&self) -> Result<reqwest::Url> {
        let mut url = self.core.config.endpoint()?;
        let last_event_id = self.core.last_event_id();
        append_query(&mut url, &self.core.config.resume_query(last_event_id.as_deref()));
        Ok(url)
    }

    /// Start a connection attempt
    fn open(self: &Arc<Self>) -> Result<()> {
        let url = self.build_url()?;
        let generation = self.core.next_generation();
        self.core.stop_tasks();
        *self.outbound.lock() = None;
        self.core.set_status(ConnectionStatus::Connecting);
        debug!("[websocket] Connecting to {}", self.core.config.url);

        let weak = Arc::downgrade(self);
        let connector = Arc::clone(&self.connector);
        let headers = self.core.config.headers.clone();

        let handle = tokio::spawn(async move {
            let opened = connector.open(&url, &headers).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if !inner.core.is_current(generation) {
                return;
            }

            let (sink, stream) = match opened {
                Ok(halves) => halves,
                Err(e) => {
                    inner.core.emit_error(e);
                    inner.lost(generation);
                    return;
                }
            };

            let (tx, rx) = mpsc::unbounded_channel();
            *inner.outbound.lock() = Some(tx);
            inner.opened(generation);
            drop(inner);

            let failure = drive(sink, stream, rx, &weak, generation).await;

            if let Some(inner) = weak.upgrade() {
                if !inner.core.is_current(generation) {
                    return;
                }
                *inner.outbound.lock() = None;
                if let Some(e) = failure {
                    inner.core.emit_error(e);
                }
                inner.lost(generation);
            }
        });

        if let Some(previous) = self.driver.lock().replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    fn opened(self: &Arc<Self>, generation: u64) {
        let was_reconnect = self.core.mark_connected(ConnectionStatus::Connected);
        info!("[websocket] Connected to {}", self.core.config.url);

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

    fn lost(self: &Arc<Self>, generation: u64) {
        let weak = Arc::downgrade(self);
        self.core.handle_connection_loss(generation, true, move || {
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

    fn transmit(&self, frame: Outbound) -> Result<()> {
        let tx = self.outbound.lock().clone().ok_or(TransportError::NotConnected)?;
        tx.send(frame).map_err(|_| TransportError::NotConnected)
    }

    fn heartbeat(self: &Arc<Self>, generation: u64) {
        if !self.core.is_current(generation) {
            return;
        }
        let (correlation, ping) = self.core.next_ping();
        let sent = ping
            .to_json()
            .and_then(|text| self.transmit(Outbound::Text(text, None)));
        if let Err(e) = sent {
            debug!("[websocket] Heartbeat not sent: {}", e);
            return;
        }

        let timeout = self.core.config.heartbeat_timeout;
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if inner.core.is_current(generation) && inner.core.expire_ping(correlation) {
                inner.core.emit_error(TransportError::HeartbeatTimeout(timeout));
                // Closing hands control to the connection-loss path
                let _ = inner.transmit(Outbound::Close);
            }
        });
        self.core.track(handle);
    }

    fn sample_latency(self: &Arc<Self>, generation: u64) {
        if !self.core.is_current(generation) {
            return;
        }
        let (_, ping) = self.core.next_ping();
        if let Err(e) = ping
            .to_json()
            .and_then(|text| self.transmit(Outbound::Text(text, None)))
        {
            debug!("[websocket] Latency sample skipped: {}", e);
        }
    }

    fn inbound(&self, generation: u64, text: &str) {
        if !self.core.is_current(generation) {
            return;
        }
        match Message::from_json(text) {
            Ok(message) if message.is_pong() => {
                if let Some(latency) = self.core.resolve_pong(&message) {
                    self.core.record_latency(latency);
                }
            }
            Ok(message) => self.core.deliver(message),
            Err(e) => self.core.emit_error(e),
        }
    }
}

impl Drop for SocketInner {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.get_mut().take() {
            driver.abort();
        }
    }
}

/// Pump one connection until it ends; returns the failure, if any
async fn drive(
    mut sink: Box<dyn SocketSink>,
    mut stream: Box<dyn SocketStream>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    inner: &Weak<SocketInner>,
    generation: u64,
) -> Option<TransportError> {
    loop {
        tokio::select! {
            frame = stream.recv() => match frame {
                Some(Ok(text)) => {
                    let inner = inner.upgrade()?;
                    inner.inbound(generation, &text);
                }
                Some(Err(e)) => return Some(e),
                None => {
                    debug!("[websocket] Server closed the connection");
                    return None;
                }
            },
            command = outbound.recv() => match command {
                Some(Outbound::Text(text, ack)) => {
                    let result = sink.send(text).await;
                    let failure = result.as_ref().err().cloned();
                    if let Some(ack) = ack {
                        let _ = ack.send(result);
                    }
                    if failure.is_some() {
                        return failure;
                    }
                }
                Some(Outbound::Close) | None => {
                    let _ = sink.close().await;
                    return None;
                }
            },
        }
    }
}

#[async_trait]
impl Transport for SocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
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
        let text = message.to_json()?;
        let (ack_tx, ack_rx) = oneshot::channel();
        inner.transmit(Outbound::Text(text, Some(ack_tx)))?;
        ack_rx.await.map_err(|_| TransportError::NotConnected)?
    }

    fn on(&self, event: EventName, handler: Handler) -> Subscription {
        self.inner.core.on(event, handler)
    }

    fn state(&self) -> ConnectionState {
        self.inner.core.state()
    }
}
