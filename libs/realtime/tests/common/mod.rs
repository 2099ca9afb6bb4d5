//! Common test utilities for realtime integration tests
//!
//! Scripted stand-ins for the network seams (socket connector, stream
//! source, HTTP exchange) plus a mock transport and factory for the
//! orchestrators.

#![allow(dead_code)]

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use parking_lot::Mutex;
use realtime::core::{
    ByteStream, HttpExchange, SocketConnector, SocketSink, SocketStream, StreamRequest,
    StreamSource,
};
use realtime::*;
use reqwest::Url;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// Macro for verbose test output (controlled by TEST_VERBOSE env var)
#[macro_export]
macro_rules! verbose_println {
    ($($arg:tt)*) => {
        if std::env::var("TEST_VERBOSE").is_ok() {
            println!($($arg)*);
        }
    };
}

/// Let spawned tasks run without advancing the paused clock much
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

/// Advance the paused clock by `duration`, letting tasks run on the way
pub async fn advance(duration: Duration) {
    settle().await;
    tokio::time::sleep(duration).await;
    settle().await;
}

// ============================================================================
// Event recording
// ============================================================================

/// Records every event delivered to its handler
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<Event>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handler(&self) -> Handler {
        let events = Arc::clone(&self.events);
        handler(move |event| events.lock().push(event.clone()))
    }

    /// Subscribe to `names` through any `on`-style registration function
    pub fn attach<F>(&self, names: &[&str], mut on: F)
    where
        F: FnMut(EventName, Handler) -> Subscription,
    {
        let handler = self.handler();
        for name in names {
            let _ = on(EventName::from(*name), Arc::clone(&handler));
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .map(|e| e.name.as_str().to_string())
            .collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.name.as_str() == name)
            .count()
    }

    pub fn last(&self, name: &str) -> Option<Event> {
        self.events
            .lock()
            .iter()
            .rev()
            .find(|e| e.name.as_str() == name)
            .cloned()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

pub const LIFECYCLE: [&str; 9] = [
    "open",
    "close",
    "error",
    "message",
    "reconnecting",
    "reconnected",
    "latency",
    "transport_switch",
    "fallback",
];

// ============================================================================
// Socket seam
// ============================================================================

/// Outcome of the next `open` on a [`ScriptedConnector`]
pub enum SocketScript {
    Accept,
    Fail(TransportError),
}

/// Server side of one accepted socket connection
#[derive(Clone)]
pub struct ServerSide {
    inbound: mpsc::UnboundedSender<Result<String>>,
    pub sent: Arc<Mutex<Vec<String>>>,
}

impl ServerSide {
    /// Deliver a text frame to the client
    pub fn push(&self, text: impl Into<String>) {
        let _ = self.inbound.unbounded_send(Ok(text.into()));
    }

    pub fn push_json(&self, value: Value) {
        self.push(value.to_string());
    }

    /// Fail the read half
    pub fn fail(&self, error: TransportError) {
        let _ = self.inbound.unbounded_send(Err(error));
    }

    /// Close the connection from the server side
    pub fn close(&self) {
        self.inbound.close_channel();
    }

    /// Frames written by the client, decoded
    pub fn sent_messages(&self) -> Vec<Message> {
        self.sent
            .lock()
            .iter()
            .filter_map(|text| Message::from_json(text).ok())
            .collect()
    }
}

/// Socket connector driven by the test
#[derive(Debug, Default)]
pub struct ScriptedConnector {
    scripts: Mutex<VecDeque<SocketScriptSlot>>,
    connections: Mutex<Vec<ServerSideSlot>>,
    urls: Mutex<Vec<Url>>,
}

#[derive(Debug)]
struct SocketScriptSlot(Option<TransportError>);

struct ServerSideSlot(ServerSide);

impl std::fmt::Debug for ServerSideSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ServerSide")
    }
}

impl ScriptedConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue the outcome of a future `open`; unscripted opens are accepted
    pub fn script(&self, script: SocketScript) {
        let slot = match script {
            SocketScript::Accept => SocketScriptSlot(None),
            SocketScript::Fail(e) => SocketScriptSlot(Some(e)),
        };
        self.scripts.lock().push_back(slot);
    }

    pub fn connection(&self, index: usize) -> ServerSide {
        self.connections.lock()[index].0.clone()
    }

    pub fn latest(&self) -> ServerSide {
        let connections = self.connections.lock();
        connections[connections.len() - 1].0.clone()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn urls(&self) -> Vec<Url> {
        self.urls.lock().clone()
    }

    pub fn open_count(&self) -> usize {
        self.urls.lock().len()
    }
}

struct ScriptedSink(Arc<Mutex<Vec<String>>>);

struct ScriptedStream(mpsc::UnboundedReceiver<Result<String>>);

#[async_trait]
impl SocketSink for ScriptedSink {
    async fn send(&mut self, text: String) -> Result<()> {
        self.0.lock().push(text);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl SocketStream for ScriptedStream {
    async fn recv(&mut self) -> Option<Result<String>> {
        self.0.next().await
    }
}

#[async_trait]
impl SocketConnector for ScriptedConnector {
    async fn open(
        &self,
        url: &Url,
        _headers: &HashMap<String, String>,
    ) -> Result<(Box<dyn SocketSink>, Box<dyn SocketStream>)> {
        self.urls.lock().push(url.clone());
        if let Some(SocketScriptSlot(Some(error))) = self.scripts.lock().pop_front() {
            return Err(error);
        }

        let (tx, rx) = mpsc::unbounded();
        let sent = Arc::new(Mutex::new(Vec::new()));
        self.connections.lock().push(ServerSideSlot(ServerSide {
            inbound: tx,
            sent: Arc::clone(&sent),
        }));
        Ok((Box::new(ScriptedSink(sent)), Box::new(ScriptedStream(rx))))
    }
}

// ============================================================================
// Push-stream seam
// ============================================================================

/// Server side of one open event stream
#[derive(Clone)]
pub struct StreamFeed {
    tx: mpsc::UnboundedSender<Result<Vec<u8>>>,
}

impl StreamFeed {
    /// Send raw stream text (lines must end with `\n`)
    pub fn write(&self, text: &str) {
        let _ = self.tx.unbounded_send(Ok(text.as_bytes().to_vec()));
    }

    /// Send one `data:` event with an optional id
    pub fn event(&self, id: Option<&str>, data: Value) {
        let mut text = String::new();
        if let Some(id) = id {
            text.push_str(&format!("id: {}\n", id));
        }
        text.push_str(&format!("data: {}\n\n", data));
        self.write(&text);
    }

    pub fn fail(&self, error: TransportError) {
        let _ = self.tx.unbounded_send(Err(error));
    }

    /// End the stream normally
    pub fn end(&self) {
        self.tx.close_channel();
    }
}

/// Stream source driven by the test
#[derive(Debug, Default)]
pub struct ScriptedStreamSource {
    failures: Mutex<VecDeque<TransportError>>,
    always_fail: Mutex<Option<TransportError>>,
    feeds: Mutex<Vec<FeedSlot>>,
    requests: Mutex<Vec<StreamRequest>>,
}

struct FeedSlot(StreamFeed);

impl std::fmt::Debug for FeedSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StreamFeed")
    }
}

impl ScriptedStreamSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next `open` with `error`
    pub fn fail_next(&self, error: TransportError) {
        self.failures.lock().push_back(error);
    }

    /// Fail every `open` with `error`
    pub fn fail_always(&self, error: TransportError) {
        *self.always_fail.lock() = Some(error);
    }

    pub fn latest(&self) -> StreamFeed {
        let feeds = self.feeds.lock();
        feeds[feeds.len() - 1].0.clone()
    }

    pub fn feed_count(&self) -> usize {
        self.feeds.lock().len()
    }

    pub fn requests(&self) -> Vec<StreamRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl StreamSource for ScriptedStreamSource {
    async fn open(&self, request: &StreamRequest) -> Result<ByteStream> {
        self.requests.lock().push(request.clone());
        if let Some(error) = self.always_fail.lock().clone() {
            return Err(error);
        }
        if let Some(error) = self.failures.lock().pop_front() {
            return Err(error);
        }

        let (tx, rx) = mpsc::unbounded();
        self.feeds.lock().push(FeedSlot(StreamFeed { tx }));
        Ok(rx.boxed())
    }
}

// ============================================================================
// HTTP seam
// ============================================================================

/// HTTP exchange answering from scripts
///
/// Polls pop queued responses first and fall back to the default response.
#[derive(Debug)]
pub struct ScriptedHttp {
    polls: Mutex<VecDeque<Result<Value>>>,
    default_poll: Mutex<Result<Value>>,
    post_result: Mutex<Result<()>>,
    gets: Mutex<Vec<Url>>,
    posts: Mutex<Vec<(Url, Value)>>,
}

impl Default for ScriptedHttp {
    fn default() -> Self {
        Self {
            polls: Mutex::new(VecDeque::new()),
            default_poll: Mutex::new(Ok(Value::Null)),
            post_result: Mutex::new(Ok(())),
            gets: Mutex::new(Vec::new()),
            posts: Mutex::new(Vec::new()),
        }
    }
}

impl ScriptedHttp {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn queue_poll(&self, response: Result<Value>) {
        self.polls.lock().push_back(response);
    }

    pub fn set_default_poll(&self, response: Result<Value>) {
        *self.default_poll.lock() = response;
    }

    pub fn set_post_result(&self, result: Result<()>) {
        *self.post_result.lock() = result;
    }

    pub fn gets(&self) -> Vec<Url> {
        self.gets.lock().clone()
    }

    pub fn posts(&self) -> Vec<(Url, Value)> {
        self.posts.lock().clone()
    }

    pub fn posts_to(&self, path_suffix: &str) -> Vec<Value> {
        self.posts
            .lock()
            .iter()
            .filter(|(url, _)| url.path().ends_with(path_suffix))
            .map(|(_, body)| body.clone())
            .collect()
    }
}

#[async_trait]
impl HttpExchange for ScriptedHttp {
    async fn get_json(
        &self,
        url: &Url,
        _query: &[(&str, String)],
        _headers: &HashMap<String, String>,
        _timeout: Duration,
    ) -> Result<Value> {
        self.gets.lock().push(url.clone());
        let queued = self.polls.lock().pop_front();
        match queued {
            Some(response) => response,
            None => self.default_poll.lock().clone(),
        }
    }

    async fn post_json(
        &self,
        url: &Url,
        body: &Value,
        _headers: &HashMap<String, String>,
        _timeout: Duration,
    ) -> Result<()> {
        self.posts.lock().push((url.clone(), body.clone()));
        self.post_result.lock().clone()
    }
}

// ============================================================================
// Orchestrator seam
// ============================================================================

/// Transport whose lifecycle the test drives by hand
pub struct MockTransport {
    kind: TransportKind,
    handlers: Arc<EventHandlers>,
    state: Mutex<ConnectionState>,
    fail_connect: bool,
    auto_open: bool,
    pub connects: Mutex<u32>,
    pub destroyed: Mutex<bool>,
    pub sent: Mutex<Vec<Message>>,
}

impl MockTransport {
    pub fn new(kind: TransportKind, fail_connect: bool, auto_open: bool) -> Self {
        Self {
            kind,
            handlers: EventHandlers::new(),
            state: Mutex::new(ConnectionState::default()),
            fail_connect,
            auto_open,
            connects: Mutex::new(0),
            destroyed: Mutex::new(false),
            sent: Mutex::new(Vec::new()),
        }
    }

    fn emit(&self, name: EventName, payload: EventPayload) {
        self.handlers
            .emit(&Event::new(name, payload).from_transport(self.kind));
    }

    pub fn open(&self) {
        self.state.lock().status = ConnectionStatus::Connected;
        self.emit(EventName::Open, EventPayload::Empty);
    }

    pub fn error(&self, error: TransportError) {
        self.state.lock().error = Some(error.clone());
        self.emit(EventName::Error, EventPayload::Error(error));
    }

    /// Lose the connection; `retrying` keeps the adapter reconnecting
    pub fn close(&self, retrying: bool) {
        self.state.lock().status = if retrying {
            ConnectionStatus::Reconnecting
        } else {
            ConnectionStatus::Disconnected
        };
        self.emit(EventName::Close, EventPayload::Empty);
    }

    pub fn reconnecting(&self, attempt: u32) {
        self.emit(
            EventName::Reconnecting,
            EventPayload::Reconnecting {
                attempt,
                delay: Duration::from_secs(1),
            },
        );
    }

    pub fn message(&self, message: Message) {
        self.emit(EventName::Message, EventPayload::Message(message.clone()));
        if let Some(kind) = message.routing_type() {
            self.emit(EventName::from(kind), EventPayload::Message(message));
        }
    }

    pub fn latency(&self, latency: u64) {
        self.state.lock().latency = Some(latency);
        self.emit(EventName::Latency, EventPayload::Latency { latency });
    }

    pub fn is_destroyed(&self) -> bool {
        *self.destroyed.lock()
    }

    pub fn connect_count(&self) -> u32 {
        *self.connects.lock()
    }

    pub fn handler_count(&self, name: &str) -> usize {
        self.handlers.handler_count(&EventName::from(name))
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn connect(&self) -> Result<()> {
        if self.is_destroyed() {
            return Err(TransportError::Destroyed);
        }
        *self.connects.lock() += 1;
        if self.fail_connect {
            return Err(TransportError::Network(format!("{} refused", self.kind)));
        }
        if self.auto_open {
            self.open();
        } else {
            self.state.lock().status = ConnectionStatus::Connecting;
        }
        Ok(())
    }

    fn disconnect(&self) {
        let previous =
            std::mem::replace(&mut self.state.lock().status, ConnectionStatus::Disconnected);
        if previous != ConnectionStatus::Disconnected {
            self.emit(EventName::Close, EventPayload::Empty);
        }
    }

    fn destroy(&self) {
        if std::mem::replace(&mut *self.destroyed.lock(), true) {
            return;
        }
        self.disconnect();
        self.handlers.clear();
    }

    async fn send(&self, message: Message) -> Result<()> {
        if !self.state.lock().status.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.sent.lock().push(message);
        Ok(())
    }

    fn on(&self, event: EventName, handler: Handler) -> Subscription {
        self.handlers.add(&event, handler)
    }

    fn state(&self) -> ConnectionState {
        self.state.lock().clone()
    }
}

/// Factory producing [`MockTransport`]s and remembering them
#[derive(Default)]
pub struct MockFactory {
    fail_create: Mutex<HashSet<TransportKind>>,
    fail_connect: Mutex<HashSet<TransportKind>>,
    manual_open: Mutex<HashSet<TransportKind>>,
    created: Mutex<Vec<Arc<MockTransport>>>,
}

impl std::fmt::Debug for MockFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockFactory")
            .field("created", &self.created.lock().len())
            .finish()
    }
}

impl MockFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_create(&self, kind: TransportKind, fail: bool) {
        set_flag(&self.fail_create, kind, fail);
    }

    /// Make `connect` of future adapters of `kind` fail synchronously
    pub fn fail_connect(&self, kind: TransportKind, fail: bool) {
        set_flag(&self.fail_connect, kind, fail);
    }

    /// Adapters of `kind` wait for the test to call `open`
    pub fn manual_open(&self, kind: TransportKind) {
        set_flag(&self.manual_open, kind, true);
    }

    pub fn created(&self) -> Vec<Arc<MockTransport>> {
        self.created.lock().clone()
    }

    pub fn created_kinds(&self) -> Vec<TransportKind> {
        self.created.lock().iter().map(|t| t.kind()).collect()
    }

    pub fn latest(&self, kind: TransportKind) -> Option<Arc<MockTransport>> {
        self.created
            .lock()
            .iter()
            .rev()
            .find(|t| t.kind() == kind)
            .cloned()
    }
}

fn set_flag(set: &Mutex<HashSet<TransportKind>>, kind: TransportKind, on: bool) {
    let mut set = set.lock();
    if on {
        set.insert(kind);
    } else {
        set.remove(&kind);
    }
}

impl TransportFactory for MockFactory {
    fn create(&self, kind: TransportKind, config: TransportConfig) -> Result<Arc<dyn Transport>> {
        if self.fail_create.lock().contains(&kind) {
            return Err(TransportError::Unsupported(kind));
        }
        config.endpoint()?;
        let transport = Arc::new(MockTransport::new(
            kind,
            self.fail_connect.lock().contains(&kind),
            !self.manual_open.lock().contains(&kind),
        ));
        self.created.lock().push(Arc::clone(&transport));
        Ok(transport)
    }
}
