//! Integration tests for the socket adapter
//!
//! Run with: cargo test --test integration_socket
//! Verbose: TEST_VERBOSE=1 cargo test --test integration_socket -- --nocapture

mod common;

use common::*;
use realtime::core::SocketTransport;
use realtime::*;
use serde_json::json;
use std::time::Duration;

fn socket_config() -> TransportConfig {
    TransportConfig::new("ws://localhost:9000/live")
        .with_token("secret")
        .with_reconnect(Duration::from_secs(1), Duration::from_secs(30), Some(5))
        .with_jitter(0.0)
        .with_heartbeat(Duration::ZERO, Duration::ZERO)
}

fn socket_with(config: TransportConfig) -> (SocketTransport, std::sync::Arc<ScriptedConnector>, EventLog) {
    let connector = ScriptedConnector::new();
    let transport = SocketTransport::with_connector(config, connector.clone());
    let log = EventLog::new();
    log.attach(&LIFECYCLE, |name, handler| transport.on(name, handler));
    (transport, connector, log)
}

#[tokio::test(start_paused = true)]
async fn test_connect_opens_with_token_in_query() {
    let (transport, connector, log) = socket_with(socket_config());

    transport.connect().unwrap();
    assert_eq!(transport.state().status, ConnectionStatus::Connecting);
    settle().await;

    assert_eq!(transport.state().status, ConnectionStatus::Connected);
    assert!(transport.is_connected());
    assert_eq!(log.count("open"), 1);
    assert_eq!(log.count("reconnected"), 0);

    let url = &connector.urls()[0];
    assert_eq!(url.query(), Some("token=secret"));
    verbose_println!("Connected to {}", url);

    // Connecting again while connected is a no-op
    transport.connect().unwrap();
    settle().await;
    assert_eq!(connector.open_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_chat_message_routed_and_cursor_updated() {
    let (transport, connector, log) = socket_with(socket_config());
    let chat = EventLog::new();
    let _sub = transport.on("chat".into(), chat.handler());

    transport.connect().unwrap();
    settle().await;
    connector
        .latest()
        .push_json(json!({"id": "m1", "type": "chat", "data": {"text": "hi"}}));
    settle().await;

    assert_eq!(log.count("message"), 1);
    assert_eq!(chat.count("chat"), 1);
    let routed = chat.last("chat").unwrap();
    assert_eq!(routed.message().unwrap().data, Some(json!({"text": "hi"})));
    assert_eq!(routed.transport, Some(TransportKind::WebSocket));
    assert_eq!(transport.state().last_event_id.as_deref(), Some("m1"));
}

#[tokio::test(start_paused = true)]
async fn test_malformed_frame_reported_as_error() {
    let (transport, connector, log) = socket_with(socket_config());
    transport.connect().unwrap();
    settle().await;

    connector.latest().push("not json");
    settle().await;

    assert_eq!(log.count("error"), 1);
    assert!(matches!(
        transport.state().error,
        Some(TransportError::Parse(_))
    ));
    // A bad frame does not end the connection
    assert_eq!(transport.state().status, ConnectionStatus::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_server_timestamp_formats_still_delivered() {
    let (transport, connector, log) = socket_with(socket_config());
    let chat = EventLog::new();
    let _sub = transport.on("chat".into(), chat.handler());
    transport.connect().unwrap();
    settle().await;

    let server = connector.latest();
    server.push(r#"{"id":"m1","type":"chat","data":{"text":"hi"},"timestamp":"2024-01-01T00:00:00Z"}"#);
    server.push(r#"{"id":"m2","type":"chat","data":{"text":"yo"},"timestamp":1700000000000.5}"#);
    settle().await;

    assert_eq!(log.count("error"), 0);
    assert_eq!(log.count("message"), 2);
    assert_eq!(chat.count("chat"), 2);
    assert_eq!(transport.state().last_event_id.as_deref(), Some("m2"));
}

#[tokio::test(start_paused = true)]
async fn test_send_writes_stamped_frame() {
    let (transport, connector, _log) = socket_with(socket_config());
    transport.connect().unwrap();
    settle().await;

    transport
        .send(Message::new("chat", json!({"text": "yo"})))
        .await
        .unwrap();

    let sent = connector.latest().sent_messages();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].kind.as_deref(), Some("chat"));
    assert!(sent[0].timestamp.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_send_requires_connection() {
    let (transport, _connector, _log) = socket_with(socket_config());
    let result = transport.send(Message::new("chat", json!({}))).await;
    assert_eq!(result, Err(TransportError::NotConnected));
}

#[tokio::test(start_paused = true)]
async fn test_server_close_reconnects_with_cursor() {
    let (transport, connector, log) = socket_with(socket_config());
    transport.connect().unwrap();
    settle().await;

    connector
        .latest()
        .push_json(json!({"id": "m7", "type": "tick", "data": 1}));
    settle().await;
    connector.latest().close();
    settle().await;

    assert_eq!(log.count("close"), 1);
    assert_eq!(transport.state().status, ConnectionStatus::Reconnecting);
    let reconnecting = log.last("reconnecting").unwrap();
    assert_eq!(
        reconnecting.payload,
        EventPayload::Reconnecting {
            attempt: 1,
            delay: Duration::from_secs(1)
        }
    );

    advance(Duration::from_millis(1100)).await;

    assert_eq!(connector.open_count(), 2);
    assert_eq!(log.count("open"), 2);
    assert_eq!(log.count("reconnected"), 1);
    assert_eq!(transport.state().reconnect_attempts, 0);
    let query = connector.urls()[1].query().unwrap_or_default().to_string();
    assert!(query.contains("lastEventId=m7"), "query was {}", query);
}

#[tokio::test(start_paused = true)]
async fn test_failed_open_reports_error_then_retries() {
    let (transport, connector, log) = socket_with(socket_config());
    connector.script(SocketScript::Fail(TransportError::Network(
        "connection refused".into(),
    )));

    transport.connect().unwrap();
    settle().await;

    assert_eq!(log.names()[..2], ["error".to_string(), "close".to_string()]);
    assert_eq!(log.count("reconnecting"), 1);

    advance(Duration::from_millis(1100)).await;
    assert_eq!(transport.state().status, ConnectionStatus::Connected);
    assert_eq!(log.count("reconnected"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_attempts_exhausted_stays_disconnected() {
    let config = socket_config().with_reconnect(Duration::from_secs(1), Duration::from_secs(30), Some(1));
    let (transport, connector, log) = socket_with(config);
    for _ in 0..2 {
        connector.script(SocketScript::Fail(TransportError::Network("down".into())));
    }

    transport.connect().unwrap();
    settle().await;
    advance(Duration::from_secs(5)).await;
    advance(Duration::from_secs(60)).await;

    assert_eq!(connector.open_count(), 2);
    assert_eq!(log.count("reconnecting"), 1);
    assert_eq!(transport.state().status, ConnectionStatus::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_never_reconnects() {
    let (transport, connector, log) = socket_with(socket_config());
    transport.connect().unwrap();
    settle().await;

    transport.disconnect();
    assert_eq!(transport.state().status, ConnectionStatus::Disconnected);
    assert_eq!(log.count("close"), 1);

    advance(Duration::from_secs(120)).await;
    assert_eq!(log.count("reconnecting"), 0);
    assert_eq!(connector.open_count(), 1);

    // Disconnecting twice emits nothing new
    transport.disconnect();
    assert_eq!(log.count("close"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_timeout_drops_connection() {
    let config = socket_config().with_heartbeat(Duration::from_secs(1), Duration::from_millis(500));
    let (transport, connector, log) = socket_with(config);
    transport.connect().unwrap();
    settle().await;

    advance(Duration::from_millis(1100)).await;
    let pings = connector.latest().sent_messages();
    assert_eq!(pings.len(), 1);
    assert_eq!(pings[0].kind.as_deref(), Some(PING_TYPE));

    advance(Duration::from_millis(500)).await;
    let error = log.last("error").unwrap();
    assert!(matches!(
        error.error(),
        Some(TransportError::HeartbeatTimeout(_))
    ));
    assert_eq!(log.count("close"), 1);
    assert_eq!(log.count("reconnecting"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_pong_records_latency() {
    let config = socket_config().with_heartbeat(Duration::from_secs(1), Duration::from_secs(5));
    let (transport, connector, log) = socket_with(config);
    transport.connect().unwrap();
    settle().await;

    advance(Duration::from_millis(1100)).await;
    let server = connector.latest();
    let ping = server.sent_messages().remove(0);
    server.push_json(json!({"type": "pong", "timestamp": ping.timestamp}));
    settle().await;

    assert_eq!(log.count("latency"), 1);
    let state = transport.state();
    assert!(state.latency.is_some());
    assert_eq!(state.average_latency, state.latency);

    // The answered ping never times out
    advance(Duration::from_secs(4)).await;
    assert_eq!(log.count("error"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_latency_sampling_without_heartbeat() {
    let config = socket_config().with_latency_sampling(Duration::from_secs(1));
    let (transport, connector, log) = socket_with(config);
    transport.connect().unwrap();
    settle().await;

    advance(Duration::from_millis(1100)).await;
    let server = connector.latest();
    assert_eq!(server.sent_messages().len(), 1);
    advance(Duration::from_secs(1)).await;
    let pings = server.sent_messages();
    assert_eq!(pings.len(), 2);
    assert!(pings.iter().all(|p| p.kind.as_deref() == Some(PING_TYPE)));
    assert_ne!(pings[0].timestamp, pings[1].timestamp);

    server.push_json(json!({"type": "pong", "timestamp": pings[1].timestamp}));
    settle().await;

    assert_eq!(log.count("latency"), 1);
    assert!(transport.state().latency.is_some());
    // Unanswered samples never time the connection out
    advance(Duration::from_secs(30)).await;
    assert_eq!(log.count("error"), 0);
    assert_eq!(log.count("close"), 0);
    assert_eq!(transport.state().status, ConnectionStatus::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_destroy_is_terminal() {
    let (transport, _connector, log) = socket_with(socket_config());
    transport.connect().unwrap();
    settle().await;

    transport.destroy();
    transport.destroy();
    assert_eq!(transport.connect(), Err(TransportError::Destroyed));
    assert_eq!(
        transport.send(Message::new("chat", json!({}))).await,
        Err(TransportError::Destroyed)
    );
    // Handlers were dropped with the instance
    let closes = log.count("close");
    advance(Duration::from_secs(10)).await;
    assert_eq!(log.count("close"), closes);
}

#[tokio::test(start_paused = true)]
async fn test_panicking_handler_does_not_block_others() {
    let (transport, connector, log) = socket_with(socket_config());
    let _bad = transport.on(
        EventName::Message,
        handler(|_| panic!("consumer bug")),
    );
    let after = EventLog::new();
    let _good = transport.on(EventName::Message, after.handler());

    transport.connect().unwrap();
    settle().await;
    connector.latest().push_json(json!({"type": "note", "data": "x"}));
    settle().await;

    assert_eq!(log.count("message"), 1);
    assert_eq!(after.count("message"), 1);
}
