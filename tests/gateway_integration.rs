//! Integration tests for the realtime gateway.
//!
//! Each test spins up the full service on a random port with an in-memory
//! database and broker, connects via tokio-tungstenite, and exercises the
//! real WS contract while producing events through the job manager.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use secrecy::SecretString;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use uuid::Uuid;

use job_relay::app::Services;
use job_relay::broker::{MemoryTransport, Transport};
use job_relay::config::ServiceConfig;
use job_relay::jobs::{EventKind, JobManager, JobState};
use job_relay::store::{Database, LibSqlBackend};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn test_config() -> ServiceConfig {
    let mut config = ServiceConfig::default();
    config.gateway.tokens = vec![
        (SecretString::from("alice-token"), "alice".to_string()),
        (SecretString::from("bob-token"), "bob".to_string()),
    ];
    config
}

/// Start the service on a random port, return (port, services).
async fn start_server(config: ServiceConfig) -> (u16, Services) {
    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let transport: Arc<dyn Transport> = Arc::new(MemoryTransport::new());
    let services = Services::start(&config, db, transport).await;
    let app = services.router();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    (port, services)
}

/// Connect with a query-string token and consume `auth_ok`.
async fn connect(port: u16, token: &str) -> Ws {
    let (mut ws, _resp) = connect_async(format!("ws://127.0.0.1:{port}/ws?token={token}"))
        .await
        .expect("WS connect failed");
    let auth = recv_json(&mut ws).await;
    assert_eq!(auth["type"], "auth_ok", "unexpected first frame {auth}");
    ws
}

/// Next JSON text frame, skipping heartbeats.
async fn recv_json(ws: &mut Ws) -> Value {
    loop {
        match ws.next().await.expect("stream ended").expect("WS error") {
            Message::Text(txt) => return serde_json::from_str(&txt).expect("invalid JSON from server"),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("expected Text frame, got {:?}", other),
        }
    }
}

async fn send_json(ws: &mut Ws, value: Value) {
    ws.send(Message::Text(value.to_string().into())).await.unwrap();
}

/// Create a running job for `owner`.
async fn running_job(manager: &JobManager, owner: &str) -> Uuid {
    let job = manager.create_job(owner, "research", json!({})).await.unwrap();
    manager.transition(job.id, JobState::Queued, None).await.unwrap();
    manager.transition(job.id, JobState::Running, None).await.unwrap();
    job.id
}

async fn log(manager: &JobManager, job_id: Uuid, n: u64) -> u64 {
    manager
        .append_event(job_id, EventKind::Log, json!({"message": format!("line {n}")}))
        .await
        .unwrap()
        .sequence
}

/// Read `subscribed` plus its replayed events, returning the event sequences.
async fn read_subscription(ws: &mut Ws) -> (Value, Vec<u64>) {
    let subscribed = recv_json(ws).await;
    assert_eq!(subscribed["type"], "subscribed", "unexpected frame {subscribed}");
    let count = subscribed["replayed"].as_u64().unwrap();
    let mut sequences = Vec::new();
    for _ in 0..count {
        let frame = recv_json(ws).await;
        assert_eq!(frame["type"], "event");
        sequences.push(frame["event"]["sequence"].as_u64().unwrap());
    }
    (subscribed, sequences)
}

async fn next_event_sequence(ws: &mut Ws) -> u64 {
    let frame = recv_json(ws).await;
    assert_eq!(frame["type"], "event", "unexpected frame {frame}");
    frame["event"]["sequence"].as_u64().unwrap()
}

// ── Authentication ───────────────────────────────────────────────────

#[tokio::test]
async fn query_token_authenticates() {
    timeout(TEST_TIMEOUT, async {
        let (port, _services) = start_server(test_config()).await;
        let (mut ws, _resp) = connect_async(format!("ws://127.0.0.1:{port}/ws?token=alice-token"))
            .await
            .unwrap();

        let auth = recv_json(&mut ws).await;
        assert_eq!(auth["type"], "auth_ok");
        assert_eq!(auth["owner_id"], "alice");
        assert!(auth["connection_id"].as_str().is_some());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn first_frame_authenticates() {
    timeout(TEST_TIMEOUT, async {
        let (port, _services) = start_server(test_config()).await;
        let (mut ws, _resp) = connect_async(format!("ws://127.0.0.1:{port}/ws")).await.unwrap();

        send_json(&mut ws, json!({"type": "auth", "token": "bob-token"})).await;
        let auth = recv_json(&mut ws).await;
        assert_eq!(auth["type"], "auth_ok");
        assert_eq!(auth["owner_id"], "bob");

        send_json(&mut ws, json!({"type": "ping"})).await;
        assert_eq!(recv_json(&mut ws).await["type"], "pong");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn bad_token_is_rejected_and_closed() {
    timeout(TEST_TIMEOUT, async {
        let (port, _services) = start_server(test_config()).await;
        let (mut ws, _resp) = connect_async(format!("ws://127.0.0.1:{port}/ws?token=nope"))
            .await
            .unwrap();

        let err = recv_json(&mut ws).await;
        assert_eq!(err["type"], "error");
        assert_eq!(err["code"], "auth_failed");
        assert_eq!(err["retryable"], false);

        // Server closes after the error frame.
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await
    .expect("test timed out");
}

// ── Subscriptions & replay ───────────────────────────────────────────

#[tokio::test]
async fn reconnect_replays_after_last_seen_then_streams_live() {
    timeout(TEST_TIMEOUT, async {
        let (port, services) = start_server(test_config()).await;
        let manager = &services.manager;
        let job_id = running_job(manager, "alice").await;
        for n in 1..=15 {
            log(manager, job_id, n).await;
        }

        let mut ws = connect(port, "alice-token").await;
        send_json(
            &mut ws,
            json!({"type": "subscribe", "room": {"job": job_id}, "last_seen_sequence": 10}),
        )
        .await;

        let (subscribed, replayed) = read_subscription(&mut ws).await;
        assert_eq!(replayed, vec![11, 12, 13, 14, 15]);
        assert_eq!(subscribed["truncated"], false);

        let seq = log(manager, job_id, 16).await;
        assert_eq!(next_event_sequence(&mut ws).await, seq);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn backlog_cap_truncates_replay() {
    timeout(TEST_TIMEOUT, async {
        let mut config = test_config();
        config.gateway.backlog_cap = 5;
        let (port, services) = start_server(config).await;
        let job_id = running_job(&services.manager, "alice").await;
        for n in 1..=12 {
            log(&services.manager, job_id, n).await;
        }

        let mut ws = connect(port, "alice-token").await;
        send_json(
            &mut ws,
            json!({"type": "subscribe", "room": {"job": job_id}, "last_seen_sequence": 2}),
        )
        .await;

        let (subscribed, replayed) = read_subscription(&mut ws).await;
        assert_eq!(replayed, vec![8, 9, 10, 11, 12]);
        assert_eq!(subscribed["truncated"], true);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn concurrent_subscribers_see_identical_order() {
    timeout(TEST_TIMEOUT, async {
        let (port, services) = start_server(test_config()).await;
        let job_id = running_job(&services.manager, "alice").await;

        let mut a = connect(port, "alice-token").await;
        let mut b = connect(port, "alice-token").await;
        for ws in [&mut a, &mut b] {
            send_json(ws, json!({"type": "subscribe", "room": {"job": job_id}})).await;
            let (_, replayed) = read_subscription(ws).await;
            assert!(replayed.is_empty());
        }

        let mut expected = Vec::new();
        for n in 1..=10 {
            expected.push(log(&services.manager, job_id, n).await);
        }

        let mut seen_a = Vec::new();
        let mut seen_b = Vec::new();
        for _ in 0..expected.len() {
            seen_a.push(next_event_sequence(&mut a).await);
            seen_b.push(next_event_sequence(&mut b).await);
        }
        assert_eq!(seen_a, expected);
        assert_eq!(seen_b, expected);

        // Unsubscribing one connection leaves the other streaming.
        send_json(&mut a, json!({"type": "unsubscribe", "room": {"job": job_id}})).await;
        assert_eq!(recv_json(&mut a).await["type"], "unsubscribed");

        let seq = log(&services.manager, job_id, 11).await;
        assert_eq!(next_event_sequence(&mut b).await, seq);

        send_json(&mut a, json!({"type": "ping"})).await;
        assert_eq!(recv_json(&mut a).await["type"], "pong");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn owner_room_streams_every_job_of_owner() {
    timeout(TEST_TIMEOUT, async {
        let (port, services) = start_server(test_config()).await;
        let manager = &services.manager;
        let first = running_job(manager, "alice").await;
        let second = running_job(manager, "alice").await;
        let other = running_job(manager, "bob").await;
        log(manager, first, 1).await;
        log(manager, first, 2).await;

        let mut ws = connect(port, "alice-token").await;
        send_json(
            &mut ws,
            json!({"type": "subscribe", "room": {"owner": "alice"}, "cursors": {first.to_string(): 1}}),
        )
        .await;
        let (_, replayed) = read_subscription(&mut ws).await;
        assert_eq!(replayed, vec![2]);

        log(manager, other, 1).await;
        log(manager, second, 1).await;
        let frame = recv_json(&mut ws).await;
        assert_eq!(frame["type"], "event");
        assert_eq!(frame["room"], json!({"owner": "alice"}));
        assert_eq!(frame["event"]["job_id"], json!(second));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn foreign_rooms_are_forbidden() {
    timeout(TEST_TIMEOUT, async {
        let (port, services) = start_server(test_config()).await;
        let bobs = running_job(&services.manager, "bob").await;

        let mut ws = connect(port, "alice-token").await;
        send_json(&mut ws, json!({"type": "subscribe", "room": {"job": bobs}})).await;
        let err = recv_json(&mut ws).await;
        assert_eq!(err["type"], "error");
        assert_eq!(err["code"], "forbidden");

        send_json(&mut ws, json!({"type": "subscribe", "room": {"owner": "bob"}})).await;
        assert_eq!(recv_json(&mut ws).await["code"], "forbidden");

        let missing = Uuid::new_v4();
        send_json(&mut ws, json!({"type": "subscribe", "room": {"job": missing}})).await;
        assert_eq!(recv_json(&mut ws).await["code"], "not_found");

        send_json(&mut ws, json!({"type": "bogus"})).await;
        assert_eq!(recv_json(&mut ws).await["code"], "protocol");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn terminal_event_reaches_subscriber() {
    timeout(TEST_TIMEOUT, async {
        let (port, services) = start_server(test_config()).await;
        let job_id = running_job(&services.manager, "alice").await;

        let mut ws = connect(port, "alice-token").await;
        send_json(&mut ws, json!({"type": "subscribe", "room": {"job": job_id}})).await;
        read_subscription(&mut ws).await;

        services
            .manager
            .cancel(job_id, Some("user request".into()))
            .await
            .unwrap();
        let frame = recv_json(&mut ws).await;
        assert_eq!(frame["event"]["type"], "cancelled");
        assert_eq!(frame["event"]["payload"]["reason"], "user request");
    })
    .await
    .expect("test timed out");
}

// ── Limits ───────────────────────────────────────────────────────────

#[tokio::test]
async fn global_connection_limit_returns_503() {
    timeout(TEST_TIMEOUT, async {
        let mut config = test_config();
        config.gateway.max_connections = 1;
        let (port, _services) = start_server(config).await;

        let _held = connect(port, "alice-token").await;
        match connect_async(format!("ws://127.0.0.1:{port}/ws?token=bob-token")).await {
            Err(tokio_tungstenite::tungstenite::Error::Http(resp)) => {
                assert_eq!(resp.status().as_u16(), 503);
            }
            Err(other) => panic!("unexpected error {other:?}"),
            Ok(_) => panic!("second connection should be refused"),
        }
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn per_owner_limit_rejects_extra_connection() {
    timeout(TEST_TIMEOUT, async {
        let mut config = test_config();
        config.gateway.max_connections_per_owner = 1;
        let (port, _services) = start_server(config).await;

        let _held = connect(port, "alice-token").await;
        let (mut ws, _resp) = connect_async(format!("ws://127.0.0.1:{port}/ws?token=alice-token"))
            .await
            .unwrap();
        let err = recv_json(&mut ws).await;
        assert_eq!(err["code"], "gateway_overload");
        assert_eq!(err["retryable"], true);

        // Other owners are unaffected.
        connect(port, "bob-token").await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn room_limit_is_enforced_per_connection() {
    timeout(TEST_TIMEOUT, async {
        let mut config = test_config();
        config.gateway.max_rooms_per_connection = 1;
        let (port, services) = start_server(config).await;
        let first = running_job(&services.manager, "alice").await;
        let second = running_job(&services.manager, "alice").await;

        let mut ws = connect(port, "alice-token").await;
        send_json(&mut ws, json!({"type": "subscribe", "room": {"job": first}})).await;
        read_subscription(&mut ws).await;

        send_json(&mut ws, json!({"type": "subscribe", "room": {"job": second}})).await;
        let err = recv_json(&mut ws).await;
        assert_eq!(err["type"], "error");
        assert_eq!(err["code"], "gateway_overload");
        assert_eq!(err["retryable"], true);
    })
    .await
    .expect("test timed out");
}

// ── Heartbeat & idle timeout ─────────────────────────────────────────

#[tokio::test]
async fn server_pings_connected_clients() {
    timeout(TEST_TIMEOUT, async {
        let mut config = test_config();
        config.gateway.heartbeat_interval = Duration::from_millis(100);
        let (port, _services) = start_server(config).await;
        let mut ws = connect(port, "alice-token").await;

        let frame = timeout(Duration::from_secs(1), ws.next())
            .await
            .expect("no heartbeat within a second")
            .expect("stream ended")
            .expect("WS error");
        assert!(matches!(frame, Message::Ping(_)), "expected Ping, got {frame:?}");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn silent_client_is_closed() {
    timeout(TEST_TIMEOUT, async {
        let mut config = test_config();
        config.gateway.heartbeat_interval = Duration::from_secs(60);
        config.gateway.idle_timeout = Duration::from_millis(200);
        let (port, _services) = start_server(config).await;
        let mut ws = connect(port, "alice-token").await;

        let frame = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("idle connection was not closed")
            .expect("stream ended without a Close frame")
            .expect("WS error");
        assert!(matches!(frame, Message::Close(_)), "expected Close, got {frame:?}");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn client_traffic_keeps_connection_open() {
    timeout(TEST_TIMEOUT, async {
        let mut config = test_config();
        config.gateway.heartbeat_interval = Duration::from_secs(60);
        config.gateway.idle_timeout = Duration::from_millis(300);
        let (port, services) = start_server(config).await;
        let job_id = running_job(&services.manager, "alice").await;
        let mut ws = connect(port, "alice-token").await;

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(150)).await;
            send_json(&mut ws, json!({"type": "ping"})).await;
            assert_eq!(recv_json(&mut ws).await["type"], "pong");
        }

        // 600ms in, well past one idle window: still answering.
        send_json(&mut ws, json!({"type": "subscribe", "room": {"job": job_id}})).await;
        let (subscribed, _) = read_subscription(&mut ws).await;
        assert_eq!(subscribed["type"], "subscribed");
    })
    .await
    .expect("test timed out");
}
