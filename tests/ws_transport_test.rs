//! End-to-end tests against a loopback WebSocket server.
//!
//! Run with: cargo test --test ws_transport_test

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use sockmux::transport::websocket::WsConnector;
use sockmux::{ConnectionManager, EndpointResolver, Message, ReadyState, RetryPolicy};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as Frame;
use tokio_tungstenite::WebSocketStream;

const JOBS: &str = "/ws/jobs";
const WAIT: Duration = Duration::from_secs(5);

async fn bind() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

async fn accept(listener: &TcpListener) -> WebSocketStream<TcpStream> {
    let (stream, _) = tokio::time::timeout(WAIT, listener.accept())
        .await
        .expect("client never connected")
        .unwrap();
    tokio_tungstenite::accept_async(stream).await.unwrap()
}

fn manager_for(addr: SocketAddr, retry: RetryPolicy) -> ConnectionManager {
    ConnectionManager::new(
        EndpointResolver::new(&format!("http://{addr}"), None),
        retry,
        WsConnector::new(),
    )
}

/// Poll until `check` holds or the wait budget runs out.
async fn wait_until<F: Fn() -> bool>(check: F) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn next_text(server: &mut WebSocketStream<TcpStream>) -> String {
    loop {
        let frame = tokio::time::timeout(WAIT, server.next())
            .await
            .expect("no frame from client")
            .expect("client hung up")
            .unwrap();
        if let Frame::Text(text) = frame {
            return text.to_string();
        }
    }
}

#[tokio::test]
async fn test_messages_flow_both_ways() {
    let (listener, addr) = bind().await;
    let manager = manager_for(addr, RetryPolicy::never());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _sub = manager.subscribe_fn(JOBS, move |message| {
        let _ = tx.send(message.clone());
    });

    let mut server = accept(&listener).await;
    wait_until(|| manager.ready_state(JOBS) == ReadyState::Open).await;

    server
        .send(Frame::Text(r#"{"type":"error","message":"quota"}"#.into()))
        .await
        .unwrap();
    let received = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(
        received,
        Message::Error {
            message: "quota".to_string()
        }
    );

    manager.send(JOBS, &json!({"type": "ping"}));
    assert_eq!(next_text(&mut server).await, r#"{"type":"ping"}"#);
}

#[tokio::test]
async fn test_normal_server_close_is_clean() {
    let (listener, addr) = bind().await;
    let manager = manager_for(addr, RetryPolicy::fixed(3, Duration::from_millis(50)));
    let _sub = manager.subscribe_fn(JOBS, |_| {});

    let mut server = accept(&listener).await;
    wait_until(|| manager.ready_state(JOBS) == ReadyState::Open).await;

    server
        .close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "bye".into(),
        }))
        .await
        .unwrap();

    wait_until(|| manager.endpoints().is_empty()).await;

    // No reconnect follows a clean close.
    let reconnect = tokio::time::timeout(Duration::from_millis(300), listener.accept()).await;
    assert!(reconnect.is_err(), "clean close must not reconnect");
}

#[tokio::test]
async fn test_dropped_connection_reconnects() {
    let (listener, addr) = bind().await;
    let manager = manager_for(addr, RetryPolicy::fixed(3, Duration::from_millis(50)));
    let _sub = manager.subscribe_fn(JOBS, |_| {});

    let server = accept(&listener).await;
    wait_until(|| manager.ready_state(JOBS) == ReadyState::Open).await;
    drop(server);

    let mut second = accept(&listener).await;
    wait_until(|| manager.ready_state(JOBS) == ReadyState::Open).await;
    assert_eq!(manager.status(JOBS).unwrap().reconnect_attempts, 0);

    manager.send(JOBS, &json!({"type": "pong"}));
    assert_eq!(next_text(&mut second).await, r#"{"type":"pong"}"#);
}

#[tokio::test]
async fn test_unsubscribe_sends_close_frame() {
    let (listener, addr) = bind().await;
    let manager = manager_for(addr, RetryPolicy::never());
    let sub = manager.subscribe_fn(JOBS, |_| {});

    let mut server = accept(&listener).await;
    wait_until(|| manager.ready_state(JOBS) == ReadyState::Open).await;

    sub.unsubscribe();

    let frame = tokio::time::timeout(WAIT, server.next())
        .await
        .expect("no close frame")
        .expect("stream ended without close frame")
        .unwrap();
    match frame {
        Frame::Close(Some(close)) => assert_eq!(close.code, CloseCode::Normal),
        other => panic!("expected close frame, got {:?}", other),
    }
    assert!(manager.endpoints().is_empty());
}

#[tokio::test]
async fn test_ping_is_answered_and_connection_survives() {
    let (listener, addr) = bind().await;
    let manager = manager_for(addr, RetryPolicy::never());
    let _sub = manager.subscribe_fn(JOBS, |_| {});

    let mut server = accept(&listener).await;
    wait_until(|| manager.ready_state(JOBS) == ReadyState::Open).await;

    server.send(Frame::Ping(b"hb".to_vec())).await.unwrap();
    let pong = loop {
        let frame = tokio::time::timeout(WAIT, server.next())
            .await
            .expect("no pong from client")
            .expect("client hung up")
            .unwrap();
        if let Frame::Pong(data) = frame {
            break data;
        }
    };
    assert_eq!(pong, b"hb".to_vec());
    assert_eq!(manager.ready_state(JOBS), ReadyState::Open);
}

#[tokio::test]
async fn test_unreachable_server_exhausts_retries() {
    // Bind then drop to get a port nobody listens on.
    let (listener, addr) = bind().await;
    drop(listener);

    let manager = manager_for(addr, RetryPolicy::fixed(2, Duration::from_millis(20)));
    let _sub = manager.subscribe_fn(JOBS, |_| {});

    wait_until(|| manager.endpoints().is_empty()).await;
    assert_eq!(manager.ready_state(JOBS), ReadyState::Closed);
}

#[test]
fn test_subscribe_without_runtime_is_noop() {
    let manager = ConnectionManager::new(
        EndpointResolver::new("http://127.0.0.1:1", None),
        RetryPolicy::default(),
        WsConnector::new(),
    );

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        manager.subscribe_fn(JOBS, |_| {})
    }));
    let sub = result.expect("subscribe must not panic outside a runtime");

    assert!(!sub.is_active());
    assert!(manager.endpoints().is_empty());
    assert_eq!(manager.ready_state(JOBS), ReadyState::Closed);

    // Registry lock is still usable afterwards.
    let again = manager.subscribe_fn(JOBS, |_| {});
    assert!(!again.is_active());
    assert_eq!(manager.listener_count(JOBS), 0);
}
