//! End-to-end scenarios against a live server on an ephemeral port.

#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use webterm_proto::{self as proto, FrameType};
use webterm_server::{build_router, AppState};

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_server() -> (Arc<AppState>, String, JoinHandle<()>) {
    let state = AppState::new();
    let app = build_router(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (state, format!("ws://{}/ws/terminal", addr), server)
}

async fn connect(url: &str) -> WsClient {
    let (ws, _resp) = timeout(Duration::from_secs(10), tokio_tungstenite::connect_async(url))
        .await
        .expect("connect timed out")
        .expect("connect failed");
    ws
}

async fn send_frame(ws: &mut WsClient, frame_type: FrameType, payload: &[u8]) {
    let bytes = proto::encode(frame_type, payload).unwrap();
    ws.send(Message::Binary(bytes)).await.expect("send failed");
}

/// Collect DATA payloads until `needle` appears. Panics on ERROR frames and
/// on connection close.
async fn expect_output(ws: &mut WsClient, needle: &str) -> String {
    timeout(Duration::from_secs(10), async {
        let mut collected = String::new();
        while let Some(Ok(msg)) = ws.next().await {
            let Message::Binary(bytes) = msg else {
                continue;
            };
            let (frame, _) = proto::decode(&bytes).expect("server sent an undecodable frame");
            match frame.frame_type {
                FrameType::Data => {
                    collected.push_str(&String::from_utf8_lossy(&frame.payload));
                    if collected.contains(needle) {
                        return collected;
                    }
                }
                FrameType::Error => panic!(
                    "unexpected error frame: {}",
                    String::from_utf8_lossy(&frame.payload)
                ),
                _ => {}
            }
        }
        panic!("connection closed before {needle:?} appeared; saw {collected:?}");
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {needle:?}"))
}

/// Skip frames until the first ERROR and return its text.
async fn expect_error(ws: &mut WsClient) -> String {
    timeout(Duration::from_secs(10), async {
        while let Some(Ok(msg)) = ws.next().await {
            let Message::Binary(bytes) = msg else {
                continue;
            };
            let (frame, _) = proto::decode(&bytes).expect("server sent an undecodable frame");
            if frame.frame_type == FrameType::Error {
                return String::from_utf8_lossy(&frame.payload).to_string();
            }
        }
        panic!("connection closed before an error frame arrived");
    })
    .await
    .expect("timed out waiting for an error frame")
}

async fn expect_close(ws: &mut WsClient) {
    timeout(Duration::from_secs(10), async {
        loop {
            match ws.next().await {
                None | Some(Ok(Message::Close(_))) | Some(Err(_)) => return,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await
    .expect("server did not close the connection in time");
}

async fn wait_until_empty(state: &AppState) {
    timeout(Duration::from_secs(5), async {
        while !state.registry.is_empty() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("registry still holds sessions");
}

#[tokio::test]
async fn echo_roundtrip() {
    let (_state, url, server) = start_server().await;
    let mut ws = connect(&url).await;

    send_frame(&mut ws, FrameType::Data, b"echo hi\n").await;
    expect_output(&mut ws, "hi").await;

    server.abort();
}

#[tokio::test]
async fn resize_is_observed_by_the_shell() {
    let (_state, url, server) = start_server().await;
    let mut ws = connect(&url).await;

    send_frame(&mut ws, FrameType::Resize, &proto::encode_resize(132, 50)).await;
    send_frame(&mut ws, FrameType::Data, b"stty size\n").await;
    expect_output(&mut ws, "50 132").await;

    server.abort();
}

#[tokio::test]
async fn malformed_resize_reports_error_and_session_survives() {
    let (_state, url, server) = start_server().await;
    let mut ws = connect(&url).await;

    // Three payload bytes instead of four.
    send_frame(&mut ws, FrameType::Resize, &[0x01, 0x00, 0x02]).await;
    let error = expect_error(&mut ws).await;
    assert!(error.contains("resize"), "error should mention resize: {error}");

    send_frame(&mut ws, FrameType::Data, b"echo still-alive\n").await;
    expect_output(&mut ws, "still-alive").await;

    server.abort();
}

#[tokio::test]
async fn unknown_frame_type_reports_error_and_session_survives() {
    let (_state, url, server) = start_server().await;
    let mut ws = connect(&url).await;

    ws.send(Message::Binary(vec![0x7f, 0x00, 0x00]))
        .await
        .unwrap();
    let error = expect_error(&mut ws).await;
    assert!(
        error.contains("unknown frame type"),
        "unexpected error text: {error}"
    );

    send_frame(&mut ws, FrameType::Data, b"echo still-alive\n").await;
    expect_output(&mut ws, "still-alive").await;

    server.abort();
}

#[tokio::test]
async fn short_frame_reports_error() {
    let (_state, url, server) = start_server().await;
    let mut ws = connect(&url).await;

    ws.send(Message::Binary(vec![0x01])).await.unwrap();
    let error = expect_error(&mut ws).await;
    assert!(error.contains("bad frame"), "unexpected error text: {error}");

    server.abort();
}

#[tokio::test]
async fn control_before_any_pty_reports_error() {
    let (_state, url, server) = start_server().await;
    let mut ws = connect(&url).await;

    send_frame(&mut ws, FrameType::Control, &[0x02]).await;
    let error = expect_error(&mut ws).await;
    assert!(error.contains("no pty"), "unexpected error text: {error}");

    server.abort();
}

#[tokio::test]
async fn empty_control_payload_reports_error() {
    let (_state, url, server) = start_server().await;
    let mut ws = connect(&url).await;

    send_frame(&mut ws, FrameType::Data, b"echo ready\n").await;
    expect_output(&mut ws, "ready").await;

    send_frame(&mut ws, FrameType::Control, &[]).await;
    let error = expect_error(&mut ws).await;
    assert!(error.contains("control"), "unexpected error text: {error}");

    server.abort();
}

#[tokio::test]
async fn kill_signal_tears_the_session_down() {
    let (state, url, server) = start_server().await;
    let mut ws = connect(&url).await;

    send_frame(&mut ws, FrameType::Data, b"echo ready\n").await;
    expect_output(&mut ws, "ready").await;

    // SIGKILL the shell: the pty reaches EOF and the session drains.
    send_frame(&mut ws, FrameType::Control, &[9]).await;
    expect_close(&mut ws).await;
    wait_until_empty(&state).await;

    server.abort();
}

#[tokio::test]
async fn close_frame_tears_the_session_down() {
    let (state, url, server) = start_server().await;
    let mut ws = connect(&url).await;

    send_frame(&mut ws, FrameType::Data, b"echo ready\n").await;
    expect_output(&mut ws, "ready").await;
    assert_eq!(state.registry.len(), 1);

    send_frame(&mut ws, FrameType::Close, &[]).await;
    expect_close(&mut ws).await;
    wait_until_empty(&state).await;

    server.abort();
}

#[tokio::test]
async fn client_disconnect_removes_the_session() {
    let (state, url, server) = start_server().await;
    let mut ws = connect(&url).await;

    send_frame(&mut ws, FrameType::Data, b"echo ready\n").await;
    expect_output(&mut ws, "ready").await;
    assert_eq!(state.registry.len(), 1);

    ws.close(None).await.unwrap();
    drop(ws);
    wait_until_empty(&state).await;

    server.abort();
}

#[tokio::test]
async fn heartbeat_frame_is_a_noop() {
    let (_state, url, server) = start_server().await;
    let mut ws = connect(&url).await;

    send_frame(&mut ws, FrameType::Heartbeat, &[]).await;
    send_frame(&mut ws, FrameType::Data, b"echo still-alive\n").await;
    // expect_output panics if the heartbeat provoked an ERROR frame.
    expect_output(&mut ws, "still-alive").await;

    server.abort();
}

#[tokio::test]
async fn shutdown_all_closes_live_sessions() {
    let (state, url, server) = start_server().await;
    let mut ws = connect(&url).await;

    send_frame(&mut ws, FrameType::Data, b"echo ready\n").await;
    expect_output(&mut ws, "ready").await;

    timeout(Duration::from_secs(10), state.registry.shutdown_all())
        .await
        .expect("shutdown_all did not finish");
    assert!(state.registry.is_empty());
    expect_close(&mut ws).await;

    server.abort();
}

#[tokio::test]
async fn data_ordering_is_preserved() {
    let (_state, url, server) = start_server().await;
    let mut ws = connect(&url).await;

    // Several DATA frames forming one command; the shell only answers
    // correctly if the bytes arrive in order.
    send_frame(&mut ws, FrameType::Data, b"echo ").await;
    send_frame(&mut ws, FrameType::Data, b"one-").await;
    send_frame(&mut ws, FrameType::Data, b"two-").await;
    send_frame(&mut ws, FrameType::Data, b"three").await;
    send_frame(&mut ws, FrameType::Data, b"\n").await;
    expect_output(&mut ws, "one-two-three").await;

    server.abort();
}
