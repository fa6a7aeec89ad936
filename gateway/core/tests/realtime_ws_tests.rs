// Copyright (c) 2026 Relay Gateway Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Realtime relay over a real listener, speaking the WebSocket framing by hand.

use mockito::Matcher;
use relay_core::{Relay, RelayConfig};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const BRIDGE: &str = "bridge-secret";

async fn spawn_relay(config: RelayConfig) -> SocketAddr {
    let app = Relay::new(config).unwrap().router();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .unwrap();
    });
    addr
}

fn config(core_url: &str, max_ws_connections: usize) -> RelayConfig {
    RelayConfig {
        core_url: core_url.to_string(),
        bridge_token: Some(BRIDGE.to_string()),
        max_ws_connections,
        log_requests: false,
        ..Default::default()
    }
}

/// Perform the upgrade handshake. `Err` carries the response head on refusal.
async fn open_ws(addr: SocketAddr, query: &str) -> Result<TcpStream, String> {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "GET /ws?{query} HTTP/1.1\r\n\
         Host: {addr}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
         Sec-WebSocket-Version: 13\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut head = Vec::new();
    while !head.ends_with(b"\r\n\r\n") {
        let mut byte = [0u8; 1];
        if stream.read_exact(&mut byte).await.is_err() {
            break;
        }
        head.push(byte[0]);
    }
    let head = String::from_utf8_lossy(&head).to_string();
    if head.starts_with("HTTP/1.1 101") {
        Ok(stream)
    } else {
        Err(head)
    }
}

async fn send_text(stream: &mut TcpStream, message: &Value) {
    let payload = message.to_string().into_bytes();
    assert!(payload.len() < 126);
    let mask = [0x11u8, 0x22, 0x33, 0x44];
    let mut frame = vec![0x81, 0x80 | payload.len() as u8];
    frame.extend_from_slice(&mask);
    frame.extend(payload.iter().enumerate().map(|(i, b)| b ^ mask[i % 4]));
    stream.write_all(&frame).await.unwrap();
}

async fn read_frame(stream: &mut TcpStream) -> Value {
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await.unwrap();
    assert_eq!(header[0] & 0x0f, 0x1, "expected a text frame");
    let len = match header[1] & 0x7f {
        126 => {
            let mut ext = [0u8; 2];
            stream.read_exact(&mut ext).await.unwrap();
            u16::from_be_bytes(ext) as usize
        }
        127 => {
            let mut ext = [0u8; 8];
            stream.read_exact(&mut ext).await.unwrap();
            u64::from_be_bytes(ext) as usize
        }
        n => n as usize,
    };
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await.unwrap();
    serde_json::from_slice(&payload).unwrap()
}

/// Read frames until one has `type == kind`.
async fn read_until(stream: &mut TcpStream, kind: &str) -> Value {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let frame = read_frame(stream).await;
            if frame["type"] == kind {
                return frame;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no {kind} frame within 5s"))
}

#[tokio::test]
async fn test_hello_ping_and_command_round_trip() {
    let mut core = mockito::Server::new_async().await;
    core.mock("GET", "/events/stream")
        .match_query(Matcher::Any)
        .with_body("")
        .create_async()
        .await;
    core.mock("GET", "/jobs")
        .with_body(r#"{"jobs":[{"id":"j1"}]}"#)
        .create_async()
        .await;

    let addr = spawn_relay(config(&core.url(), 10)).await;
    let mut ws = open_ws(addr, &format!("token={BRIDGE}")).await.unwrap();

    let hello = read_frame(&mut ws).await;
    assert_eq!(hello["type"], "hello");
    assert_eq!(hello["service"], "relay-gateway");

    send_text(&mut ws, &json!({"type": "ping", "id": 1})).await;
    let pong = read_until(&mut ws, "pong").await;
    assert_eq!(pong["id"], 1);

    send_text(&mut ws, &json!({"type": "command", "id": "c1", "path": "/jobs"})).await;
    let result = read_until(&mut ws, "command_result").await;
    assert_eq!(result["id"], "c1");
    assert_eq!(result["status"], 200);
    assert_eq!(result["payload"]["jobs"][0]["id"], "j1");

    send_text(&mut ws, &json!({"type": "command", "id": "c2", "path": "/ws"})).await;
    let refused = read_until(&mut ws, "error").await;
    assert_eq!(refused["id"], "c2");
}

#[tokio::test]
async fn test_terminal_and_browser_messages_over_socket() {
    let mut core = mockito::Server::new_async().await;
    core.mock("GET", "/events/stream")
        .match_query(Matcher::Any)
        .with_body("")
        .create_async()
        .await;
    core.mock("GET", "/terminal/sessions/t1/output")
        .match_query(Matcher::UrlEncoded("limit".into(), "600".into()))
        .with_body(r#"{"chunks":["ok"]}"#)
        .create_async()
        .await;
    core.mock("POST", "/browser/click")
        .with_body(r#"{"status":"ok"}"#)
        .create_async()
        .await;

    let addr = spawn_relay(config(&core.url(), 10)).await;
    let mut ws = open_ws(addr, &format!("token={BRIDGE}")).await.unwrap();
    assert_eq!(read_frame(&mut ws).await["type"], "hello");

    send_text(&mut ws, &json!({"type": "terminal_poll", "id": "t", "session_id": "t1"})).await;
    let output = read_until(&mut ws, "terminal_output").await;
    assert_eq!(output["id"], "t");
    assert_eq!(output["session_id"], "t1");
    assert_eq!(output["payload"]["chunks"][0], "ok");

    send_text(&mut ws, &json!({"type": "browser_click", "id": "b", "body": {"selector": "#go"}})).await;
    let clicked = read_until(&mut ws, "browser_click_result").await;
    assert_eq!(clicked["id"], "b");
    assert_eq!(clicked["path"], "/browser/click");
}

#[tokio::test]
async fn test_audit_events_pushed_from_cursor() {
    let mut core = mockito::Server::new_async().await;
    core.mock("GET", "/events/stream")
        .match_query(Matcher::UrlEncoded("since_id".into(), "3".into()))
        .with_body(
            "event: heartbeat\ndata: {}\n\nevent: audit\ndata: {\"id\": 5, \"action\": \"plan.approved\"}\n\n",
        )
        .create_async()
        .await;
    core.mock("GET", "/events/stream")
        .match_query(Matcher::UrlEncoded("since_id".into(), "5".into()))
        .with_body("")
        .create_async()
        .await;

    let addr = spawn_relay(config(&core.url(), 10)).await;
    let mut ws = open_ws(addr, &format!("token={BRIDGE}&since_id=3&poll_timeout=1"))
        .await
        .unwrap();

    assert_eq!(read_frame(&mut ws).await["type"], "hello");
    let event = read_until(&mut ws, "event").await;
    assert_eq!(event["event"], "audit");
    assert_eq!(event["data"]["id"], 5);
    assert_eq!(event["data"]["action"], "plan.approved");
}

#[tokio::test]
async fn test_connection_cap_refuses_and_recovers() {
    let mut core = mockito::Server::new_async().await;
    core.mock("GET", "/events/stream")
        .match_query(Matcher::Any)
        .with_body("")
        .create_async()
        .await;

    let addr = spawn_relay(config(&core.url(), 1)).await;
    let query = format!("token={BRIDGE}");

    let mut first = open_ws(addr, &query).await.unwrap();
    assert_eq!(read_frame(&mut first).await["type"], "hello");

    let refused = open_ws(addr, &query).await.unwrap_err();
    assert!(refused.starts_with("HTTP/1.1 429"), "unexpected head: {refused}");

    drop(first);
    let mut reopened = None;
    for _ in 0..50 {
        if let Ok(stream) = open_ws(addr, &query).await {
            reopened = Some(stream);
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    let mut reopened = reopened.expect("slot was not released after disconnect");
    assert_eq!(read_frame(&mut reopened).await["type"], "hello");
}

#[tokio::test]
async fn test_upgrade_without_credentials_is_unauthorized() {
    let core = mockito::Server::new_async().await;
    let addr = spawn_relay(config(&core.url(), 10)).await;

    let refused = open_ws(addr, "since_id=0").await.unwrap_err();
    assert!(refused.starts_with("HTTP/1.1 401"), "unexpected head: {refused}");
}
