//! End-to-end tests over a real WebSocket connection

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use notesync_config::GatewayConfig;
use notesync_core::testing::MemoryBackend;
use notesync_core::{Note, Paragraph};
use notesync_gateway::{Gateway, Services};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Server {
    addr: SocketAddr,
    gateway: Gateway,
    note_id: String,
}

async fn start(config: GatewayConfig) -> Server {
    let backend = Arc::new(MemoryBackend::new());
    let mut note = Note::new("shared");
    note.paragraphs = vec![Paragraph::new("p1").with_text("%md hello")];
    let note_id = note.id.clone();
    backend.insert_note(note);

    let gateway = Gateway::new(config, Services::from_backend(backend));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = gateway.clone();
    tokio::spawn(async move { server.serve(listener).await });
    Server {
        addr,
        gateway,
        note_id,
    }
}

async fn connect(server: &Server) -> Client {
    let (ws, _) = connect_async(format!("ws://{}/ws", server.addr))
        .await
        .unwrap();
    ws
}

async fn send(ws: &mut Client, principal: &str, ticket: &str, op: &str, data: Value) {
    let frame = json!({ "op": op, "principal": principal, "ticket": ticket, "data": data });
    ws.send(Message::Text(frame.to_string())).await.unwrap();
}

/// Next text frame with `op`
async fn recv_op(ws: &mut Client, op: &str) -> Value {
    tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(frame) = ws.next().await {
            if let Message::Text(text) = frame.unwrap() {
                let value: Value = serde_json::from_str(&text).unwrap();
                if value["op"] == op {
                    return value;
                }
            }
        }
        panic!("connection closed before {}", op);
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn test_disallowed_origin_is_refused() {
    let server = start(GatewayConfig {
        allowed_origins: vec!["http://notebook.example.com".into()],
        ..Default::default()
    })
    .await;

    let mut request = format!("ws://{}/ws", server.addr)
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert("Origin", HeaderValue::from_static("http://evil.example.com"));
    match connect_async(request).await {
        Err(Error::Http(response)) => assert_eq!(response.status(), 403),
        other => panic!("expected 403, got {:?}", other.map(|_| ())),
    }

    let mut request = format!("ws://{}/ws", server.addr)
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert("Origin", HeaderValue::from_static("http://notebook.example.com"));
    assert!(connect_async(request).await.is_ok());
}

#[tokio::test]
async fn test_list_notes_round_trip() {
    let server = start(GatewayConfig::default()).await;
    let ticket = server.gateway.tickets().issue("alice", vec!["admin".into()]);
    let mut ws = connect(&server).await;

    send(&mut ws, "alice", &ticket, "LIST_NOTES", json!({})).await;
    let reply = recv_op(&mut ws, "NOTES_INFO").await;
    assert_eq!(reply["data"]["notes"][0]["id"], server.note_id.as_str());
    assert!(server.gateway.connected_users().contains("alice"));
}

#[tokio::test]
async fn test_stale_ticket_logs_out() {
    let server = start(GatewayConfig::default()).await;
    server.gateway.tickets().issue("alice", Vec::new());
    let mut ws = connect(&server).await;

    send(&mut ws, "alice", "old-ticket", "LIST_NOTES", json!({})).await;
    let reply = recv_op(&mut ws, "SESSION_LOGOUT").await;
    assert!(reply["data"]["info"]
        .as_str()
        .unwrap()
        .contains("Please login again"));
}

#[tokio::test]
async fn test_paragraph_edit_reaches_other_viewer() {
    let server = start(GatewayConfig::default()).await;
    let alice_ticket = server.gateway.tickets().issue("alice", Vec::new());
    let bob_ticket = server.gateway.tickets().issue("bob", Vec::new());
    let mut alice = connect(&server).await;
    let mut bob = connect(&server).await;

    send(&mut alice, "alice", &alice_ticket, "GET_NOTE", json!({ "id": server.note_id })).await;
    recv_op(&mut alice, "NOTE").await;
    send(&mut bob, "bob", &bob_ticket, "GET_NOTE", json!({ "id": server.note_id })).await;
    recv_op(&mut bob, "NOTE").await;

    send(
        &mut alice,
        "alice",
        &alice_ticket,
        "COMMIT_PARAGRAPH",
        json!({ "id": "p1", "paragraph": "%md edited", "params": {}, "config": {} }),
    )
    .await;
    let update = recv_op(&mut bob, "PARAGRAPH").await;
    assert_eq!(update["data"]["paragraph"]["text"], "%md edited");
}

#[tokio::test]
async fn test_connections_over_capacity_are_told_why() {
    let server = start(GatewayConfig {
        max_connections: 1,
        ..Default::default()
    })
    .await;
    let ticket = server.gateway.tickets().issue("alice", Vec::new());
    let mut first = connect(&server).await;
    send(&mut first, "alice", &ticket, "LIST_NOTES", json!({})).await;
    recv_op(&mut first, "NOTES_INFO").await;

    let mut second = connect(&server).await;
    let refusal = recv_op(&mut second, "ERROR_INFO").await;
    assert_eq!(refusal["data"]["info"], "Server at capacity");
}

#[tokio::test]
async fn test_notice_reaches_every_connection() {
    let server = start(GatewayConfig::default()).await;
    let ticket = server.gateway.tickets().issue("alice", Vec::new());
    let mut ws = connect(&server).await;
    send(&mut ws, "alice", &ticket, "PING", json!({})).await;
    send(&mut ws, "alice", &ticket, "LIST_NOTES", json!({})).await;
    recv_op(&mut ws, "NOTES_INFO").await;

    server.gateway.send_notice("maintenance at noon");
    let notice = recv_op(&mut ws, "NOTICE").await;
    assert_eq!(notice["data"]["notice"], "maintenance at noon");
}
