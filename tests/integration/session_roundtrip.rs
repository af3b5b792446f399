// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::missing_panics_doc
)]

//! End-to-end session tests against an in-process `chatlink-backend`.
//!
//! A real `ChatClient` talks to the backend over WebSockets:
//! - handshake grants a conversation
//! - a sent message is confirmed, processed and answered
//! - image progress reaches `analyzed` for every image
//! - intentional disconnect, reconnect, refused connection
//! - history survives a restart with the file store

use std::sync::Arc;
use std::time::Duration;

use chatlink::client::{ChatClient, ClientError};
use chatlink::connection::{CONNECTION_FAILED, ConnectionConfig, ConnectionStatus};
use chatlink::session::SessionIdentity;
use chatlink::store::{
    ChatState, FileStateStore, InMemoryStateStore, MessageKind, MessageStatus, StateStore,
};
use chatlink::transport::websocket::WebSocketConnector;
use chatlink_backend::backend::{self, BackendState, SessionSettings};
use chatlink_proto::message::{ClientId, ImageData, ImageStatus};

const WAIT: Duration = Duration::from_secs(5);

async fn start_backend() -> std::net::SocketAddr {
    let state = Arc::new(BackendState::with_settings(SessionSettings {
        ping_interval: Some(Duration::from_millis(100)),
        reply_delay: Duration::from_millis(20),
        idle_timeout: None,
    }));
    let (addr, _handle) = backend::start_server_with_state("127.0.0.1:0", state)
        .await
        .expect("failed to start backend");
    addr
}

async fn start_client<S: StateStore>(url: &str, persistence: S) -> ChatClient<S> {
    ChatClient::start(
        WebSocketConnector::new(url),
        SessionIdentity::new(ClientId::generate()),
        persistence,
        ConnectionConfig::default(),
    )
    .await
}

async fn connected_client(addr: std::net::SocketAddr) -> ChatClient<InMemoryStateStore> {
    let client = start_client(&format!("ws://{addr}/ws"), InMemoryStateStore::new()).await;
    client.connect().await.unwrap();
    tokio::time::timeout(WAIT, client.wait_for_status(ConnectionStatus::Connected))
        .await
        .expect("timed out connecting")
        .unwrap();
    client
}

/// Wait until the conversation state satisfies `pred`.
async fn wait_for_chat<S: StateStore>(
    client: &ChatClient<S>,
    pred: impl Fn(&ChatState) -> bool,
) -> ChatState {
    let mut rx = client.subscribe();
    let state = tokio::time::timeout(WAIT, rx.wait_for(|state| pred(state)))
        .await
        .expect("timed out waiting for chat state")
        .expect("store dropped")
        .clone();
    state
}

fn replies(state: &ChatState, client_id: &ClientId) -> Vec<String> {
    state
        .messages
        .iter()
        .filter(|m| m.kind == MessageKind::Content && !m.is_from(client_id))
        .map(|m| m.content.clone())
        .collect()
}

#[tokio::test]
async fn handshake_grants_conversation() {
    let addr = start_backend().await;
    let client = connected_client(addr).await;

    let connection = client.connection_state();
    assert!(connection.is_connected());
    assert!(connection.conversation_id.is_some());
    assert_eq!(&connection.client_id, client.client_id());
    assert!(connection.error.is_none());

    client.shutdown().await;
}

#[tokio::test]
async fn message_is_confirmed_processed_and_answered() {
    let addr = start_backend().await;
    let client = connected_client(addr).await;

    let pending = client.send_message("hello", Vec::new()).await.unwrap();
    let sent_id = pending.message_id().clone();

    let confirmation = tokio::time::timeout(WAIT, pending).await.unwrap().unwrap();
    assert_eq!(confirmation.message_id, sent_id);
    assert_eq!(confirmation.status, "received");

    let client_id = client.client_id().clone();
    let state = wait_for_chat(&client, |s| {
        !replies(s, &client_id).is_empty() && !s.is_typing
    })
    .await;

    assert_eq!(replies(&state, &client_id), vec!["You said: hello".to_string()]);
    let sent = state.message(&sent_id).unwrap();
    assert_eq!(sent.status, MessageStatus::PROCESSED);
    assert!(sent.is_from(&client_id));
    assert!(state.error.is_none());

    client.shutdown().await;
}

#[tokio::test]
async fn image_progress_reaches_analyzed() {
    let addr = start_backend().await;
    let client = connected_client(addr).await;

    let images = vec![
        ImageData {
            data: "aGk=".into(),
            mime_type: "image/png".into(),
        },
        ImageData {
            data: "aGV5".into(),
            mime_type: "image/jpeg".into(),
        },
    ];
    let pending = client.send_message("", images).await.unwrap();
    let sent_id = pending.message_id().clone();

    let client_id = client.client_id().clone();
    let state = wait_for_chat(&client, |s| !replies(s, &client_id).is_empty()).await;

    let sent = state.message(&sent_id).unwrap();
    assert_eq!(sent.images.len(), 2);
    assert_eq!(sent.image_statuses.len(), 2);
    assert_eq!(sent.image_status("img-1"), Some(ImageStatus::Analyzed));
    assert_eq!(sent.image_status("img-2"), Some(ImageStatus::Analyzed));
    assert_eq!(
        replies(&state, &client_id),
        vec!["2 image(s) analyzed".to_string()]
    );

    client.shutdown().await;
}

#[tokio::test]
async fn disconnect_then_reconnect_gets_new_conversation() {
    let addr = start_backend().await;
    let client = connected_client(addr).await;
    let first = client.connection_state().conversation_id.unwrap();

    client.disconnect().await.unwrap();
    let state = client.connection_state();
    assert_eq!(state.status, ConnectionStatus::Disconnected);
    assert!(state.error.is_none());
    assert!(state.conversation_id.is_none());

    let err = client.send_message("anyone?", Vec::new()).await.unwrap_err();
    assert!(matches!(err, ClientError::NotConnected));

    client.connect().await.unwrap();
    let state = tokio::time::timeout(WAIT, client.wait_for_status(ConnectionStatus::Connected))
        .await
        .unwrap()
        .unwrap();
    assert_ne!(state.conversation_id.unwrap(), first);

    client.shutdown().await;
}

#[tokio::test]
async fn refused_connection_reports_failure() {
    // Bind then drop a listener to get a port nobody serves.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = start_client(&format!("ws://{addr}/ws"), InMemoryStateStore::new()).await;
    client.connect().await.unwrap();

    let mut rx = client.subscribe_connection();
    let state = tokio::time::timeout(WAIT, rx.wait_for(|s| s.error.is_some()))
        .await
        .unwrap()
        .unwrap()
        .clone();
    assert_eq!(state.status, ConnectionStatus::Disconnected);
    assert_eq!(state.error.as_deref(), Some(CONNECTION_FAILED));

    client.shutdown().await;
}

#[tokio::test]
async fn history_survives_restart() {
    let addr = start_backend().await;
    let url = format!("ws://{addr}/ws");
    let path = std::env::temp_dir()
        .join(format!("chatlink-roundtrip-{}", uuid::Uuid::new_v4()))
        .join("state.bin");

    let client = start_client(&url, FileStateStore::new(&path)).await;
    client.connect().await.unwrap();
    tokio::time::timeout(WAIT, client.wait_for_status(ConnectionStatus::Connected))
        .await
        .unwrap()
        .unwrap();
    client.send_message("remember me", Vec::new()).await.unwrap();
    let client_id = client.client_id().clone();
    let before = wait_for_chat(&client, |s| !replies(s, &client_id).is_empty()).await;
    client.shutdown().await;

    let restarted = start_client(&url, FileStateStore::new(&path)).await;
    let after = restarted.snapshot().chat;
    assert_eq!(after.messages, before.messages);
    assert_eq!(restarted.connection_state().status, ConnectionStatus::Disconnected);

    restarted.shutdown().await;
    let _ = std::fs::remove_dir_all(path.parent().unwrap());
}
