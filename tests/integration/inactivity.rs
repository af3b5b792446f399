// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::missing_panics_doc
)]

//! Liveness tests against an in-process `chatlink-backend`.
//!
//! Covers the ways a session ends without the user asking:
//! - no ping within the inactivity window (client side)
//! - pings keep a quiet session open
//! - the backend closes an idle session
//! - the backend closes every session
//!
//! and the email prompt that follows an ended session.

use std::sync::Arc;
use std::time::Duration;

use chatlink::client::{ChatClient, INVALID_EMAIL};
use chatlink::connection::{ConnectionConfig, ConnectionState, ConnectionStatus, SESSION_INACTIVE};
use chatlink::session::SessionIdentity;
use chatlink::store::{ChatState, InMemoryStateStore, PersistedState};
use chatlink::transport::websocket::WebSocketConnector;
use chatlink_backend::backend::{self, BackendState, SessionSettings};
use chatlink_proto::message::ClientId;

const WAIT: Duration = Duration::from_secs(5);

async fn start_backend(settings: SessionSettings) -> (std::net::SocketAddr, Arc<BackendState>) {
    let state = Arc::new(BackendState::with_settings(settings));
    let (addr, _handle) = backend::start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .expect("failed to start backend");
    (addr, state)
}

async fn connected_client(
    addr: std::net::SocketAddr,
    persistence: InMemoryStateStore,
    inactivity_timeout: Duration,
) -> ChatClient<InMemoryStateStore> {
    let config = ConnectionConfig {
        inactivity_timeout,
        ..ConnectionConfig::default()
    };
    let client = ChatClient::start(
        WebSocketConnector::new(format!("ws://{addr}/ws")),
        SessionIdentity::new(ClientId::generate()),
        persistence,
        config,
    )
    .await;
    client.connect().await.unwrap();
    tokio::time::timeout(WAIT, client.wait_for_status(ConnectionStatus::Connected))
        .await
        .expect("timed out connecting")
        .unwrap();
    client
}

async fn wait_for_disconnect(client: &ChatClient<InMemoryStateStore>) -> ConnectionState {
    let mut rx = client.subscribe_connection();
    let state = tokio::time::timeout(
        WAIT,
        rx.wait_for(|s| s.status == ConnectionStatus::Disconnected),
    )
    .await
    .expect("timed out waiting for disconnect")
    .unwrap()
    .clone();
    state
}

/// Wait until the conversation state satisfies `pred`.
async fn wait_for_chat(
    client: &ChatClient<InMemoryStateStore>,
    pred: impl Fn(&ChatState) -> bool,
) -> ChatState {
    let mut rx = client.subscribe();
    let state = tokio::time::timeout(WAIT, rx.wait_for(|state| pred(state)))
        .await
        .expect("timed out waiting for chat state")
        .unwrap()
        .clone();
    state
}

#[tokio::test]
async fn missing_pings_end_the_session() {
    let (addr, _state) = start_backend(SessionSettings {
        ping_interval: None,
        reply_delay: Duration::from_millis(10),
        idle_timeout: None,
    })
    .await;
    let client = connected_client(
        addr,
        InMemoryStateStore::new(),
        Duration::from_millis(300),
    )
    .await;

    let state = wait_for_disconnect(&client).await;
    assert_eq!(state.error.as_deref(), Some(SESSION_INACTIVE));
    assert!(state.conversation_id.is_none());

    let chat = wait_for_chat(&client, |s| s.show_email_prompt).await;
    assert_eq!(chat.error.as_deref(), Some(SESSION_INACTIVE));
    assert!(!chat.is_typing);

    client.shutdown().await;
}

#[tokio::test]
async fn pings_keep_a_quiet_session_open() {
    let (addr, _state) = start_backend(SessionSettings {
        ping_interval: Some(Duration::from_millis(100)),
        reply_delay: Duration::from_millis(10),
        idle_timeout: None,
    })
    .await;
    let client = connected_client(
        addr,
        InMemoryStateStore::new(),
        Duration::from_millis(500),
    )
    .await;

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(client.connection_state().is_connected());

    client.shutdown().await;
}

#[tokio::test]
async fn backend_idle_close_ends_the_session() {
    let (addr, _state) = start_backend(SessionSettings {
        ping_interval: Some(Duration::from_millis(50)),
        reply_delay: Duration::from_millis(10),
        idle_timeout: Some(Duration::from_millis(300)),
    })
    .await;
    let client = connected_client(
        addr,
        InMemoryStateStore::new(),
        Duration::from_secs(180),
    )
    .await;

    let state = wait_for_disconnect(&client).await;
    assert_eq!(state.error.as_deref(), Some(SESSION_INACTIVE));

    client.shutdown().await;
}

#[tokio::test]
async fn email_prompt_accepts_valid_address() {
    let (addr, state) = start_backend(SessionSettings {
        ping_interval: None,
        reply_delay: Duration::from_millis(10),
        idle_timeout: None,
    })
    .await;
    let persistence = InMemoryStateStore::new();
    let client = connected_client(addr, persistence, Duration::from_secs(180)).await;

    state.close_all_connections().await;
    wait_for_disconnect(&client).await;
    wait_for_chat(&client, |s| s.show_email_prompt).await;

    let err = client.set_email("not-an-email").await.unwrap_err();
    assert!(err.to_string().contains("not-an-email"));
    let chat = client.snapshot().chat;
    assert!(chat.show_email_prompt);
    assert_eq!(chat.error.as_deref(), Some(INVALID_EMAIL));

    client.set_email("user@example.com").await.unwrap();
    let chat = client.snapshot().chat;
    assert!(!chat.show_email_prompt);
    assert_eq!(chat.email.as_deref(), Some("user@example.com"));
    assert!(chat.error.is_none());

    client.shutdown().await;
}

#[tokio::test]
async fn no_prompt_when_email_is_known() {
    let (addr, state) = start_backend(SessionSettings {
        ping_interval: None,
        reply_delay: Duration::from_millis(10),
        idle_timeout: None,
    })
    .await;
    let persistence = InMemoryStateStore::with_state(PersistedState {
        messages: Vec::new(),
        email: Some("known@example.com".into()),
    });
    let client = connected_client(addr, persistence, Duration::from_secs(180)).await;

    state.close_all_connections().await;
    let connection = wait_for_disconnect(&client).await;
    assert_eq!(connection.error.as_deref(), Some(SESSION_INACTIVE));

    let chat = wait_for_chat(&client, |s| s.error.is_some()).await;
    assert_eq!(chat.error.as_deref(), Some(SESSION_INACTIVE));
    assert!(!chat.show_email_prompt);
    assert_eq!(chat.email.as_deref(), Some("known@example.com"));

    client.shutdown().await;
}
