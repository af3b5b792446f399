//! `chatlink`: client core for a persistent chat session over WebSockets.
//!
//! - [`session`]: durable client id and per-connection conversation id
//! - [`transport`]: message-oriented transports (WebSocket, loopback)
//! - [`connection`]: lifecycle state machine, heartbeat, acks and dedup
//! - [`store`]: reconciled conversation state and its persistence
//! - [`client`]: the [`ChatClient`](client::ChatClient) context object
//! - [`config`]: layered CLI / TOML / default configuration

pub mod client;
pub mod config;
pub mod connection;
pub mod session;
pub mod store;
pub mod transport;
