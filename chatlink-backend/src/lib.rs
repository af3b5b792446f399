//! `chatlink` reference backend library.
//!
//! Exposes the backend server for use in tests and embedding. The server
//! accepts WebSocket connections on `/ws`, grants a conversation per
//! connection, acknowledges every message, reports typing and image
//! progress, replies, and pings each session on an interval.

pub mod backend;
pub mod config;
