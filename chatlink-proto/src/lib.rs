//! Shared protocol definitions for the `chatlink` wire format.
//!
//! Frames are JSON objects tagged by a `type` field. See [`frame::Frame`]
//! for the full set of kinds and [`codec`] for text encoding.

pub mod codec;
pub mod frame;
pub mod message;
