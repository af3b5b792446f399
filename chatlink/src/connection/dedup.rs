//! Bounded cache of recently processed inbound frames.
//!
//! A backend may redeliver frames after a hiccup. Every frame that carries
//! application meaning gets a [`FrameKey`]; a frame whose key was already
//! processed is discarded. Keys are per frame, not per message id: a single
//! message legitimately produces a `confirm`, several `image_status` and
//! `status` updates, and a `response`.

use std::collections::{HashSet, VecDeque};
use std::fmt;

use chatlink_proto::frame::Frame;

/// Default number of keys remembered before the oldest is evicted.
pub const DEFAULT_DEDUP_CAPACITY: usize = 1000;

/// Identity of one inbound frame for duplicate detection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FrameKey(String);

impl FrameKey {
    /// Build the key for `frame`, or `None` for frames that are never
    /// deduplicated (handshake, heartbeat, errors, outbound kinds).
    ///
    /// `status` frames carry no key: a message may go `thinking`, `idle`,
    /// `thinking` again, and applying one twice is harmless.
    #[must_use]
    pub fn for_frame(frame: &Frame) -> Option<Self> {
        let key = match frame {
            Frame::Confirm(c) => format!("confirm:{}", c.message_id),
            Frame::Response(r) => format!("response:{}", r.message_id),
            Frame::ImageStatus(s) => {
                format!("image_status:{}:{}:{}", s.message_id, s.image_id, s.status)
            }
            Frame::Connect(_)
            | Frame::ConnectConfirm(_)
            | Frame::Message(_)
            | Frame::Ping(_)
            | Frame::Pong(_)
            | Frame::Status(_)
            | Frame::Error(_) => return None,
        };
        Some(Self(key))
    }

    /// The key text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FrameKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// FIFO-evicting set of processed [`FrameKey`]s.
///
/// `len()` never exceeds the capacity. Inserting into a full cache drops
/// the oldest key first.
#[derive(Debug)]
pub struct ProcessedFrameCache {
    order: VecDeque<FrameKey>,
    seen: HashSet<FrameKey>,
    capacity: usize,
}

impl ProcessedFrameCache {
    /// Create a cache holding at most `capacity` keys (minimum 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Whether `key` was processed recently.
    #[must_use]
    pub fn contains(&self, key: &FrameKey) -> bool {
        self.seen.contains(key)
    }

    /// Record `key` as processed. Returns `false` if it was already present.
    pub fn insert(&mut self, key: FrameKey) -> bool {
        if self.seen.contains(&key) {
            return false;
        }
        if self.order.len() == self.capacity
            && let Some(oldest) = self.order.pop_front()
        {
            self.seen.remove(&oldest);
        }
        self.seen.insert(key.clone());
        self.order.push_back(key);
        true
    }

    /// Forget every key.
    pub fn clear(&mut self) {
        self.order.clear();
        self.seen.clear();
    }

    /// Number of keys currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Maximum number of keys held.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for ProcessedFrameCache {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_CAPACITY)
    }
}
