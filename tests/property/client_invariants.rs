//! Property-based tests for client-side invariants.
//!
//! Uses proptest to verify:
//! 1. The processed-frame cache never exceeds its capacity and evicts oldest first.
//! 2. Generated message ids are distinct.
//! 3. Message status merges never lower a flag and keep `processed => received => sent`.
//! 4. Image status upserts keep one entry per image holding the latest status.

use std::collections::{HashMap, HashSet, VecDeque};

use chatlink::connection::dedup::{FrameKey, ProcessedFrameCache};
use chatlink::store::model::{Message, MessageStatus};
use chatlink_proto::frame::{Confirm, Frame};
use chatlink_proto::message::{ClientId, ImageStatus, MessageId};
use proptest::prelude::*;

fn confirm_key(id: u16) -> FrameKey {
    let frame = Frame::Confirm(Confirm {
        message_id: MessageId::new(format!("m{id}")),
        status: "received".into(),
        client_id: None,
        timestamp: None,
    });
    FrameKey::for_frame(&frame).unwrap()
}

fn arb_status() -> impl Strategy<Value = MessageStatus> {
    (any::<bool>(), any::<bool>(), any::<bool>()).prop_map(|(sent, received, processed)| {
        MessageStatus {
            sent,
            received,
            processed,
        }
    })
}

fn arb_image_status() -> impl Strategy<Value = ImageStatus> {
    prop_oneof![
        Just(ImageStatus::Received),
        Just(ImageStatus::Processing),
        Just(ImageStatus::Analyzed),
    ]
}

proptest! {
    #[test]
    fn dedup_cache_is_bounded_fifo(
        capacity in 1usize..64,
        ids in prop::collection::vec(0u16..200, 0..400),
    ) {
        let mut cache = ProcessedFrameCache::new(capacity);
        // Reference model: insertion order of distinct live keys.
        let mut model: VecDeque<u16> = VecDeque::new();

        for id in ids {
            let key = confirm_key(id);
            let fresh = cache.insert(key);
            prop_assert_eq!(fresh, !model.contains(&id));
            if fresh {
                if model.len() == capacity {
                    model.pop_front();
                }
                model.push_back(id);
            }
            prop_assert!(cache.len() <= capacity);
            prop_assert_eq!(cache.len(), model.len());
        }

        for id in 0u16..200 {
            prop_assert_eq!(cache.contains(&confirm_key(id)), model.contains(&id));
        }
    }

    #[test]
    fn status_merge_is_monotonic_and_ordered(
        start in arb_status(),
        updates in prop::collection::vec(arb_status(), 0..16),
    ) {
        let mut status = start.normalized();
        for update in updates {
            let next = status.merge(update);
            prop_assert!(!status.sent || next.sent);
            prop_assert!(!status.received || next.received);
            prop_assert!(!status.processed || next.processed);
            prop_assert!(!next.processed || next.received);
            prop_assert!(!next.received || next.sent);
            status = next;
        }
    }

    #[test]
    fn image_upsert_keeps_latest_per_image(
        updates in prop::collection::vec((0u8..5, arb_image_status()), 0..40),
    ) {
        let mut message = Message::user(
            MessageId::new("m1"),
            "look",
            Vec::new(),
            ClientId::new("c1"),
        );
        let mut latest: HashMap<String, ImageStatus> = HashMap::new();

        for (image, status) in updates {
            let image_id = format!("img-{image}");
            message.upsert_image_status(&image_id, status);
            latest.insert(image_id, status);
        }

        prop_assert_eq!(message.image_statuses.len(), latest.len());
        for (image_id, status) in &latest {
            prop_assert_eq!(message.image_status(image_id), Some(*status));
        }
    }
}

#[test]
fn generated_message_ids_are_distinct() {
    let ids: HashSet<MessageId> = (0..10_000).map(|_| MessageId::generate()).collect();
    assert_eq!(ids.len(), 10_000);
}

#[test]
fn generated_client_ids_are_distinct() {
    let ids: HashSet<ClientId> = (0..1_000).map(|_| ClientId::generate()).collect();
    assert_eq!(ids.len(), 1_000);
}
