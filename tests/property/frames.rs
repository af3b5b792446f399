//! Property-based tests for the frame codec.
//!
//! Uses proptest to verify:
//! 1. Arbitrary text never causes a panic in `decode` (returns `Err` gracefully).
//! 2. Server frames survive encode → decode.
//! 3. Unknown `type` tags are rejected.
//! 4. Server frames parse without the optional `clientId` / `timestamp`.

use chatlink_proto::codec::{self, CodecError};
use chatlink_proto::frame::{Confirm, Frame, ImageStatusUpdate, Response, StatusUpdate};
use chatlink_proto::message::{ActivityStatus, ClientId, ImageStatus, MessageId, Timestamp};
use proptest::prelude::*;

const KNOWN_TYPES: [&str; 10] = [
    "connect",
    "connect_confirm",
    "message",
    "confirm",
    "response",
    "image_status",
    "status",
    "ping",
    "pong",
    "error",
];

fn arb_id() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9-]{1,40}"
}

fn arb_client_id() -> impl Strategy<Value = Option<ClientId>> {
    proptest::option::of(arb_id().prop_map(ClientId::new))
}

fn arb_timestamp() -> impl Strategy<Value = Option<Timestamp>> {
    proptest::option::of(
        (0u32..28, 0u32..24).prop_map(|(d, h)| {
            Timestamp::from_string(format!("2024-05-{:02}T{:02}:00:00.000Z", d + 1, h))
        }),
    )
}

fn arb_image_status() -> impl Strategy<Value = ImageStatus> {
    prop_oneof![
        Just(ImageStatus::Received),
        Just(ImageStatus::Processing),
        Just(ImageStatus::Analyzed),
    ]
}

/// Strategy for frames a backend sends.
fn arb_server_frame() -> impl Strategy<Value = Frame> {
    prop_oneof![
        (arb_id(), arb_client_id(), arb_timestamp()).prop_map(|(id, client_id, timestamp)| {
            Frame::Confirm(Confirm {
                message_id: MessageId::new(id),
                status: "received".into(),
                client_id,
                timestamp,
            })
        }),
        (
            arb_id(),
            proptest::option::of(arb_id()),
            "\\PC{0,200}",
            arb_client_id(),
            arb_timestamp()
        )
            .prop_map(|(id, reply_to, content, client_id, timestamp)| {
                Frame::Response(Response {
                    message_id: MessageId::new(id),
                    reply_to: reply_to.map(MessageId::new),
                    content,
                    client_id,
                    timestamp,
                })
            }),
        (arb_id(), arb_id(), arb_image_status(), arb_client_id()).prop_map(
            |(id, image_id, status, client_id)| {
                Frame::ImageStatus(ImageStatusUpdate {
                    message_id: MessageId::new(id),
                    image_id,
                    status,
                    client_id,
                    timestamp: None,
                })
            }
        ),
        (arb_id(), "[a-z]{1,12}").prop_map(|(id, status)| {
            Frame::Status(StatusUpdate {
                message_id: MessageId::new(id),
                status: ActivityStatus::new(status),
                client_id: None,
                timestamp: None,
            })
        }),
        Just(Frame::ping()),
    ]
}

proptest! {
    #[test]
    fn decode_never_panics(text in "\\PC{0,512}") {
        let _ = codec::decode(&text);
    }

    #[test]
    fn decode_never_panics_on_json_objects(
        kind in "[a-z_]{0,16}",
        field in "[a-zA-Z]{1,12}",
        value in "\\PC{0,32}",
    ) {
        let mut object = serde_json::Map::new();
        object.insert("type".to_string(), kind.into());
        object.insert(field, value.into());
        let _ = codec::decode(&serde_json::Value::Object(object).to_string());
    }

    #[test]
    fn server_frames_survive_encode_decode(frame in arb_server_frame()) {
        let text = codec::encode(&frame).unwrap();
        prop_assert_eq!(codec::decode(&text).unwrap(), frame);
    }

    #[test]
    fn unknown_type_is_rejected(kind in "[a-z_]{1,16}") {
        prop_assume!(!KNOWN_TYPES.contains(&kind.as_str()));
        let text = serde_json::json!({ "type": kind, "messageId": "m1" }).to_string();
        prop_assert!(matches!(codec::decode(&text), Err(CodecError::Malformed(_))));
    }

    #[test]
    fn confirm_parses_without_header_fields(id in arb_id()) {
        let text = serde_json::json!({
            "type": "confirm",
            "messageId": id,
            "status": "received",
        })
        .to_string();
        match codec::decode(&text).unwrap() {
            Frame::Confirm(c) => {
                prop_assert_eq!(c.message_id.as_str(), id.as_str());
                prop_assert!(c.client_id.is_none());
                prop_assert!(c.timestamp.is_none());
            }
            other => prop_assert!(false, "expected confirm, got {:?}", other),
        }
    }
}

#[test]
fn oversized_frame_is_rejected() {
    let text = "x".repeat(codec::MAX_FRAME_SIZE + 1);
    assert!(matches!(
        codec::decode(&text),
        Err(CodecError::TooLarge { .. })
    ));
}
