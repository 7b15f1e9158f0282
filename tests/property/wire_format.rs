#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Property-based tests for the broker wire format.
//!
//! Uses proptest to verify:
//! 1. Any record with textual or numeric ids survives a `Send` frame round-trip.
//! 2. Arbitrary text never causes a panic in `frame::decode`.
//! 3. Content validation agrees with the trimmed-emptiness rule.

use courier_proto::frame::{self, Frame};
use courier_proto::message::{
    ClientSeq, MAX_CONTENT_LEN, MessageId, MessageRecord, UserId, ValidationError,
    validate_content,
};
use courier_proto::topic;
use proptest::prelude::*;

fn arb_user_id() -> impl Strategy<Value = UserId> {
    prop_oneof![
        "[a-z0-9]{1,12}".prop_map(UserId::new),
        any::<u32>().prop_map(|n| UserId::new(n.to_string())),
    ]
}

fn arb_record() -> impl Strategy<Value = MessageRecord> {
    (
        proptest::option::of("[a-z0-9-]{1,24}".prop_map(MessageId::new)),
        arb_user_id(),
        arb_user_id(),
        "[^\x00]{1,256}",
        proptest::option::of(any::<u64>().prop_map(ClientSeq::new)),
    )
        .prop_map(|(id, sender_id, recipient_id, content, client_seq)| MessageRecord {
            id,
            sender_id,
            recipient_id,
            content,
            client_seq,
            chat_id: None,
        })
}

proptest! {
    #[test]
    fn send_frame_round_trip(record in arb_record()) {
        let frame = Frame::Send {
            destination: topic::PUBLISH_DESTINATION.to_string(),
            body: record,
        };
        let text = frame::encode(&frame).unwrap();
        prop_assert_eq!(frame::decode(&text).unwrap(), frame);
    }

    #[test]
    fn decode_never_panics(text in ".{0,512}") {
        let _ = frame::decode(&text);
    }

    #[test]
    fn whitespace_only_content_is_rejected(ws in "[ \t\r\n]{0,64}") {
        prop_assert_eq!(validate_content(&ws), Err(ValidationError::Empty));
    }

    #[test]
    fn content_with_a_visible_char_is_accepted(
        pad in "[ \t]{0,8}",
        body in "[a-zA-Z0-9]{1,128}",
    ) {
        let content = format!("{pad}{body}{pad}");
        prop_assert!(content.len() <= MAX_CONTENT_LEN);
        prop_assert!(validate_content(&content).is_ok());
    }

    #[test]
    fn user_topic_parses_back(user in "[a-z0-9]{1,16}") {
        let user = UserId::new(user);
        prop_assert_eq!(topic::parse_user_messages(&topic::user_messages(&user)), Some(user));
    }
}
