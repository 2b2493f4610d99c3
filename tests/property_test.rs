// tests/property_test.rs

//! Property-based tests for the wire-format layer: whatever the pooler
//! emits, a decoder on the other side recovers intact.

use bytes::BytesMut;
use pgrelay::core::protocol::message::{Message, MessageCodec};
use pgrelay::core::protocol::startup::{self, FirstPacket, StartupPacket};
use proptest::prelude::*;

/// Parameter values that survive the startup packet's NUL-terminated
/// key/value encoding.
fn param_value() -> impl Strategy<Value = String> {
    // Printable ASCII; NUL terminates fields in the startup encoding.
    "[ -~]{0,64}"
}

fn identifier() -> impl Strategy<Value = String> {
    "[a-z_][a-z0-9_]{0,30}"
}

proptest! {
    #[test]
    fn prop_startup_packet_roundtrip(
        user in identifier(),
        database in identifier(),
        options in param_value(),
    ) {
        let packet = StartupPacket::new(&user, &database).with_param("options", &options);
        let bytes = packet.to_bytes();

        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let parsed = rt.block_on(async {
            let mut reader = &bytes[..];
            startup::read_first_packet(&mut reader).await.unwrap()
        });

        match parsed {
            FirstPacket::Startup(parsed) => {
                prop_assert_eq!(parsed.user(), user.as_str());
                prop_assert_eq!(parsed.database(), database.as_str());
                prop_assert_eq!(parsed.options(), Some(options.as_str()));
            }
            other => return Err(TestCaseError::fail(format!("unexpected packet {other:?}"))),
        }
    }

    #[test]
    fn prop_message_codec_roundtrip(tag in 0x21u8..0x7f, body in proptest::collection::vec(any::<u8>(), 0..512)) {
        use tokio_util::codec::{Decoder, Encoder};

        let original = Message::new(tag, bytes::Bytes::from(body));
        let mut codec = MessageCodec;
        let mut buf = BytesMut::new();
        codec.encode(original.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();

        prop_assert_eq!(decoded, original);
        prop_assert!(buf.is_empty());
    }

    #[test]
    fn prop_message_codec_handles_split_input(body in proptest::collection::vec(any::<u8>(), 0..256), split in 0usize..260) {
        use tokio_util::codec::{Decoder, Encoder};

        let original = Message::new(b'Q', bytes::Bytes::from(body));
        let mut codec = MessageCodec;
        let mut full = BytesMut::new();
        codec.encode(original.clone(), &mut full).unwrap();

        let split = split.min(full.len());
        let mut buf = BytesMut::from(&full[..split]);
        // A partial frame never errors and never yields a message.
        if split < full.len() {
            prop_assert!(codec.decode(&mut buf).unwrap().is_none());
            buf.extend_from_slice(&full[split..]);
        }
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        prop_assert_eq!(decoded, original);
    }
}
