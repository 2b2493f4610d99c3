use bytes::BytesMut;
use pgrelay::core::protocol::message::{Message, MessageCodec, tags};
use pgrelay::core::protocol::startup::{
    self, CANCEL_REQUEST_CODE, FirstPacket, SSL_REQUEST_CODE, StartupPacket,
};
use tokio_util::codec::{Decoder, Encoder};

#[test]
fn test_message_codec_roundtrip() {
    let mut codec = MessageCodec;
    let original = Message::query("SELECT 1");

    let mut buf = BytesMut::new();
    codec.encode(original.clone(), &mut buf).unwrap();
    let decoded = codec.decode(&mut buf).unwrap().unwrap();

    assert_eq!(decoded, original);
    assert!(buf.is_empty());
}

#[test]
fn test_message_codec_waits_for_full_frame() {
    let mut codec = MessageCodec;
    let bytes = Message::query("SELECT pg_sleep(1)").to_bytes();

    // Feed everything but the last byte.
    let mut buf = BytesMut::from(&bytes[..bytes.len() - 1]);
    assert!(codec.decode(&mut buf).unwrap().is_none());

    buf.extend_from_slice(&bytes[bytes.len() - 1..]);
    assert!(codec.decode(&mut buf).unwrap().is_some());
}

#[test]
fn test_message_codec_rejects_bad_length() {
    let mut codec = MessageCodec;
    let mut buf = BytesMut::from(&b"Q\x00\x00\x00\x01"[..]);
    assert!(codec.decode(&mut buf).is_err());
}

#[test]
fn test_query_view() {
    let msg = Message::query("SELECT 1");
    assert_eq!(msg.as_query().unwrap(), "SELECT 1");
}

#[test]
fn test_ready_for_query_status() {
    let msg = Message::ready_for_query(b'T');
    assert_eq!(msg.tag, tags::READY_FOR_QUERY);
    assert_eq!(msg.ready_status().unwrap(), b'T');
}

#[test]
fn test_command_complete_tag() {
    let msg = Message::command_complete("SET");
    assert_eq!(msg.command_tag().unwrap(), "SET");
}

#[test]
fn test_backend_key_data_view() {
    let msg = Message::backend_key_data(4242, -7);
    assert_eq!(msg.as_backend_key_data().unwrap(), (4242, -7));
}

#[test]
fn test_parameter_status_view() {
    let msg = Message::parameter_status("application_name", "foo");
    assert_eq!(
        msg.as_parameter_status().unwrap(),
        ("application_name", "foo")
    );
}

#[test]
fn test_error_response_fields() {
    let msg = Message::error_response("FATAL", "28P01", "password authentication failed");
    let (severity, code, text) = msg.error_fields().unwrap();
    assert_eq!(severity, "FATAL");
    assert_eq!(code, "28P01");
    assert_eq!(text, "password authentication failed");
}

#[tokio::test]
async fn test_startup_packet_roundtrip() {
    let packet = StartupPacket::new("alice", "orders").with_param("options", "-c geqo=off");
    let bytes = packet.to_bytes();

    let mut reader = &bytes[..];
    let parsed = startup::read_first_packet(&mut reader).await.unwrap();
    match parsed {
        FirstPacket::Startup(parsed) => {
            assert_eq!(parsed.user(), "alice");
            assert_eq!(parsed.database(), "orders");
            assert_eq!(parsed.options(), Some("-c geqo=off"));
            assert_eq!(parsed.protocol_major(), 3);
        }
        other => panic!("expected startup packet, got {other:?}"),
    }
}

#[tokio::test]
async fn test_database_defaults_to_user() {
    let mut packet = StartupPacket::new("bob", "bob");
    packet.params.remove("database");
    let bytes = packet.to_bytes();

    let mut reader = &bytes[..];
    match startup::read_first_packet(&mut reader).await.unwrap() {
        FirstPacket::Startup(parsed) => assert_eq!(parsed.database(), "bob"),
        other => panic!("expected startup packet, got {other:?}"),
    }
}

#[tokio::test]
async fn test_cancel_request_parses() {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&16i32.to_be_bytes());
    bytes.extend_from_slice(&CANCEL_REQUEST_CODE.to_be_bytes());
    bytes.extend_from_slice(&77i32.to_be_bytes());
    bytes.extend_from_slice(&12345i32.to_be_bytes());

    let mut reader = &bytes[..];
    match startup::read_first_packet(&mut reader).await.unwrap() {
        FirstPacket::Cancel { pid, key } => {
            assert_eq!(pid, 77);
            assert_eq!(key, 12345);
        }
        other => panic!("expected cancel request, got {other:?}"),
    }
}

#[tokio::test]
async fn test_ssl_request_parses() {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&8i32.to_be_bytes());
    bytes.extend_from_slice(&SSL_REQUEST_CODE.to_be_bytes());

    let mut reader = &bytes[..];
    assert_eq!(
        startup::read_first_packet(&mut reader).await.unwrap(),
        FirstPacket::SslRequest
    );
}

#[tokio::test]
async fn test_startup_requires_user() {
    let mut packet = StartupPacket::new("x", "db");
    packet.params.remove("user");
    let bytes = packet.to_bytes();

    let mut reader = &bytes[..];
    assert!(startup::read_first_packet(&mut reader).await.is_err());
}

#[tokio::test]
async fn test_unknown_protocol_version_rejected() {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&8i32.to_be_bytes());
    bytes.extend_from_slice(&(2i32 << 16).to_be_bytes());

    let mut reader = &bytes[..];
    assert!(startup::read_first_packet(&mut reader).await.is_err());
}
