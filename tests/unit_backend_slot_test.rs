use bytes::{BufMut, BytesMut};
use pgrelay::core::backend::slot::BackendSlot;
use pgrelay::core::credentials::Secret;
use pgrelay::core::protocol::message::{Message, tags};
use std::collections::BTreeMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

fn typed(tag: u8, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 + body.len());
    out.push(tag);
    out.extend_from_slice(&(4 + body.len() as i32).to_be_bytes());
    out.extend_from_slice(body);
    out
}

/// A minimal scripted backend: trust auth, fixed key data, `SELECT 1`
/// replies to every Query, clean close on Terminate.
async fn fake_backend(listener: TcpListener) {
    let (mut socket, _) = listener.accept().await.unwrap();

    // Startup packet: length-prefixed, untyped.
    let len = socket.read_i32().await.unwrap() as usize;
    let mut startup = vec![0u8; len - 4];
    socket.read_exact(&mut startup).await.unwrap();

    let mut greeting = BytesMut::new();
    greeting.extend_from_slice(&typed(b'R', &0i32.to_be_bytes())); // AuthenticationOk
    let mut param = BytesMut::new();
    param.extend_from_slice(b"server_version\017.2\0");
    greeting.extend_from_slice(&typed(b'S', &param));
    let mut key_data = BytesMut::new();
    key_data.put_i32(4242);
    key_data.put_i32(31337);
    greeting.extend_from_slice(&typed(b'K', &key_data));
    greeting.extend_from_slice(&typed(b'Z', b"I"));
    socket.write_all(&greeting).await.unwrap();

    loop {
        let tag = match socket.read_u8().await {
            Ok(tag) => tag,
            Err(_) => return,
        };
        let len = socket.read_i32().await.unwrap() as usize;
        let mut body = vec![0u8; len - 4];
        socket.read_exact(&mut body).await.unwrap();

        match tag {
            b'Q' => {
                let mut reply = BytesMut::new();
                reply.extend_from_slice(&typed(b'C', b"SELECT 1\0"));
                reply.extend_from_slice(&typed(b'Z', b"I"));
                socket.write_all(&reply).await.unwrap();
            }
            b'X' => return,
            _ => panic!("fake backend got unexpected '{}'", tag as char),
        }
    }
}

async fn open_slot() -> (BackendSlot, BTreeMap<String, String>, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = tokio::spawn(fake_backend(listener));

    let mut params = BTreeMap::new();
    let slot = BackendSlot::open(
        0,
        "127.0.0.1",
        port,
        "alice",
        "orders",
        &Secret::Plain(String::new()),
        &mut params,
    )
    .await
    .unwrap();
    (slot, params, server)
}

#[tokio::test]
async fn test_open_records_key_data_and_parameters() {
    let (slot, params, server) = open_slot().await;

    assert_eq!(slot.pid(), 4242);
    assert_eq!(slot.cancel_key(), 31337);
    assert_eq!(params.get("server_version").map(String::as_str), Some("17.2"));
    assert_eq!(slot.startup().user(), "alice");
    assert_eq!(slot.startup().database(), "orders");

    drop(slot);
    server.abort();
}

#[tokio::test]
async fn test_simple_query_roundtrip() {
    let (mut slot, _params, server) = open_slot().await;

    slot.send(Message::query("SELECT 1")).await.unwrap();
    let reply = slot.recv().await.unwrap();
    assert_eq!(reply.tag, tags::COMMAND_COMPLETE);
    assert_eq!(reply.command_tag().unwrap(), "SELECT 1");
    let ready = slot.recv().await.unwrap();
    assert_eq!(ready.ready_status().unwrap(), b'I');

    slot.close().await;
    server.await.unwrap();
}

#[tokio::test]
async fn test_drain_until_ready() {
    let (mut slot, _params, server) = open_slot().await;

    slot.send(Message::query("SELECT 1")).await.unwrap();
    assert_eq!(slot.drain_until_ready().await.unwrap(), b'I');

    slot.close().await;
    server.await.unwrap();
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let (mut slot, _params, server) = open_slot().await;
    slot.close().await;
    slot.close().await;
    server.await.unwrap();
}

#[tokio::test]
async fn test_connect_refused_error_kind() {
    // Bind and drop to find a port with nothing listening.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let mut params = BTreeMap::new();
    let err = BackendSlot::open(
        7,
        "127.0.0.1",
        port,
        "alice",
        "orders",
        &Secret::Plain(String::new()),
        &mut params,
    )
    .await
    .unwrap_err();
    assert!(matches!(
        err,
        pgrelay::core::RelayError::ConnectRefused(7)
    ));
}

#[tokio::test]
async fn test_auth_failure_is_fatal() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let len = socket.read_i32().await.unwrap() as usize;
        let mut startup = vec![0u8; len - 4];
        socket.read_exact(&mut startup).await.unwrap();

        // ErrorResponse with the invalid-authorization SQLSTATE class.
        let mut body = BytesMut::new();
        body.extend_from_slice(b"SFATAL\0C28P01\0Mpassword authentication failed\0\0");
        socket.write_all(&typed(b'E', &body)).await.unwrap();
    });

    let mut params = BTreeMap::new();
    let err = BackendSlot::open(
        0,
        "127.0.0.1",
        port,
        "alice",
        "orders",
        &Secret::Plain("bad".into()),
        &mut params,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, pgrelay::core::RelayError::AuthFailed(_)));
    server.await.unwrap();
}

/// The cancel-request path writes the magic packet on a fresh connection.
#[tokio::test]
async fn test_cancel_request_wire_format() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let len = socket.read_i32().await.unwrap();
        assert_eq!(len, 16);
        let code = socket.read_i32().await.unwrap();
        assert_eq!(code, 80877102);
        assert_eq!(socket.read_i32().await.unwrap(), 4242);
        assert_eq!(socket.read_i32().await.unwrap(), 31337);
    });

    BackendSlot::cancel_request("127.0.0.1", port, 4242, 31337).await;
    server.await.unwrap();
}

#[tokio::test]
async fn test_socket_liveness_check() {
    let (slot, _params, server) = open_slot().await;
    assert!(slot.is_alive());

    // Kill the fake backend; the socket goes readable-EOF and the liveness
    // check fails.
    server.abort();
    let _ = server.await;
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert!(!slot.is_alive());
}
