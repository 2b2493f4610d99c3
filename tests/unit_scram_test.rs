use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use pgrelay::core::credentials::Secret;
use pgrelay::core::protocol::auth::md5_response;
use pgrelay::core::protocol::scram::{ScramClient, ScramKeys, ScramServer, ScramVerifier};

/// Runs a complete client/server exchange and returns the server-final
/// payload when every step succeeded.
fn run_exchange(client_password: &str, verifier: ScramVerifier) -> Result<(), String> {
    let mut client = ScramClient::new(client_password);
    let mut server = ScramServer::new(verifier);

    let client_first = client.client_first();
    let server_first = server
        .handle_client_first(&client_first)
        .map_err(|e| e.to_string())?;
    let client_final = client
        .handle_server_first(&server_first)
        .map_err(|e| e.to_string())?;
    let server_final = server
        .handle_client_final(&client_final)
        .map_err(|e| e.to_string())?;
    client
        .verify_server_final(&server_final)
        .map_err(|e| e.to_string())
}

#[test]
fn test_exchange_succeeds_with_matching_password() {
    let verifier = ScramVerifier::from_password("hunter2");
    run_exchange("hunter2", verifier).unwrap();
}

#[test]
fn test_exchange_fails_with_wrong_password() {
    let verifier = ScramVerifier::from_password("hunter2");
    let err = run_exchange("wrong", verifier).unwrap_err();
    assert!(err.contains("authentication failed"), "got: {err}");
}

#[test]
fn test_verifier_parse_roundtrip() {
    let salt = b"0123456789abcdef";
    let keys = ScramKeys::derive("pw", salt, 4096);
    let raw = format!(
        "SCRAM-SHA-256$4096:{}${}:{}",
        B64.encode(salt),
        B64.encode(keys.stored_key),
        B64.encode(keys.server_key)
    );

    let verifier = ScramVerifier::parse(&raw).unwrap();
    assert_eq!(verifier.iterations, 4096);
    assert_eq!(verifier.salt, salt);
    assert_eq!(verifier.keys.stored_key, keys.stored_key);

    // A verifier derived from the password authenticates that password.
    run_exchange("pw", verifier).unwrap();
}

#[test]
fn test_verifier_parse_rejects_garbage() {
    assert!(ScramVerifier::parse("md5abc").is_err());
    assert!(ScramVerifier::parse("SCRAM-SHA-256$notanumber:c2FsdA==$a:b").is_err());
    assert!(ScramVerifier::parse("SCRAM-SHA-256$4096").is_err());
}

#[test]
fn test_md5_response_same_for_plain_and_stored() {
    // Stored md5 secrets are md5(password + user); responses to a salt
    // challenge must match the plaintext-derived one.
    use md5::{Digest, Md5};
    let mut h = Md5::new();
    h.update(b"s3cretalice");
    let stored = format!("md5{}", hex::encode(h.finalize()));

    let salt = [1, 2, 3, 4];
    let from_plain =
        md5_response("alice", &Secret::Plain("s3cret".into()), salt).unwrap();
    let from_stored = md5_response("alice", &Secret::Md5(stored), salt).unwrap();
    assert_eq!(from_plain, from_stored);
    assert!(from_plain.starts_with("md5"));
    assert_eq!(from_plain.len(), 35);
}

#[test]
fn test_md5_response_requires_usable_secret() {
    let verifier = Secret::ScramVerifier("SCRAM-SHA-256$4096:a$b:c".into());
    assert!(md5_response("alice", &verifier, [0; 4]).is_err());
}
