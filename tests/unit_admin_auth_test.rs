use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use pgrelay::server::admin::auth::{authorize, issue_token, validate_token};
use std::time::Duration;

const SECRET: &str = "topsecret";

#[test]
fn test_token_roundtrip() {
    let token = issue_token(SECRET, "admin", Duration::from_secs(60)).unwrap();
    let subject = validate_token(SECRET, &token).unwrap();
    assert_eq!(subject, "admin");
}

#[test]
fn test_token_with_wrong_secret_rejected() {
    let token = issue_token(SECRET, "admin", Duration::from_secs(60)).unwrap();
    assert!(validate_token("othersecret", &token).is_err());
}

#[test]
fn test_tampered_payload_rejected() {
    let token = issue_token(SECRET, "admin", Duration::from_secs(60)).unwrap();
    let mut parts: Vec<&str> = token.split('.').collect();
    let forged = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .encode(br#"{"sub":"root","exp":9999999999}"#);
    parts[1] = forged.as_str();
    let forged_token = parts.join(".");
    assert!(validate_token(SECRET, &forged_token).is_err());
}

#[test]
fn test_malformed_tokens_rejected() {
    assert!(validate_token(SECRET, "nodots").is_err());
    assert!(validate_token(SECRET, "a.b").is_err());
    assert!(validate_token(SECRET, "a.b.c.d").is_err());
    assert!(validate_token(SECRET, "!!!.###.$$$").is_err());
}

#[test]
fn test_expired_token_rejected() {
    let token = issue_token(SECRET, "admin", Duration::from_secs(0)).unwrap();
    std::thread::sleep(Duration::from_millis(1500));
    assert!(validate_token(SECRET, &token).is_err());
}

#[test]
fn test_authorize_bearer() {
    let token = issue_token(SECRET, "admin", Duration::from_secs(60)).unwrap();
    let header = format!("Bearer {token}");
    assert_eq!(
        authorize(Some(&header), SECRET, "admin", "pw").unwrap(),
        "admin"
    );
}

#[test]
fn test_authorize_basic() {
    let header = format!("Basic {}", B64.encode("admin:pw"));
    assert_eq!(
        authorize(Some(&header), SECRET, "admin", "pw").unwrap(),
        "admin"
    );

    let bad = format!("Basic {}", B64.encode("admin:wrong"));
    assert!(authorize(Some(&bad), SECRET, "admin", "pw").is_err());
}

#[test]
fn test_authorize_requires_header_and_known_scheme() {
    assert!(authorize(None, SECRET, "admin", "pw").is_err());
    assert!(authorize(Some("Digest abc"), SECRET, "admin", "pw").is_err());
}

#[test]
fn test_authorize_rejects_unconfigured_mechanisms() {
    // No password configured: basic auth unavailable.
    let header = format!("Basic {}", B64.encode("admin:"));
    assert!(authorize(Some(&header), SECRET, "admin", "").is_err());

    // No secret configured: bearer unavailable.
    let token = issue_token(SECRET, "admin", Duration::from_secs(60)).unwrap();
    let header = format!("Bearer {token}");
    assert!(authorize(Some(&header), "", "admin", "pw").is_err());
}
