use pgrelay::core::credentials::{CredentialStore, Secret};
use std::io::Write;
use tempfile::NamedTempFile;

fn store_from(contents: &str) -> (CredentialStore, NamedTempFile) {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    let store = CredentialStore::load(file.path()).unwrap();
    (store, file)
}

#[test]
fn test_prefixes_select_secret_kind() {
    let md5 = format!("md5{}", "a".repeat(32));
    let (store, _file) = store_from(&format!(
        "alice:TEXTs3cret\n\
         bob:{md5}\n\
         carol:SCRAM-SHA-256$4096:c2FsdA==$c3Q=:c2s=\n\
         dave:AESdeadbeef\n\
         erin:plainpw\n"
    ));

    assert_eq!(store.lookup("alice"), Some(Secret::Plain("s3cret".into())));
    assert_eq!(store.lookup("bob"), Some(Secret::Md5(md5)));
    assert!(matches!(
        store.lookup("carol"),
        Some(Secret::ScramVerifier(v)) if v.starts_with("SCRAM-SHA-256$")
    ));
    assert!(matches!(store.lookup("dave"), Some(Secret::Aes(_))));
    // Unprefixed secrets are treated as plaintext.
    assert_eq!(store.lookup("erin"), Some(Secret::Plain("plainpw".into())));
}

#[test]
fn test_aes_secrets_rejected_at_resolution() {
    let (store, _file) = store_from("dave:AESdeadbeef\n");
    let err = store.resolve("dave").unwrap_err();
    assert!(err.to_string().contains("AES"));
}

#[test]
fn test_unknown_user_fails_resolution() {
    let (store, _file) = store_from("alice:TEXTpw\n");
    assert!(store.resolve("nobody").is_err());
}

#[test]
fn test_comments_and_malformed_lines_skipped() {
    let (store, _file) = store_from("# comment\n\nmalformed-line\nalice:TEXTpw\n");
    assert!(store.lookup("malformed-line").is_none());
    assert!(store.lookup("alice").is_some());
}

#[test]
fn test_reload_picks_up_changes() {
    let (store, mut file) = store_from("alice:TEXTold\n");
    assert_eq!(store.lookup("alice"), Some(Secret::Plain("old".into())));

    file.as_file_mut().set_len(0).unwrap();
    use std::io::Seek;
    file.as_file_mut().rewind().unwrap();
    file.write_all(b"alice:TEXTnew\nbob:TEXTpw\n").unwrap();
    file.flush().unwrap();

    let count = store.reload().unwrap();
    assert_eq!(count, 2);
    assert_eq!(store.lookup("alice"), Some(Secret::Plain("new".into())));
}

#[test]
fn test_empty_store_misses() {
    let store = CredentialStore::empty();
    assert!(store.lookup("anyone").is_none());
    assert_eq!(store.reload().unwrap(), 0);
}

#[test]
fn test_md5_requires_exact_shape() {
    // 35 chars starting with md5 is an md5 secret; anything else is plain.
    let exact = format!("md5{}", "0".repeat(32));
    assert!(matches!(Secret::parse(&exact), Secret::Md5(_)));
    assert!(matches!(Secret::parse("md5short"), Secret::Plain(_)));
}
