// src/core/credentials.rs

//! The pool password store: `username:secret` lines where a prefix selects
//! the secret format (`md5`, `SCRAM-SHA-256$`, `TEXT`, `AES`). Secrets are
//! used both to authenticate frontends and to authenticate the pooler
//! against backends on the frontend's behalf.

use crate::core::RelayError;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const MD5_PREFIX: &str = "md5";
const SCRAM_PREFIX: &str = "SCRAM-SHA-256$";
const TEXT_PREFIX: &str = "TEXT";
const AES_PREFIX: &str = "AES";

/// One stored secret, classified by its prefix.
#[derive(Debug, Clone, PartialEq)]
pub enum Secret {
    /// A plaintext password (`TEXT` prefix or no recognized prefix).
    Plain(String),
    /// `md5` + hex of `md5(password + username)`.
    Md5(String),
    /// A full PostgreSQL SCRAM verifier string.
    ScramVerifier(String),
    /// AES-encrypted secret. Recognized but not decryptable; resolution
    /// fails with a configuration error.
    Aes(String),
}

impl Secret {
    pub fn parse(raw: &str) -> Self {
        if let Some(rest) = raw.strip_prefix(TEXT_PREFIX) {
            Secret::Plain(rest.to_string())
        } else if raw.starts_with(SCRAM_PREFIX) {
            Secret::ScramVerifier(raw.to_string())
        } else if raw.len() == 35 && raw.starts_with(MD5_PREFIX) {
            Secret::Md5(raw.to_string())
        } else if let Some(rest) = raw.strip_prefix(AES_PREFIX) {
            Secret::Aes(rest.to_string())
        } else {
            Secret::Plain(raw.to_string())
        }
    }

    /// The plaintext password, when the format carries one.
    pub fn plaintext(&self) -> Option<&str> {
        match self {
            Secret::Plain(p) => Some(p),
            _ => None,
        }
    }
}

/// In-memory view of the pool password file, reloadable at runtime.
#[derive(Debug, Default)]
pub struct CredentialStore {
    path: Option<PathBuf>,
    entries: RwLock<HashMap<String, Secret>>,
}

impl CredentialStore {
    /// An empty store; every lookup misses. Used when `pool_passwd` is unset.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Loads the store from the password file.
    pub fn load(path: &Path) -> Result<Self, RelayError> {
        let entries = parse_file(path)?;
        info!(
            "Loaded {} credential entries from {}",
            entries.len(),
            path.display()
        );
        Ok(Self {
            path: Some(path.to_path_buf()),
            entries: RwLock::new(entries),
        })
    }

    /// Re-reads the password file, keeping the old entries if parsing fails.
    pub fn reload(&self) -> Result<usize, RelayError> {
        let Some(path) = &self.path else {
            return Ok(0);
        };
        let entries = parse_file(path)?;
        let count = entries.len();
        *self.entries.write() = entries;
        info!("Reloaded {} credential entries", count);
        Ok(count)
    }

    pub fn lookup(&self, username: &str) -> Option<Secret> {
        self.entries.read().get(username).cloned()
    }

    /// Resolves a secret usable for authentication, rejecting formats the
    /// pooler cannot act on.
    pub fn resolve(&self, username: &str) -> Result<Secret, RelayError> {
        match self.lookup(username) {
            Some(Secret::Aes(_)) => Err(RelayError::ConfigInvalid(format!(
                "credential for '{username}' is AES-encrypted; use md5, SCRAM or TEXT secrets"
            ))),
            Some(secret) => Ok(secret),
            None => Err(RelayError::AuthFailed(format!(
                "no credential entry for user '{username}'"
            ))),
        }
    }

    /// Inserts or replaces an entry directly, bypassing the file.
    pub fn insert(&self, username: &str, secret: Secret) {
        self.entries.write().insert(username.to_string(), secret);
    }
}

fn parse_file(path: &Path) -> Result<HashMap<String, Secret>, RelayError> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        RelayError::ConfigInvalid(format!("cannot read password file '{}': {e}", path.display()))
    })?;

    let mut entries = HashMap::new();
    for (lineno, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((user, secret)) = line.split_once(':') else {
            warn!(
                "Skipping malformed line {} in '{}': missing ':' separator",
                lineno + 1,
                path.display()
            );
            continue;
        };
        entries.insert(user.to_string(), Secret::parse(secret));
    }
    Ok(entries)
}
