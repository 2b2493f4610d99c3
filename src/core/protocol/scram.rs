// src/core/protocol/scram.rs

//! SCRAM-SHA-256 (RFC 5802 profile as used by PostgreSQL), both sides:
//! the client exchange the pooler runs against backends, and the server
//! exchange it runs against frontends, including parsing of the
//! `SCRAM-SHA-256$iter:salt$storedkey:serverkey` verifier format found in
//! the pool password file.

use crate::core::RelayError;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

pub const MECHANISM: &str = "SCRAM-SHA-256";
const GS2_HEADER: &str = "n,,";
const CHANNEL_BINDING: &str = "biws"; // base64("n,,")
const NONCE_LEN: usize = 18;
const DEFAULT_ITERATIONS: u32 = 4096;

/// The salted-password derivation `Hi()` from RFC 5802 (PBKDF2-HMAC-SHA256
/// with a single-block output).
fn hi(password: &[u8], salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(password).expect("hmac accepts any key length");
    mac.update(salt);
    mac.update(&[0, 0, 0, 1]);
    let mut block: [u8; 32] = mac.finalize().into_bytes().into();
    let mut result = block;
    for _ in 1..iterations {
        let mut mac = HmacSha256::new_from_slice(password).expect("hmac accepts any key length");
        mac.update(&block);
        block = mac.finalize().into_bytes().into();
        for (r, b) in result.iter_mut().zip(block.iter()) {
            *r ^= b;
        }
    }
    result
}

fn hmac(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

fn random_nonce() -> String {
    let mut raw = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut raw);
    B64.encode(raw)
}

/// Keys derived from a salted password.
#[derive(Debug, Clone)]
pub struct ScramKeys {
    pub stored_key: [u8; 32],
    pub server_key: [u8; 32],
}

impl ScramKeys {
    pub fn derive(password: &str, salt: &[u8], iterations: u32) -> Self {
        let salted = hi(password.as_bytes(), salt, iterations);
        let client_key = hmac(&salted, b"Client Key");
        Self {
            stored_key: sha256(&client_key),
            server_key: hmac(&salted, b"Server Key"),
        }
    }
}

/// A parsed PostgreSQL SCRAM verifier.
#[derive(Debug, Clone)]
pub struct ScramVerifier {
    pub iterations: u32,
    pub salt: Vec<u8>,
    pub keys: ScramKeys,
}

impl ScramVerifier {
    /// Parses `SCRAM-SHA-256$<iter>:<salt>$<storedkey>:<serverkey>`.
    pub fn parse(secret: &str) -> Result<Self, RelayError> {
        let rest = secret
            .strip_prefix("SCRAM-SHA-256$")
            .ok_or_else(|| RelayError::AuthFailed("not a SCRAM verifier".into()))?;
        let (params, keys) = rest
            .split_once('$')
            .ok_or_else(|| RelayError::AuthFailed("malformed SCRAM verifier".into()))?;
        let (iter_str, salt_b64) = params
            .split_once(':')
            .ok_or_else(|| RelayError::AuthFailed("malformed SCRAM verifier".into()))?;
        let (stored_b64, server_b64) = keys
            .split_once(':')
            .ok_or_else(|| RelayError::AuthFailed("malformed SCRAM verifier".into()))?;

        let iterations: u32 = iter_str
            .parse()
            .map_err(|_| RelayError::AuthFailed("bad SCRAM iteration count".into()))?;
        let salt = B64
            .decode(salt_b64)
            .map_err(|_| RelayError::AuthFailed("bad SCRAM salt encoding".into()))?;
        let stored_key: [u8; 32] = B64
            .decode(stored_b64)
            .ok()
            .and_then(|v| v.try_into().ok())
            .ok_or_else(|| RelayError::AuthFailed("bad SCRAM stored key".into()))?;
        let server_key: [u8; 32] = B64
            .decode(server_b64)
            .ok()
            .and_then(|v| v.try_into().ok())
            .ok_or_else(|| RelayError::AuthFailed("bad SCRAM server key".into()))?;

        Ok(Self {
            iterations,
            salt,
            keys: ScramKeys {
                stored_key,
                server_key,
            },
        })
    }

    /// Builds a verifier from a plaintext password with a random salt.
    pub fn from_password(password: &str) -> Self {
        let mut salt = vec![0u8; 16];
        rand::thread_rng().fill_bytes(&mut salt);
        let keys = ScramKeys::derive(password, &salt, DEFAULT_ITERATIONS);
        Self {
            iterations: DEFAULT_ITERATIONS,
            salt,
            keys,
        }
    }
}

/// Extracts `key=` attribute values from a SCRAM message.
fn attribute<'a>(message: &'a str, key: char) -> Result<&'a str, RelayError> {
    message
        .split(',')
        .find_map(|part| part.strip_prefix(&format!("{key}=")))
        .ok_or_else(|| RelayError::AuthFailed(format!("SCRAM message missing '{key}' attribute")))
}

/// Client side of the exchange, run against a backend server.
#[derive(Debug)]
pub struct ScramClient {
    password: String,
    nonce: String,
    client_first_bare: String,
    auth_message: Option<String>,
    server_signature: Option<[u8; 32]>,
}

impl ScramClient {
    pub fn new(password: &str) -> Self {
        let nonce = random_nonce();
        let client_first_bare = format!("n=,r={nonce}");
        Self {
            password: password.to_string(),
            nonce,
            client_first_bare,
            auth_message: None,
            server_signature: None,
        }
    }

    /// The initial SASL response payload.
    pub fn client_first(&self) -> Vec<u8> {
        format!("{GS2_HEADER}{}", self.client_first_bare).into_bytes()
    }

    /// Consumes the server-first message and produces the client-final payload.
    pub fn handle_server_first(&mut self, server_first: &[u8]) -> Result<Vec<u8>, RelayError> {
        let server_first = std::str::from_utf8(server_first)?.to_string();
        let server_nonce = attribute(&server_first, 'r')?;
        if !server_nonce.starts_with(&self.nonce) {
            return Err(RelayError::AuthFailed("server nonce mismatch".into()));
        }
        let salt = B64
            .decode(attribute(&server_first, 's')?)
            .map_err(|_| RelayError::AuthFailed("bad server salt".into()))?;
        let iterations: u32 = attribute(&server_first, 'i')?
            .parse()
            .map_err(|_| RelayError::AuthFailed("bad iteration count".into()))?;

        let without_proof = format!("c={CHANNEL_BINDING},r={server_nonce}");
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare, server_first, without_proof
        );

        let salted = hi(self.password.as_bytes(), &salt, iterations);
        let client_key = hmac(&salted, b"Client Key");
        let stored_key = sha256(&client_key);
        let client_signature = hmac(&stored_key, auth_message.as_bytes());
        let proof: Vec<u8> = client_key
            .iter()
            .zip(client_signature.iter())
            .map(|(k, s)| k ^ s)
            .collect();
        let server_key = hmac(&salted, b"Server Key");
        self.server_signature = Some(hmac(&server_key, auth_message.as_bytes()));
        self.auth_message = Some(auth_message);

        Ok(format!("{without_proof},p={}", B64.encode(proof)).into_bytes())
    }

    /// Verifies the server-final message against the expected signature.
    pub fn verify_server_final(&self, server_final: &[u8]) -> Result<(), RelayError> {
        let server_final = std::str::from_utf8(server_final)?;
        let signature = B64
            .decode(attribute(server_final, 'v')?)
            .map_err(|_| RelayError::AuthFailed("bad server signature encoding".into()))?;
        let expected = self
            .server_signature
            .as_ref()
            .ok_or_else(|| RelayError::AuthFailed("SCRAM exchange out of order".into()))?;
        if signature.as_slice() != expected {
            return Err(RelayError::AuthFailed("server signature mismatch".into()));
        }
        Ok(())
    }
}

/// Server side of the exchange, run against a frontend client.
#[derive(Debug)]
pub struct ScramServer {
    verifier: ScramVerifier,
    server_nonce: String,
    client_first_bare: Option<String>,
    server_first: Option<String>,
}

impl ScramServer {
    pub fn new(verifier: ScramVerifier) -> Self {
        Self {
            verifier,
            server_nonce: random_nonce(),
            client_first_bare: None,
            server_first: None,
        }
    }

    /// Consumes the client-first message and produces the server-first payload.
    pub fn handle_client_first(&mut self, client_first: &[u8]) -> Result<Vec<u8>, RelayError> {
        let client_first = std::str::from_utf8(client_first)?;
        // Strip the gs2 header; channel binding is not negotiated.
        let bare = client_first
            .strip_prefix("n,,")
            .or_else(|| client_first.strip_prefix("y,,"))
            .ok_or_else(|| RelayError::AuthFailed("unsupported gs2 header".into()))?;
        let client_nonce = attribute(bare, 'r')?;

        let combined_nonce = format!("{client_nonce}{}", self.server_nonce);
        let server_first = format!(
            "r={combined_nonce},s={},i={}",
            B64.encode(&self.verifier.salt),
            self.verifier.iterations
        );
        self.client_first_bare = Some(bare.to_string());
        self.server_first = Some(server_first.clone());
        Ok(server_first.into_bytes())
    }

    /// Consumes the client-final message; on success returns the server-final
    /// payload to send back.
    pub fn handle_client_final(&mut self, client_final: &[u8]) -> Result<Vec<u8>, RelayError> {
        let client_final = std::str::from_utf8(client_final)?;
        let proof_b64 = attribute(client_final, 'p')?;
        let proof = B64
            .decode(proof_b64)
            .map_err(|_| RelayError::AuthFailed("bad client proof encoding".into()))?;
        if proof.len() != 32 {
            return Err(RelayError::AuthFailed("bad client proof length".into()));
        }

        let without_proof = client_final
            .rsplit_once(",p=")
            .map(|(head, _)| head)
            .ok_or_else(|| RelayError::AuthFailed("malformed client-final".into()))?;
        let (bare, server_first) = match (&self.client_first_bare, &self.server_first) {
            (Some(b), Some(s)) => (b, s),
            _ => return Err(RelayError::AuthFailed("SCRAM exchange out of order".into())),
        };
        let auth_message = format!("{bare},{server_first},{without_proof}");

        let client_signature = hmac(&self.verifier.keys.stored_key, auth_message.as_bytes());
        let client_key: Vec<u8> = proof
            .iter()
            .zip(client_signature.iter())
            .map(|(p, s)| p ^ s)
            .collect();
        if sha256(&client_key) != self.verifier.keys.stored_key {
            return Err(RelayError::AuthFailed("password authentication failed".into()));
        }

        let server_signature = hmac(&self.verifier.keys.server_key, auth_message.as_bytes());
        Ok(format!("v={}", B64.encode(server_signature)).into_bytes())
    }
}
