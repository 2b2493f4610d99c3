// src/server/admin/auth.rs

//! Admin-surface authentication: HS256 bearer tokens with real signature
//! and expiry validation, plus basic auth against the configured admin
//! credentials.

use crate::core::RelayError;
use base64::Engine;
use base64::engine::general_purpose::{STANDARD as B64, URL_SAFE_NO_PAD as B64URL};
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    exp: i64,
}

fn sign(secret: &str, signing_input: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(signing_input.as_bytes());
    B64URL.encode(mac.finalize().into_bytes())
}

/// Issues a `header.payload.signature` HS256 token for a subject.
pub fn issue_token(secret: &str, subject: &str, ttl: Duration) -> Result<String, RelayError> {
    let header = B64URL.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let claims = Claims {
        sub: subject.to_string(),
        exp: Utc::now().timestamp() + ttl.as_secs() as i64,
    };
    let payload = B64URL.encode(serde_json::to_vec(&claims)?);
    let signing_input = format!("{header}.{payload}");
    let signature = sign(secret, &signing_input);
    Ok(format!("{signing_input}.{signature}"))
}

/// Validates signature and expiry, returning the subject. Unlike the demo
/// validators of old, a bad signature or an expired token is rejected.
pub fn validate_token(secret: &str, token: &str) -> Result<String, RelayError> {
    let mut parts = token.split('.');
    let (Some(header), Some(payload), Some(signature), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(RelayError::AdminRejected("malformed token".into()));
    };

    let signing_input = format!("{header}.{payload}");
    // Constant-time comparison via the hmac verifier.
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(signing_input.as_bytes());
    let sig_bytes = B64URL
        .decode(signature)
        .map_err(|_| RelayError::AdminRejected("malformed token signature".into()))?;
    if mac.verify_slice(&sig_bytes).is_err() {
        return Err(RelayError::AdminRejected("invalid token signature".into()));
    }

    let claims: Claims = serde_json::from_slice(
        &B64URL
            .decode(payload)
            .map_err(|_| RelayError::AdminRejected("malformed token payload".into()))?,
    )
    .map_err(|_| RelayError::AdminRejected("malformed token claims".into()))?;

    if claims.exp < Utc::now().timestamp() {
        return Err(RelayError::AdminRejected("token expired".into()));
    }
    Ok(claims.sub)
}

/// Checks an `Authorization` header value against the configured bearer
/// secret or basic credentials. Returns the authenticated subject.
pub fn authorize(
    header: Option<&str>,
    jwt_secret: &str,
    basic_user: &str,
    basic_password: &str,
) -> Result<String, RelayError> {
    let header = header.ok_or_else(|| {
        RelayError::AdminRejected("missing Authorization header".into())
    })?;

    if let Some(token) = header.strip_prefix("Bearer ") {
        if jwt_secret.is_empty() {
            return Err(RelayError::AdminRejected(
                "bearer tokens are not configured".into(),
            ));
        }
        return validate_token(jwt_secret, token.trim());
    }

    if let Some(encoded) = header.strip_prefix("Basic ") {
        if basic_password.is_empty() {
            return Err(RelayError::AdminRejected("basic auth is not configured".into()));
        }
        let decoded = B64
            .decode(encoded.trim())
            .map_err(|_| RelayError::AdminRejected("malformed basic credentials".into()))?;
        let decoded = String::from_utf8(decoded)
            .map_err(|_| RelayError::AdminRejected("malformed basic credentials".into()))?;
        let (user, password) = decoded
            .split_once(':')
            .ok_or_else(|| RelayError::AdminRejected("malformed basic credentials".into()))?;
        if user == basic_user && password == basic_password {
            return Ok(user.to_string());
        }
        return Err(RelayError::AdminRejected("bad basic credentials".into()));
    }

    Err(RelayError::AdminRejected(
        "unsupported Authorization scheme".into(),
    ))
}
