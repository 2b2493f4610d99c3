// src/core/protocol/auth.rs

//! Authentication exchanges in both directions: the pooler answers backend
//! challenges on the frontend's behalf (client role) and challenges
//! frontends itself (server role), using secrets from the credential store.

use crate::core::RelayError;
use crate::core::credentials::{CredentialStore, Secret};
use crate::core::protocol::message::{Message, MessageCodec, auth_codes, tags};
use crate::core::protocol::scram::{self, ScramClient, ScramServer, ScramVerifier};
use futures::{SinkExt, StreamExt};
use md5::{Digest, Md5};
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

/// The authentication method to apply to a frontend connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrontendAuthPolicy {
    /// Accept the session without a password exchange.
    Trust,
    /// Challenge with the strongest method the stored secret supports.
    Password,
    /// The TLS layer already verified a client certificate.
    Certificate,
}

/// Computes the `md5...` response to an MD5 challenge. The inner digest can
/// come either from a plaintext secret or a stored `md5`-prefixed one.
pub fn md5_response(user: &str, secret: &Secret, salt: [u8; 4]) -> Result<String, RelayError> {
    let inner = match secret {
        Secret::Plain(password) => {
            let mut h = Md5::new();
            h.update(password.as_bytes());
            h.update(user.as_bytes());
            hex::encode(h.finalize())
        }
        Secret::Md5(stored) => stored
            .strip_prefix("md5")
            .ok_or_else(|| RelayError::AuthFailed("malformed md5 secret".into()))?
            .to_string(),
        _ => {
            return Err(RelayError::AuthFailed(
                "md5 challenge needs a plaintext or md5 secret".into(),
            ));
        }
    };
    let mut h = Md5::new();
    h.update(inner.as_bytes());
    h.update(salt);
    Ok(format!("md5{}", hex::encode(h.finalize())))
}

/// Answers one backend authentication request message. Returns the reply to
/// send, or `None` when the request was `AuthenticationOk`.
pub struct BackendAuthenticator<'a> {
    user: &'a str,
    secret: &'a Secret,
    scram: Option<ScramClient>,
}

impl<'a> BackendAuthenticator<'a> {
    pub fn new(user: &'a str, secret: &'a Secret) -> Self {
        Self {
            user,
            secret,
            scram: None,
        }
    }

    pub fn respond(&mut self, auth: &Message) -> Result<Option<Message>, RelayError> {
        let (code, payload) = auth.as_authentication()?;
        match code {
            auth_codes::OK => Ok(None),
            auth_codes::CLEARTEXT_PASSWORD => {
                let password = self.secret.plaintext().ok_or_else(|| {
                    RelayError::AuthFailed(
                        "backend requested a cleartext password but only a hashed secret is stored"
                            .into(),
                    )
                })?;
                Ok(Some(Message::password(password.as_bytes())))
            }
            auth_codes::MD5_PASSWORD => {
                if payload.len() < 4 {
                    return Err(RelayError::ProtocolViolation("short md5 salt".into()));
                }
                let salt = [payload[0], payload[1], payload[2], payload[3]];
                let response = md5_response(self.user, self.secret, salt)?;
                Ok(Some(Message::password(response.as_bytes())))
            }
            auth_codes::SASL => {
                let mechanisms = std::str::from_utf8(&payload)?;
                if !mechanisms.split('\0').any(|m| m == scram::MECHANISM) {
                    return Err(RelayError::AuthFailed(format!(
                        "backend offers no supported SASL mechanism: {mechanisms}"
                    )));
                }
                let password = self.secret.plaintext().ok_or_else(|| {
                    RelayError::AuthFailed(
                        "SCRAM towards the backend requires a plaintext secret".into(),
                    )
                })?;
                let client = ScramClient::new(password);
                let first = client.client_first();
                self.scram = Some(client);
                Ok(Some(Message::sasl_initial_response(scram::MECHANISM, &first)))
            }
            auth_codes::SASL_CONTINUE => {
                let client = self.scram.as_mut().ok_or_else(|| {
                    RelayError::ProtocolViolation("SASLContinue before SASL".into())
                })?;
                let response = client.handle_server_first(&payload)?;
                Ok(Some(Message::sasl_response(&response)))
            }
            auth_codes::SASL_FINAL => {
                let client = self
                    .scram
                    .as_ref()
                    .ok_or_else(|| RelayError::ProtocolViolation("SASLFinal before SASL".into()))?;
                client.verify_server_final(&payload)?;
                Ok(None)
            }
            other => Err(RelayError::AuthFailed(format!(
                "backend requested unsupported authentication method {other}"
            ))),
        }
    }
}

/// Runs the server-role authentication exchange against a frontend. On
/// success the caller still owes the client `BackendKeyData` and
/// `ReadyForQuery`.
pub async fn authenticate_frontend<S>(
    framed: &mut Framed<S, MessageCodec>,
    user: &str,
    store: &CredentialStore,
    policy: FrontendAuthPolicy,
) -> Result<(), RelayError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match policy {
        FrontendAuthPolicy::Trust | FrontendAuthPolicy::Certificate => {
            framed.send(Message::auth_ok()).await?;
            Ok(())
        }
        FrontendAuthPolicy::Password => match store.resolve(user)? {
            Secret::Plain(password) => {
                // A plaintext secret supports the strongest exchange.
                let verifier = ScramVerifier::from_password(&password);
                scram_exchange(framed, verifier).await
            }
            Secret::ScramVerifier(raw) => {
                let verifier = ScramVerifier::parse(&raw)?;
                scram_exchange(framed, verifier).await
            }
            Secret::Md5(_) => md5_exchange(framed, user, store).await,
            Secret::Aes(_) => unreachable!("resolve() rejects AES secrets"),
        },
    }
}

async fn md5_exchange<S>(
    framed: &mut Framed<S, MessageCodec>,
    user: &str,
    store: &CredentialStore,
) -> Result<(), RelayError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut salt = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut salt);
    framed.send(Message::auth_md5(salt)).await?;

    let reply = expect_password_message(framed).await?;
    let response = std::str::from_utf8(trim_nul(&reply.body))?;
    let expected = md5_response(user, &store.resolve(user)?, salt)?;
    if response != expected {
        return Err(RelayError::AuthFailed(format!(
            "password authentication failed for user \"{user}\""
        )));
    }
    framed.send(Message::auth_ok()).await?;
    Ok(())
}

async fn scram_exchange<S>(
    framed: &mut Framed<S, MessageCodec>,
    verifier: ScramVerifier,
) -> Result<(), RelayError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    framed.send(Message::auth_sasl(scram::MECHANISM)).await?;

    // SASLInitialResponse: mechanism, then length-prefixed client-first.
    let initial = expect_password_message(framed).await?;
    let mut body = initial.body.clone();
    let nul = body
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| RelayError::ProtocolViolation("malformed SASLInitialResponse".into()))?;
    let mechanism = std::str::from_utf8(&body[..nul])?.to_string();
    if mechanism != scram::MECHANISM {
        return Err(RelayError::AuthFailed(format!(
            "client chose unsupported SASL mechanism '{mechanism}'"
        )));
    }
    let _ = body.split_to(nul + 1);
    if body.len() < 4 {
        return Err(RelayError::ProtocolViolation("short SASLInitialResponse".into()));
    }
    use bytes::Buf;
    let len = body.get_i32();
    if len < 0 || body.len() != len as usize {
        return Err(RelayError::ProtocolViolation("bad SASL payload length".into()));
    }

    let mut server = ScramServer::new(verifier);
    let server_first = server.handle_client_first(&body)?;
    framed.send(Message::auth_sasl_continue(&server_first)).await?;

    let final_msg = expect_password_message(framed).await?;
    let server_final = server.handle_client_final(&final_msg.body)?;
    framed.send(Message::auth_sasl_final(&server_final)).await?;
    framed.send(Message::auth_ok()).await?;
    Ok(())
}

async fn expect_password_message<S>(
    framed: &mut Framed<S, MessageCodec>,
) -> Result<Message, RelayError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match framed.next().await {
        Some(Ok(msg)) if msg.tag == tags::PASSWORD_MESSAGE => Ok(msg),
        Some(Ok(msg)) => Err(RelayError::ProtocolViolation(format!(
            "expected PasswordMessage, got '{}'",
            msg.tag as char
        ))),
        Some(Err(e)) => Err(e),
        None => Err(RelayError::AuthFailed(
            "client disconnected during authentication".into(),
        )),
    }
}

fn trim_nul(body: &[u8]) -> &[u8] {
    body.strip_suffix(&[0]).unwrap_or(body)
}
