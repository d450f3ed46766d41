use crate::gameflip::config::{CONTENT_TYPE_JSON, TIME_STEP_SECS, TOTP_DIGITS};
use data_encoding::BASE32;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha1::Sha1;
use std::{
    fmt,
    time::{SystemTime, UNIX_EPOCH},
};
use thiserror::Error;

type HmacSha1 = Hmac<Sha1>;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("api secret is not a usable base-32 value: {0}")]
    InvalidSecretFormat(String),
}

/// Caller-supplied API key and TOTP secret. Held for the duration of one
/// operation and never persisted.
#[derive(Clone, Deserialize)]
pub struct Credentials {
    pub key: String,
    pub secret: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("key", &self.key)
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    pub fn new(key: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            secret: secret.into(),
        }
    }

    fn secret_bytes(&self) -> Result<Vec<u8>, AuthError> {
        let raw = self.secret.trim();
        if raw.is_empty() {
            return Err(AuthError::InvalidSecretFormat("secret is empty".into()));
        }
        let token = normalized_secret(raw);
        BASE32
            .decode(token.as_bytes())
            .map_err(|err| AuthError::InvalidSecretFormat(err.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedHeader {
    pub authorization: String,
    pub content_type: String,
}

/// Returns the secret unchanged when it already decodes as padded base-32,
/// otherwise the base-32 encoding of its raw bytes.
pub fn normalized_secret(secret: &str) -> String {
    match BASE32.decode(secret.as_bytes()) {
        Ok(_) => secret.to_string(),
        Err(_) => BASE32.encode(secret.as_bytes()),
    }
}

pub fn headers(credentials: &Credentials, content_type: &str) -> Result<SignedHeader, AuthError> {
    headers_at(credentials, content_type, unix_now())
}

pub fn headers_at(
    credentials: &Credentials,
    content_type: &str,
    unix_secs: u64,
) -> Result<SignedHeader, AuthError> {
    let key = credentials.secret_bytes()?;
    let code = totp(&key, unix_secs)?;
    Ok(SignedHeader {
        authorization: format!("GFAPI {}:{}", credentials.key, code),
        content_type: if content_type.is_empty() {
            CONTENT_TYPE_JSON.to_string()
        } else {
            content_type.to_string()
        },
    })
}

/// RFC 6238 code for the time step containing `unix_secs`.
pub fn totp(key: &[u8], unix_secs: u64) -> Result<String, AuthError> {
    let counter = unix_secs / TIME_STEP_SECS;
    let mut mac = HmacSha1::new_from_slice(key)
        .map_err(|err| AuthError::InvalidSecretFormat(err.to_string()))?;
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();

    let offset = (digest[digest.len() - 1] & 0x0f) as usize;
    let binary = ((digest[offset] as u32 & 0x7f) << 24)
        | ((digest[offset + 1] as u32) << 16)
        | ((digest[offset + 2] as u32) << 8)
        | (digest[offset + 3] as u32);
    let code = binary % 10u32.pow(TOTP_DIGITS);
    Ok(format!("{:0width$}", code, width = TOTP_DIGITS as usize))
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
