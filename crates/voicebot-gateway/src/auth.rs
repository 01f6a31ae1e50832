//! Shared-secret check for WebSocket upgrades.

use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use sha2::{Digest, Sha256};

use voicebot_core::error::{Result, VoicebotError};

/// Digest comparison so neither content nor length leaks through timing.
fn tokens_match(presented: &str, expected: &str) -> bool {
    let a = Sha256::digest(presented.as_bytes());
    let b = Sha256::digest(expected.as_bytes());
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    scheme
        .eq_ignore_ascii_case("bearer")
        .then(|| token.trim())
        .filter(|t| !t.is_empty())
}

/// Decide whether an upgrade on `path` may proceed.
///
/// The telephony stream path is always allowed. Other paths need a matching
/// `Authorization: Bearer` header when a secret is configured.
pub fn authorize_upgrade(
    path: &str,
    stream_path: &str,
    secret: Option<&str>,
    headers: &HeaderMap,
) -> Result<()> {
    if path == stream_path {
        return Ok(());
    }
    let Some(secret) = secret else {
        return Ok(());
    };
    match bearer_token(headers) {
        Some(token) if tokens_match(token, secret) => Ok(()),
        Some(_) => Err(VoicebotError::Authentication("invalid bearer token".into())),
        None => Err(VoicebotError::Authentication("missing bearer token".into())),
    }
}
