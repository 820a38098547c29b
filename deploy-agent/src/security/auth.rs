//! Bearer token verification.

use axum::http::{header, HeaderMap};
use deploy_core::hash::hash_bytes;

/// Extract the token from an `Authorization: Bearer <token>` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if scheme.eq_ignore_ascii_case("bearer") {
        Some(token.trim())
    } else {
        None
    }
}

/// Compare tokens in time independent of where they first differ.
///
/// Both sides are digested first so the comparison length never depends on
/// the secret's length.
pub fn tokens_match(presented: &str, expected: &str) -> bool {
    let a = hash_bytes(presented.as_bytes());
    let b = hash_bytes(expected.as_bytes());
    a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
