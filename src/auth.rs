//! Auth boundary: Basic-credential parsing and password hashing.
//!
//! A document either has no password (public) or a salted SHA-256
//! hash. Clients can supply the password three ways, checked in this
//! order: an explicit field, an `Authorization: Basic` header whose
//! user part must equal the slug, or a `token` query parameter holding
//! the same base64 payload.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Hash a password with a fresh random salt.
///
/// Stored form is `salt$hex(sha256(salt ‖ password))`.
pub fn hash_password(password: impl AsRef<str>) -> String {
    let salt = Uuid::new_v4().simple().to_string();
    format!("{salt}${}", digest(&salt, password.as_ref()))
}

/// Check a password against a stored `salt$digest` hash.
pub fn verify_password(password: &str, stored: &str) -> bool {
    match stored.split_once('$') {
        Some((salt, expected)) => digest(salt, password) == expected,
        None => false,
    }
}

fn digest(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

/// Whether `provided` unlocks a document with `password_hash`.
/// Absent hash means public.
pub fn is_authorized(password_hash: Option<&str>, provided: Option<&str>) -> bool {
    match (password_hash, provided) {
        (None, _) => true,
        (Some(stored), Some(actual)) => verify_password(actual, stored),
        (Some(_), None) => false,
    }
}

/// Pull the password for `slug` out of an `Authorization` header
/// value. Only the `Basic` scheme with a matching user part counts.
pub fn password_from_authorization(header: &str, slug: &str) -> Option<String> {
    let (scheme, payload) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    password_from_token(payload, slug)
}

/// Decode a raw `base64("<slug>:<password>")` token.
pub fn password_from_token(token: &str, slug: &str) -> Option<String> {
    let decoded = BASE64.decode(token.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = match decoded.split_once(':') {
        Some((user, pass)) => (user.to_string(), pass.to_string()),
        None => (decoded, String::new()),
    };
    if user != slug {
        return None;
    }
    Some(pass)
}
