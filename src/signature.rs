//! HMAC-SHA256 verification for signed webhooks.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Hex-encoded HMAC-SHA256 of `body` under `secret`.
#[must_use]
pub fn sign_hmac(body: &[u8], secret: &str) -> String {
    // HMAC accepts keys of any length, so construction cannot fail.
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return String::new();
    };
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Compares `signature` (hex, any case) against the HMAC of `body` in constant time.
#[must_use]
pub fn verify_hmac(body: &[u8], secret: &str, signature: &str) -> bool {
    let signature = signature.trim().to_ascii_lowercase();
    if signature.is_empty() || secret.is_empty() {
        return false;
    }
    let expected = sign_hmac(body, secret);
    if expected.len() != signature.len() {
        return false;
    }
    expected.as_bytes().ct_eq(signature.as_bytes()).into()
}
