//! MD5 challenge-response and call-token helpers.

use std::net::SocketAddr;

use md5::{Digest, Md5};
use rand::RngCore;
use subtle::ConstantTimeEq;

/// A fresh challenge: the decimal rendering of a random 32-bit value.
pub fn new_challenge(rng: &mut dyn RngCore) -> String {
    rng.next_u32().to_string()
}

/// The AuthRep digest: `hex(md5(challenge || password))`.
pub fn md5_response(challenge: &str, password: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(challenge.as_bytes());
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

/// Constant-time comparison of a received digest against the expected one.
pub fn verify_md5(challenge: &str, password: &str, response: &str) -> bool {
    let expected = md5_response(challenge, password);
    expected.as_bytes().ct_eq(response.as_bytes()).into()
}

/// An opaque anti-spoofing token bound to the peer address and mint time.
///
/// Layout: `<issue-ms>.<hex(md5(secret || addr || issue-ms))>`. The
/// server recomputes the digest on return and checks the age window, so
/// no per-caller state is kept before the token round-trips.
pub fn mint_call_token(secret: &[u8], addr: SocketAddr, now_ms: i64) -> Vec<u8> {
    let digest = token_digest(secret, addr, now_ms);
    format!("{now_ms}.{digest}").into_bytes()
}

pub fn validate_call_token(secret: &[u8], addr: SocketAddr, token: &[u8], now_ms: i64, max_age_ms: u64) -> bool {
    let Ok(text) = std::str::from_utf8(token) else {
        return false;
    };
    let Some((stamp, digest)) = text.split_once('.') else {
        return false;
    };
    let Ok(issued) = stamp.parse::<i64>() else {
        return false;
    };
    let age = now_ms.saturating_sub(issued);
    if age < 0 || age as u64 > max_age_ms {
        return false;
    }
    let expected = token_digest(secret, addr, issued);
    expected.as_bytes().ct_eq(digest.as_bytes()).into()
}

fn token_digest(secret: &[u8], addr: SocketAddr, issued_ms: i64) -> String {
    let mut hasher = Md5::new();
    hasher.update(secret);
    hasher.update(addr.to_string().as_bytes());
    hasher.update(issued_ms.to_be_bytes());
    hex::encode(hasher.finalize())
}
