//! OTP hashing primitives (spec §4.5).
//!
//! `settld-crypto` only owns the hash-and-compare math; the issue/verify
//! state machine (attempt counters, lockout, expiry, disk persistence) lives
//! in [`settld_store::otp`], which persists `OtpRecord`s built from these
//! hashes.

use rand::Rng;

use crate::hash::{otp_code_hash, otp_record_key};

/// Generates a 6-digit numeric OTP code, zero-padded.
pub fn generate_code() -> String {
    let n: u32 = rand::thread_rng().gen_range(0..1_000_000);
    format!("{n:06}")
}

/// The at-rest key identifying a tenant/email's current OTP record.
pub fn record_key_hex(tenant_id: &str, email: &str) -> String {
    hex::encode(otp_record_key(tenant_id, email))
}

/// The at-rest hash of a code, compared against `OtpRecord.codeSha256`.
pub fn code_hash_hex(tenant_id: &str, email: &str, code: &str) -> String {
    hex::encode(otp_code_hash(tenant_id, email, code))
}

/// Constant-time comparison of two hex-encoded hashes.
pub fn hashes_match(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
