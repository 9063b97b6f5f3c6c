use sha2::{Digest, Sha256};

/// SHA-256 of arbitrary bytes.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// SHA-256 of a UTF-8 string, as used throughout the idempotency-key and
/// OTP-record-key derivations in spec §3 (`SHA-256(a||"\n"||b||...)`).
pub fn sha256_str(s: &str) -> [u8; 32] {
    sha256(s.as_bytes())
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

/// The idempotency key for a webhook retry job (spec §3):
/// `SHA-256(tenantId||"\n"||token||"\n"||event||"\n"||url||"\n"||SHA-256(payloadJson))`.
pub fn webhook_idempotency_key(
    tenant_id: &str,
    token: &str,
    event: &str,
    url: &str,
    payload_json: &str,
) -> [u8; 32] {
    let payload_hash = sha256_hex(payload_json.as_bytes());
    let joined = format!("{tenant_id}\n{token}\n{event}\n{url}\n{payload_hash}");
    sha256_str(&joined)
}

/// The OTP record key: `SHA-256(tenantId||"\n"||email)` (spec §3).
pub fn otp_record_key(tenant_id: &str, email: &str) -> [u8; 32] {
    sha256_str(&format!("{tenant_id}\n{email}"))
}

/// The OTP code hash: `SHA-256(tenantId||"\n"||email||"\n"||code)` (spec §3).
pub fn otp_code_hash(tenant_id: &str, email: &str, code: &str) -> [u8; 32] {
    sha256_str(&format!("{tenant_id}\n{email}\n{code}"))
}
