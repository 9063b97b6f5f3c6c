//! Buyer session tokens (spec §4.6): `base64url(payloadJson).base64url(hmac)`.

use base64::engine::general_purpose::URL_SAFE_NO_PAD as BASE64URL;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use settld_core::{normalize_email, SettldError, TimestampMs};

/// Constant-time byte comparison; `hmac::Mac::verify_slice` would do this for
/// us if the signature arrived as raw bytes, but here it's base64url text we
/// decode ourselves first.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

type HmacSha256 = Hmac<Sha256>;

const SCHEMA_VERSION: &str = "MagicLinkBuyerSession.v1";
const MIN_KEY_LEN: usize = 16;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionPayload {
    #[serde(rename = "schemaVersion")]
    schema_version: String,
    #[serde(rename = "tenantId")]
    tenant_id: String,
    email: String,
    #[serde(rename = "issuedAt")]
    issued_at: TimestampMs,
    #[serde(rename = "expiresAt")]
    expires_at: TimestampMs,
    nonce: String,
}

/// A verified, decoded buyer session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionClaims {
    pub tenant_id: String,
    pub email: String,
    pub issued_at: TimestampMs,
    pub expires_at: TimestampMs,
}

fn hmac_for(key: &[u8]) -> Result<HmacSha256, SettldError> {
    if key.len() < MIN_KEY_LEN {
        return Err(SettldError::SessionKeyMissing);
    }
    HmacSha256::new_from_slice(key).map_err(|_| SettldError::SessionKeyMissing)
}

/// Issues a session token for `tenant_id`/`email`, valid from `issued_at_ms`
/// until `issued_at_ms + ttl_ms`.
pub fn issue(
    key: &[u8],
    tenant_id: &str,
    email: &str,
    issued_at_ms: TimestampMs,
    ttl_ms: i64,
) -> Result<String, SettldError> {
    let mac_key = hmac_for(key)?;
    let email = normalize_email(email)?;

    let mut nonce_bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);

    let payload = SessionPayload {
        schema_version: SCHEMA_VERSION.to_string(),
        tenant_id: tenant_id.to_string(),
        email,
        issued_at: issued_at_ms,
        expires_at: issued_at_ms.saturating_add(ttl_ms),
        nonce: hex::encode(nonce_bytes),
    };
    let payload_json =
        serde_json::to_vec(&payload).map_err(|e| SettldError::Serialization(e.to_string()))?;
    let payload_b64 = BASE64URL.encode(&payload_json);

    let mut mac = mac_key;
    mac.update(payload_b64.as_bytes());
    let sig_b64 = BASE64URL.encode(mac.finalize().into_bytes());

    Ok(format!("{payload_b64}.{sig_b64}"))
}

/// Verifies a session token's signature and expiry, returning its claims.
pub fn verify(key: &[u8], token: &str, now_ms: TimestampMs) -> Result<SessionClaims, SettldError> {
    let (payload_b64, sig_b64) = token
        .split_once('.')
        .ok_or(SettldError::SessionInvalid)?;

    let mut mac = hmac_for(key)?;
    mac.update(payload_b64.as_bytes());
    let expected = mac.finalize().into_bytes();

    let given = BASE64URL
        .decode(sig_b64)
        .map_err(|_| SettldError::SessionInvalid)?;

    if !constant_time_eq(&expected, &given) {
        return Err(SettldError::SessionInvalid);
    }

    let payload_json = BASE64URL
        .decode(payload_b64)
        .map_err(|_| SettldError::SessionInvalid)?;
    let payload: SessionPayload =
        serde_json::from_slice(&payload_json).map_err(|_| SettldError::SessionInvalid)?;

    if payload.schema_version != SCHEMA_VERSION {
        return Err(SettldError::SessionInvalid);
    }
    if now_ms >= payload.expires_at {
        return Err(SettldError::SessionExpired);
    }

    Ok(SessionClaims {
        tenant_id: payload.tenant_id,
        email: payload.email,
        issued_at: payload.issued_at,
        expires_at: payload.expires_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &[u8] = b"0123456789abcdef";

    #[test]
    fn round_trips_a_valid_token() {
        let token = issue(KEY, "acme", "buyer@example.com", 1_000, 60_000).unwrap();
        let claims = verify(KEY, &token, 1_500).unwrap();
        assert_eq!(claims.tenant_id, "acme");
        assert_eq!(claims.email, "buyer@example.com");
        assert_eq!(claims.expires_at, 61_000);
    }

    #[test]
    fn rejects_expired_token() {
        let token = issue(KEY, "acme", "buyer@example.com", 1_000, 60_000).unwrap();
        let err = verify(KEY, &token, 61_000).unwrap_err();
        assert!(matches!(err, SettldError::SessionExpired));
    }

    #[test]
    fn rejects_tampered_signature() {
        let token = issue(KEY, "acme", "buyer@example.com", 1_000, 60_000).unwrap();
        let (payload, _) = token.split_once('.').unwrap();
        let forged = format!("{payload}.AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA");
        let err = verify(KEY, &forged, 1_500).unwrap_err();
        assert!(matches!(err, SettldError::SessionInvalid));
    }

    #[test]
    fn rejects_wrong_key() {
        let token = issue(KEY, "acme", "buyer@example.com", 1_000, 60_000).unwrap();
        let err = verify(b"ffffffffffffffff", &token, 1_500).unwrap_err();
        assert!(matches!(err, SettldError::SessionInvalid));
    }

    #[test]
    fn rejects_key_shorter_than_minimum() {
        let err = issue(b"short", "acme", "buyer@example.com", 1_000, 60_000).unwrap_err();
        assert!(matches!(err, SettldError::SessionKeyMissing));
    }
}
