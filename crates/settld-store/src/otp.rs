//! Buyer OTP issue/verify state machine (spec §4.5).
//!
//! `settld_crypto::otp` owns the hash-and-compare math; this module owns
//! persistence of `OtpRecord`s at `<dataDir>/buyer-otp/<tenantId>/<keyHash>.json`
//! and the outbox delivery file at
//! `<dataDir>/buyer-otp-outbox/<tenantId>_<keyHash>.json`.

use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use settld_core::{normalize_email, SettldError, TimestampMs};
use settld_crypto::otp::{code_hash_hex, generate_code, hashes_match, record_key_hex};

const SCHEMA_VERSION: &str = "MagicLinkOtpRecord.v1";

/// How a freshly-issued code reaches the buyer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OtpDeliveryMode {
    /// Writes only the outbox file; no external call.
    Record,
    /// Writes the outbox file and logs the code to stderr (test harness mode).
    Log,
    /// Writes the outbox file and invokes the injected SMTP sender.
    Smtp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OtpRecord {
    #[serde(rename = "schemaVersion")]
    schema_version: String,
    #[serde(rename = "tenantId")]
    tenant_id: String,
    email: String,
    #[serde(rename = "codeSha256")]
    code_sha256: String,
    #[serde(rename = "issuedAt")]
    issued_at: TimestampMs,
    #[serde(rename = "expiresAt")]
    expires_at: TimestampMs,
    attempts: u32,
    #[serde(rename = "consumedAt", skip_serializing_if = "Option::is_none")]
    consumed_at: Option<TimestampMs>,
}

/// Persists and verifies buyer one-time codes.
pub struct OtpStore {
    data_dir: PathBuf,
}

impl OtpStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        OtpStore { data_dir: data_dir.into() }
    }

    fn record_path(&self, tenant_id: &str, key_hash: &str) -> PathBuf {
        self.data_dir.join("buyer-otp").join(tenant_id).join(format!("{key_hash}.json"))
    }

    fn outbox_path(&self, tenant_id: &str, key_hash: &str) -> PathBuf {
        self.data_dir.join("buyer-otp-outbox").join(format!("{tenant_id}_{key_hash}.json"))
    }

    fn load_record(&self, tenant_id: &str, key_hash: &str) -> Result<Option<OtpRecord>, SettldError> {
        let path = self.record_path(tenant_id, key_hash);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path).map_err(|e| SettldError::Storage(e.to_string()))?;
        let record = serde_json::from_str(&raw).map_err(|e| SettldError::Serialization(e.to_string()))?;
        Ok(Some(record))
    }

    fn save_record(&self, tenant_id: &str, key_hash: &str, record: &OtpRecord) -> Result<(), SettldError> {
        let path = self.record_path(tenant_id, key_hash);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| SettldError::Storage(e.to_string()))?;
        }
        let body = serde_json::to_vec_pretty(record).map_err(|e| SettldError::Serialization(e.to_string()))?;
        fs::write(&path, body).map_err(|e| SettldError::Storage(e.to_string()))
    }

    /// Issues a fresh code for `tenant_id`/`email`, overwriting any existing
    /// record. Writes the outbox sibling file unconditionally; in `Smtp`
    /// mode, `send_smtp(tenant_id, email, code)` is also invoked, and its
    /// failure propagates without persisting a new record.
    pub fn issue(
        &self,
        tenant_id: &str,
        email: &str,
        now_ms: TimestampMs,
        ttl_ms: i64,
        delivery_mode: OtpDeliveryMode,
        mut send_smtp: impl FnMut(&str, &str, &str) -> Result<(), SettldError>,
    ) -> Result<(), SettldError> {
        let email = normalize_email(email)?;
        let code = generate_code();
        let key_hash = record_key_hex(tenant_id, &email);

        if delivery_mode == OtpDeliveryMode::Smtp {
            send_smtp(tenant_id, &email, &code)?;
        }
        if delivery_mode == OtpDeliveryMode::Log {
            eprintln!("[otp] {tenant_id}/{email}: {code}");
        }

        let outbox_path = self.outbox_path(tenant_id, &key_hash);
        if let Some(parent) = outbox_path.parent() {
            fs::create_dir_all(parent).map_err(|e| SettldError::Storage(e.to_string()))?;
        }
        let outbox_body = serde_json::json!({
            "tenantId": tenant_id,
            "email": email,
            "code": code,
            "issuedAt": now_ms,
        });
        fs::write(
            &outbox_path,
            serde_json::to_vec_pretty(&outbox_body).map_err(|e| SettldError::Serialization(e.to_string()))?,
        )
        .map_err(|e| SettldError::Storage(e.to_string()))?;

        let record = OtpRecord {
            schema_version: SCHEMA_VERSION.to_string(),
            tenant_id: tenant_id.to_string(),
            code_sha256: code_hash_hex(tenant_id, &email, &code),
            email,
            issued_at: now_ms,
            expires_at: now_ms.saturating_add(ttl_ms),
            attempts: 0,
            consumed_at: None,
        };
        self.save_record(tenant_id, &key_hash, &record)
    }

    /// Verifies `code` against the active record for `tenant_id`/`email` and
    /// consumes it on success. Returns `OTP_MISSING|OTP_CONSUMED|OTP_EXPIRED|
    /// OTP_LOCKED|OTP_INVALID` as the matching [`SettldError`] variant, or
    /// `Ok(())` once `consumedAt` has been set.
    pub fn verify_and_consume(
        &self,
        tenant_id: &str,
        email: &str,
        code: &str,
        now_ms: TimestampMs,
        max_attempts: u32,
    ) -> Result<(), SettldError> {
        let email = normalize_email(email)?;
        let key_hash = record_key_hex(tenant_id, &email);
        let Some(mut record) = self.load_record(tenant_id, &key_hash)? else {
            return Err(SettldError::OtpMissing);
        };

        if record.consumed_at.is_some() {
            return Err(SettldError::OtpConsumed);
        }
        if now_ms >= record.expires_at {
            return Err(SettldError::OtpExpired);
        }
        if record.attempts >= max_attempts {
            return Err(SettldError::OtpLocked);
        }

        let given_hash = code_hash_hex(tenant_id, &email, code);
        if !hashes_match(&given_hash, &record.code_sha256) {
            record.attempts += 1;
            self.save_record(tenant_id, &key_hash, &record)?;
            return Err(SettldError::OtpInvalid);
        }

        record.consumed_at = Some(now_ms);
        self.save_record(tenant_id, &key_hash, &record)
    }

    /// Reads back the code written to the outbox file, for tests and `record`
    /// delivery integrations that poll the outbox instead of an inbox.
    pub fn read_outbox_code(&self, tenant_id: &str, email: &str) -> Result<Option<String>, SettldError> {
        let email = normalize_email(email)?;
        let key_hash = record_key_hex(tenant_id, &email);
        let path = self.outbox_path(tenant_id, &key_hash);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path).map_err(|e| SettldError::Storage(e.to_string()))?;
        let body: serde_json::Value =
            serde_json::from_str(&raw).map_err(|e| SettldError::Serialization(e.to_string()))?;
        Ok(body.get("code").and_then(|v| v.as_str()).map(str::to_string))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, OtpStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = OtpStore::new(dir.path());
        (dir, store)
    }

    fn no_smtp(_: &str, _: &str, _: &str) -> Result<(), SettldError> {
        panic!("smtp should not be called in this test")
    }

    #[test]
    fn issue_then_verify_with_the_outbox_code_succeeds() {
        let (_dir, store) = store();
        store.issue("acme", "Buyer@Example.com", 1_000, 300_000, OtpDeliveryMode::Record, no_smtp).unwrap();

        let code = store.read_outbox_code("acme", "buyer@example.com").unwrap().unwrap();
        store.verify_and_consume("acme", "buyer@example.com", &code, 1_500, 3).unwrap();
    }

    #[test]
    fn verify_with_no_record_returns_otp_missing() {
        let (_dir, store) = store();
        let err = store.verify_and_consume("acme", "buyer@example.com", "000000", 1_000, 3).unwrap_err();
        assert!(matches!(err, SettldError::OtpMissing));
    }

    #[test]
    fn wrong_code_increments_attempts_and_returns_otp_invalid() {
        let (_dir, store) = store();
        store.issue("acme", "buyer@example.com", 1_000, 300_000, OtpDeliveryMode::Record, no_smtp).unwrap();

        let err = store.verify_and_consume("acme", "buyer@example.com", "000000", 1_100, 3).unwrap_err();
        assert!(matches!(err, SettldError::OtpInvalid));
    }

    #[test]
    fn three_wrong_attempts_then_the_correct_code_is_locked() {
        let (_dir, store) = store();
        store.issue("acme", "buyer@example.com", 1_000, 300_000, OtpDeliveryMode::Record, no_smtp).unwrap();
        let code = store.read_outbox_code("acme", "buyer@example.com").unwrap().unwrap();
        let wrong = if code == "000000" { "111111" } else { "000000" };

        for _ in 0..3 {
            let err = store.verify_and_consume("acme", "buyer@example.com", wrong, 1_100, 3).unwrap_err();
            assert!(matches!(err, SettldError::OtpInvalid));
        }

        let err = store.verify_and_consume("acme", "buyer@example.com", &code, 1_200, 3).unwrap_err();
        assert!(matches!(err, SettldError::OtpLocked));
    }

    #[test]
    fn expired_code_returns_otp_expired() {
        let (_dir, store) = store();
        store.issue("acme", "buyer@example.com", 1_000, 1_000, OtpDeliveryMode::Record, no_smtp).unwrap();
        let code = store.read_outbox_code("acme", "buyer@example.com").unwrap().unwrap();

        let err = store.verify_and_consume("acme", "buyer@example.com", &code, 2_500, 3).unwrap_err();
        assert!(matches!(err, SettldError::OtpExpired));
    }

    #[test]
    fn double_consume_returns_otp_consumed() {
        let (_dir, store) = store();
        store.issue("acme", "buyer@example.com", 1_000, 300_000, OtpDeliveryMode::Record, no_smtp).unwrap();
        let code = store.read_outbox_code("acme", "buyer@example.com").unwrap().unwrap();

        store.verify_and_consume("acme", "buyer@example.com", &code, 1_100, 3).unwrap();
        let err = store.verify_and_consume("acme", "buyer@example.com", &code, 1_200, 3).unwrap_err();
        assert!(matches!(err, SettldError::OtpConsumed));
    }

    #[test]
    fn smtp_mode_invokes_the_injected_sender_and_propagates_failure() {
        let (_dir, store) = store();
        let err = store
            .issue("acme", "buyer@example.com", 1_000, 300_000, OtpDeliveryMode::Smtp, |_, _, _| {
                Err(SettldError::SmtpSendFailed("refused".into()))
            })
            .unwrap_err();
        assert!(matches!(err, SettldError::SmtpSendFailed(_)));
        assert!(store.read_outbox_code("acme", "buyer@example.com").unwrap().is_none());
    }

    #[test]
    fn issue_rejects_invalid_email() {
        let (_dir, store) = store();
        let err = store
            .issue("acme", "not-an-email", 1_000, 300_000, OtpDeliveryMode::Record, no_smtp)
            .unwrap_err();
        assert!(matches!(err, SettldError::InvalidEmail(_)));
    }
}
