use serde::{Deserialize, Serialize};
use std::fmt;

use crate::constants::MAX_EMAIL_LEN;
use crate::error::SettldError;

/// Unix timestamp in milliseconds, matching the `nextAttemptAt`/`createdAt`
/// fields that appear throughout the retry and run-record JSON documents.
pub type TimestampMs = i64;

// ── Email normalization ──────────────────────────────────────────────────────

/// Normalizes a buyer email for `OtpAuth`/`SessionToken` (spec §4.5/§8):
/// lowercase, exactly one `@`, no whitespace, at most [`MAX_EMAIL_LEN`]
/// bytes, and non-empty local/domain parts either side of the `@`.
pub fn normalize_email(raw: &str) -> Result<String, SettldError> {
    if raw.is_empty() || raw.len() > MAX_EMAIL_LEN {
        return Err(SettldError::InvalidEmail(raw.to_string()));
    }
    if raw.chars().any(|c| c.is_whitespace()) {
        return Err(SettldError::InvalidEmail(raw.to_string()));
    }
    let mut parts = raw.split('@');
    let (Some(local), Some(domain), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(SettldError::InvalidEmail(raw.to_string()));
    };
    if local.is_empty() || domain.is_empty() {
        return Err(SettldError::InvalidEmail(raw.to_string()));
    }
    Ok(raw.to_lowercase())
}

// ── TenantId ───────────────────────────────────────────────────────────────

/// A tenant identifier. Must match `[A-Za-z0-9_-]{1,64}` (spec §3).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    pub fn parse(raw: &str) -> Result<Self, SettldError> {
        let valid = !raw.is_empty()
            && raw.len() <= 64
            && raw
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
        if !valid {
            return Err(SettldError::InvalidTenant(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TenantId({})", self.0)
    }
}

// ── RunToken ───────────────────────────────────────────────────────────────

/// A verification run token: `ml_` followed by 48 lowercase hex characters.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunToken(String);

const RUN_TOKEN_PREFIX: &str = "ml_";
const RUN_TOKEN_HEX_LEN: usize = 48;

impl RunToken {
    pub fn parse(raw: &str) -> Result<Self, SettldError> {
        let Some(hex_part) = raw.strip_prefix(RUN_TOKEN_PREFIX) else {
            return Err(SettldError::InvalidRunToken(raw.to_string()));
        };
        let valid = hex_part.len() == RUN_TOKEN_HEX_LEN
            && hex_part
                .bytes()
                .all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase());
        if !valid {
            return Err(SettldError::InvalidRunToken(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    /// Generate a fresh token from 24 random bytes (48 hex chars).
    pub fn generate(random_bytes: [u8; 24]) -> Self {
        Self(format!("{RUN_TOKEN_PREFIX}{}", hex::encode(random_bytes)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for RunToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RunToken({})", self.0)
    }
}

// ── IngestKeyHash ─────────────────────────────────────────────────────────────

/// SHA-256 of a long-lived producer bearer token (`igk_<random>`), the only
/// form in which ingest keys are ever persisted.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestKeyHash(pub [u8; 32]);

impl IngestKeyHash {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for IngestKeyHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IngestKeyHash({}…)", &self.to_hex()[..8])
    }
}

// ── Decision ─────────────────────────────────────────────────────────────────

/// A human or automated decision reached over a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Approve,
    Hold,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Approve => "approve",
            Decision::Hold => "hold",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ── VerificationStatus ───────────────────────────────────────────────────────

/// Derived projection of a run's verification outcome (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationStatus {
    Green,
    Amber,
    Red,
}

impl VerificationStatus {
    /// green = ok and no warnings; amber = ok with warnings; red = otherwise.
    pub fn derive(ok: bool, has_warnings: bool) -> Self {
        match (ok, has_warnings) {
            (true, false) => VerificationStatus::Green,
            (true, true) => VerificationStatus::Amber,
            (false, _) => VerificationStatus::Red,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationStatus::Green => "green",
            VerificationStatus::Amber => "amber",
            VerificationStatus::Red => "red",
        }
    }
}

impl fmt::Display for VerificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ── Plan ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Free,
    Builder,
    Growth,
    Enterprise,
}

impl Plan {
    /// Parses a plan string, honoring the `scale -> enterprise` alias (spec §3).
    pub fn parse(raw: &str) -> Result<Self, SettldError> {
        match raw {
            "free" => Ok(Plan::Free),
            "builder" => Ok(Plan::Builder),
            "growth" => Ok(Plan::Growth),
            "enterprise" | "scale" => Ok(Plan::Enterprise),
            other => Err(SettldError::Validation(format!(
                "plan must be free|builder|growth|enterprise, got {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefaultMode {
    Auto,
    Strict,
    Compat,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenant_id_accepts_valid_chars() {
        assert!(TenantId::parse("acme-Corp_01").is_ok());
    }

    #[test]
    fn tenant_id_rejects_invalid_chars() {
        assert!(TenantId::parse("acme corp").is_err());
        assert!(TenantId::parse("").is_err());
        assert!(TenantId::parse(&"a".repeat(65)).is_err());
    }

    #[test]
    fn run_token_roundtrip() {
        let t = RunToken::generate([7u8; 24]);
        assert!(t.as_str().starts_with("ml_"));
        let parsed = RunToken::parse(t.as_str()).unwrap();
        assert_eq!(parsed.as_str(), t.as_str());
    }

    #[test]
    fn run_token_rejects_wrong_shape() {
        assert!(RunToken::parse("ml_short").is_err());
        assert!(RunToken::parse("notml_aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa").is_err());
    }

    #[test]
    fn plan_alias_scale_maps_to_enterprise() {
        assert_eq!(Plan::parse("scale").unwrap(), Plan::Enterprise);
    }

    #[test]
    fn verification_status_derivation() {
        assert_eq!(VerificationStatus::derive(true, false), VerificationStatus::Green);
        assert_eq!(VerificationStatus::derive(true, true), VerificationStatus::Amber);
        assert_eq!(VerificationStatus::derive(false, false), VerificationStatus::Red);
    }

    #[test]
    fn normalize_email_lowercases() {
        assert_eq!(normalize_email("Buyer@Example.COM").unwrap(), "buyer@example.com");
    }

    #[test]
    fn normalize_email_rejects_whitespace_and_multiple_ats() {
        assert!(normalize_email("buyer @example.com").is_err());
        assert!(normalize_email("buyer@exa@mple.com").is_err());
        assert!(normalize_email("@example.com").is_err());
        assert!(normalize_email("buyer@").is_err());
    }

    #[test]
    fn normalize_email_rejects_too_long() {
        let local = "a".repeat(MAX_EMAIL_LEN);
        assert!(normalize_email(&format!("{local}@example.com")).is_err());
    }
}
