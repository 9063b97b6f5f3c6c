//! A single decision reached over a run, and the signed-shape settlement
//! report derived from it (spec §3, §6).

use serde::{Deserialize, Serialize};

use settld_core::{Decision, TimestampMs, VerificationStatus};

/// One entry in a run's append-only actor log (`decisions/<token>.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionEvent {
    pub decision: Decision,
    #[serde(rename = "decidedAt")]
    pub decided_at: TimestampMs,
    #[serde(rename = "decidedByEmail")]
    pub decided_by_email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// One `settlement_decisions/<token>/NNNN_{approve|hold}.json` file.
///
/// `sequence` is this report's position in the token's dense `0000..N-1`
/// file-name prefix (spec §8 property 4); `report_hash` is what
/// `PaymentTriggerEngine` uses as its idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementDecisionReport {
    pub token: String,
    pub sequence: u32,
    pub decision: Decision,
    #[serde(rename = "decidedAt")]
    pub decided_at: TimestampMs,
    #[serde(rename = "decidedByEmail")]
    pub decided_by_email: String,
    #[serde(rename = "verificationStatus")]
    pub verification_status: VerificationStatus,
    #[serde(rename = "reportHash")]
    pub report_hash: String,
}

impl SettlementDecisionReport {
    /// File name for this report: `NNNN_{approve|hold}.json`, zero-padded
    /// to 4 digits (spec §3).
    pub fn file_name(&self) -> String {
        format!("{:04}_{}.json", self.sequence, self.decision.as_str())
    }

    /// SHA-256 of the canonical JSON of everything but the hash itself.
    pub fn compute_hash(
        token: &str,
        sequence: u32,
        decision: Decision,
        decided_at: TimestampMs,
        decided_by_email: &str,
        verification_status: VerificationStatus,
    ) -> String {
        let canonical = serde_json::json!({
            "token": token,
            "sequence": sequence,
            "decision": decision.as_str(),
            "decidedAt": decided_at,
            "decidedByEmail": decided_by_email,
            "verificationStatus": verification_status.as_str(),
        });
        let bytes = serde_json::to_vec(&canonical).expect("canonical report always serializes");
        settld_crypto::sha256_hex(&bytes)
    }
}
