//! Per-tenant verification policy resolution (spec §3).

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

use settld_core::DefaultMode;

/// The resolved set of rules a run is verified against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyProfile {
    #[serde(rename = "requiredMode")]
    pub required_mode: DefaultMode,
    #[serde(rename = "failOnWarnings")]
    pub fail_on_warnings: bool,
    #[serde(rename = "allowAmberApprovals", default = "default_true")]
    pub allow_amber_approvals: bool,
    #[serde(rename = "requireProducerReceiptPresent")]
    pub require_producer_receipt_present: bool,
    #[serde(rename = "requiredPricingMatrixSignerKeyIds")]
    pub required_pricing_matrix_signer_key_ids: Vec<String>,
    #[serde(rename = "retentionDays")]
    pub retention_days: Option<u32>,
}

fn default_true() -> bool {
    true
}

impl PolicyProfile {
    /// Sorts and deduplicates `requiredPricingMatrixSignerKeyIds` in place,
    /// matching the "sorted unique" invariant (spec §3).
    pub fn normalize(&mut self) {
        self.required_pricing_matrix_signer_key_ids.sort();
        self.required_pricing_matrix_signer_key_ids.dedup();
    }

    /// SHA-256 over the normalized JSON of this profile, hex-encoded.
    pub fn hash(&self) -> String {
        let mut normalized = self.clone();
        normalized.normalize();
        let json = serde_json::to_vec(&normalized).expect("PolicyProfile always serializes");
        let mut hasher = Sha256::new();
        hasher.update(&json);
        hex::encode(hasher.finalize())
    }
}

/// A tenant's named vendor- and contract-scoped policy overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyBook {
    #[serde(rename = "vendorPolicies", default)]
    pub vendor_policies: HashMap<String, PolicyProfile>,
    #[serde(rename = "contractPolicies", default)]
    pub contract_policies: HashMap<String, PolicyProfile>,
}

impl PolicyBook {
    /// Resolves the effective policy for a run: contract policy wins if
    /// `contractId` matches a key in `contractPolicies`; else the vendor
    /// policy keyed by `vendorId`; else `None` (unset — caller falls back to
    /// a built-in default).
    pub fn resolve(
        &self,
        vendor_id: Option<&str>,
        contract_id: Option<&str>,
    ) -> Option<&PolicyProfile> {
        if let Some(cid) = contract_id {
            if let Some(profile) = self.contract_policies.get(cid) {
                return Some(profile);
            }
        }
        if let Some(vid) = vendor_id {
            if let Some(profile) = self.vendor_policies.get(vid) {
                return Some(profile);
            }
        }
        None
    }
}
