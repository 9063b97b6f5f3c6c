//! Append-only decision history and sequenced settlement report writer.
//!
//! Two files per token: `decisions/<token>.json` (the full actor log) and
//! `settlement_decisions/<token>/NNNN_{approve|hold}.json` (one report per
//! decision, in a strictly increasing dense `0000..N-1` prefix).

use std::fs;
use std::path::PathBuf;

use settld_core::{Decision, SettldError, TimestampMs, VerificationStatus};

use crate::reports::{DecisionEvent, SettlementDecisionReport};

/// Cap on `settlement_decisions/<token>/` report count (spec §3).
pub const MAX_SEQUENCE: u32 = 9999;

/// Parses the leading 4-digit sequence off a report file name, e.g.
/// `"0007_approve.json"` -> `Some(7)`. Returns `None` for anything else
/// found in the directory.
pub fn parse_sequence(file_name: &str) -> Option<u32> {
    let digits = file_name.split('_').next()?;
    if digits.len() != 4 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// `max(existing) + 1`, or `0` when `existing` is empty (spec §3). Returns
/// `None` once the cap is reached.
pub fn next_sequence(existing: &[u32]) -> Option<u32> {
    let candidate = existing.iter().max().map(|m| m + 1).unwrap_or(0);
    (candidate <= MAX_SEQUENCE).then_some(candidate)
}

/// True when `seqs`, sorted, forms the dense prefix `0..seqs.len()` (spec §8
/// property 4).
pub fn is_dense_prefix(seqs: &[u32]) -> bool {
    let mut sorted = seqs.to_vec();
    sorted.sort_unstable();
    sorted.iter().enumerate().all(|(i, &s)| s as usize == i)
}

pub struct DecisionLog {
    data_dir: PathBuf,
}

impl DecisionLog {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        DecisionLog { data_dir: data_dir.into() }
    }

    fn decisions_path(&self, token: &str) -> PathBuf {
        self.data_dir.join("decisions").join(format!("{token}.json"))
    }

    fn reports_dir(&self, token: &str) -> PathBuf {
        self.data_dir.join("settlement_decisions").join(token)
    }

    pub fn history(&self, token: &str) -> Result<Vec<DecisionEvent>, SettldError> {
        let path = self.decisions_path(token);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&path).map_err(|e| SettldError::Storage(e.to_string()))?;
        serde_json::from_str(&raw).map_err(|e| SettldError::Serialization(e.to_string()))
    }

    /// All settlement reports for `token`, ordered by sequence ascending.
    pub fn reports(&self, token: &str) -> Result<Vec<SettlementDecisionReport>, SettldError> {
        let dir = self.reports_dir(token);
        let mut out = Vec::new();
        let entries = match fs::read_dir(&dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(SettldError::Storage(e.to_string())),
        };
        for entry in entries {
            let entry = entry.map_err(|e| SettldError::Storage(e.to_string()))?;
            let raw = fs::read_to_string(entry.path()).map_err(|e| SettldError::Storage(e.to_string()))?;
            let report: SettlementDecisionReport =
                serde_json::from_str(&raw).map_err(|e| SettldError::Serialization(e.to_string()))?;
            out.push(report);
        }
        out.sort_by_key(|r| r.sequence);
        Ok(out)
    }

    /// Appends `event` to the actor log, then writes the next sequenced
    /// settlement report. Both writes succeed or the caller sees an error
    /// before either lands — the actor log is written only after the
    /// sequence number is known to be available.
    pub fn append(
        &self,
        token: &str,
        decision: Decision,
        decided_at: TimestampMs,
        decided_by_email: &str,
        verification_status: VerificationStatus,
        note: Option<String>,
    ) -> Result<SettlementDecisionReport, SettldError> {
        let dir = self.reports_dir(token);
        let existing: Vec<u32> = match fs::read_dir(&dir) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .filter_map(|e| parse_sequence(&e.file_name().to_string_lossy()))
                .collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(SettldError::Storage(e.to_string())),
        };
        let sequence = next_sequence(&existing)
            .ok_or_else(|| SettldError::Validation(format!("settlement decision report cap of {MAX_SEQUENCE} reached for token {token}")))?;

        let report_hash = SettlementDecisionReport::compute_hash(
            token,
            sequence,
            decision,
            decided_at,
            decided_by_email,
            verification_status,
        );
        let report = SettlementDecisionReport {
            token: token.to_string(),
            sequence,
            decision,
            decided_at,
            decided_by_email: decided_by_email.to_string(),
            verification_status,
            report_hash,
        };

        fs::create_dir_all(&dir).map_err(|e| SettldError::Storage(e.to_string()))?;
        let report_path = dir.join(report.file_name());
        let report_body = serde_json::to_vec_pretty(&report).map_err(|e| SettldError::Serialization(e.to_string()))?;
        fs::write(&report_path, report_body).map_err(|e| SettldError::Storage(e.to_string()))?;

        let mut history = self.history(token)?;
        history.push(DecisionEvent { decision, decided_at, decided_by_email: decided_by_email.to_string(), note });
        let decisions_path = self.decisions_path(token);
        if let Some(parent) = decisions_path.parent() {
            fs::create_dir_all(parent).map_err(|e| SettldError::Storage(e.to_string()))?;
        }
        let history_body = serde_json::to_vec_pretty(&history).map_err(|e| SettldError::Serialization(e.to_string()))?;
        fs::write(&decisions_path, history_body).map_err(|e| SettldError::Storage(e.to_string()))?;

        Ok(report)
    }
}
