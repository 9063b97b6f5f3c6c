//! Idempotent delivery of the `payment.approval_ready` event, with its own
//! retry queue and a per-(tenant,token) state record (spec §4.12).

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use settld_core::{Decision, SettldError, TimestampMs, VerificationStatus};

use crate::retry::{job_id, AttemptOutcome};

/// `MagicLinkPaymentTrigger.v1` (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentTriggerPayload {
    #[serde(rename = "schemaVersion")]
    pub schema_version: String,
    #[serde(rename = "tenantId")]
    pub tenant_id: String,
    pub token: String,
    pub decision: Decision,
    #[serde(rename = "verificationStatus")]
    pub verification_status: VerificationStatus,
    #[serde(rename = "artifactUrl")]
    pub artifact_url: String,
}

impl PaymentTriggerPayload {
    pub fn new(tenant_id: &str, token: &str, decision: Decision, verification_status: VerificationStatus, public_base_url: &str) -> Self {
        PaymentTriggerPayload {
            schema_version: "MagicLinkPaymentTrigger.v1".to_string(),
            tenant_id: tenant_id.to_string(),
            token: token.to_string(),
            decision,
            verification_status,
            artifact_url: format!("{}/runs/{}/artifact", public_base_url.trim_end_matches('/'), token),
        }
    }
}

#[async_trait]
pub trait PaymentTriggerAttempter: Send + Sync {
    async fn attempt(&self, webhook_url: &str, webhook_secret: Option<&str>, payload: &PaymentTriggerPayload) -> AttemptOutcome;
}

/// `payment_triggers/<tenantId>/<token>.json`: the last attempt's outcome.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PaymentTriggerState {
    pub ok: bool,
    #[serde(rename = "deliveredAt", skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<TimestampMs>,
    #[serde(rename = "lastError", skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(rename = "lastStatusCode", skip_serializing_if = "Option::is_none")]
    pub last_status_code: Option<u16>,
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PaymentTriggerRetryJob {
    #[serde(rename = "tenantId")]
    tenant_id: String,
    token: String,
    #[serde(rename = "reportHash")]
    report_hash: String,
    #[serde(rename = "webhookUrl")]
    webhook_url: String,
    #[serde(rename = "webhookSecret", skip_serializing_if = "Option::is_none")]
    webhook_secret: Option<String>,
    payload: PaymentTriggerPayload,
    #[serde(rename = "maxAttempts")]
    max_attempts: u32,
    #[serde(rename = "backoffMs")]
    backoff_ms: u64,
    #[serde(rename = "attemptCount")]
    attempt_count: u32,
    #[serde(rename = "nextAttemptAt")]
    next_attempt_at: TimestampMs,
    #[serde(rename = "replayCount", default)]
    replay_count: u32,
}

pub struct PaymentTriggerEngine {
    data_dir: PathBuf,
    attempter: Box<dyn PaymentTriggerAttempter>,
}

impl PaymentTriggerEngine {
    pub fn new(data_dir: impl Into<PathBuf>, attempter: Box<dyn PaymentTriggerAttempter>) -> Self {
        PaymentTriggerEngine { data_dir: data_dir.into(), attempter }
    }

    fn state_path(&self, tenant_id: &str, token: &str) -> PathBuf {
        self.data_dir.join("payment_triggers").join(tenant_id).join(format!("{token}.json"))
    }

    fn pending_path(&self, id: &str) -> PathBuf {
        self.data_dir.join("payment_trigger_retry").join("pending").join(format!("{id}.json"))
    }

    fn dead_letter_path(&self, id: &str) -> PathBuf {
        self.data_dir.join("payment_trigger_retry").join("dead-letter").join(format!("{id}.json"))
    }

    fn attempts_log_path(&self, id: &str) -> PathBuf {
        self.data_dir.join("payment_trigger_retry").join("attempts").join(format!("{id}.jsonl"))
    }

    pub fn load_state(&self, tenant_id: &str, token: &str) -> Result<PaymentTriggerState, SettldError> {
        let path = self.state_path(tenant_id, token);
        if !path.exists() {
            return Ok(PaymentTriggerState::default());
        }
        read_json(&path)
    }

    /// Fires the trigger for an approved run. A prior successful delivery
    /// (`deliveredAt` set) is an inline no-op — returns the existing state
    /// unchanged (spec §4.12 "inline-skip on prior deliveredAt").
    #[allow(clippy::too_many_arguments)]
    pub async fn fire(
        &self,
        tenant_id: &str,
        token: &str,
        decision: Decision,
        verification_status: VerificationStatus,
        report_hash: &str,
        webhook_url: &str,
        webhook_secret: Option<&str>,
        public_base_url: &str,
        max_attempts: u32,
        backoff_ms: u64,
        now_ms: TimestampMs,
    ) -> Result<PaymentTriggerState, SettldError> {
        if decision != Decision::Approve {
            return Err(SettldError::PaymentTriggerNotApproved);
        }

        let existing = self.load_state(tenant_id, token)?;
        if existing.delivered_at.is_some() {
            return Ok(existing);
        }

        let payload = PaymentTriggerPayload::new(tenant_id, token, decision, verification_status, public_base_url);
        let outcome = self.attempter.attempt(webhook_url, webhook_secret, &payload).await;

        let mut state = existing;
        state.attempts += 1;
        state.last_status_code = outcome.status_code;
        state.last_error = outcome.error.clone();

        if outcome.ok {
            state.ok = true;
            state.delivered_at = Some(now_ms);
            write_json(&self.state_path(tenant_id, token), &state)?;
            info!(tenant_id, token, "payment trigger delivered inline");
            return Ok(state);
        }

        write_json(&self.state_path(tenant_id, token), &state)?;
        self.enqueue_retry(tenant_id, token, report_hash, webhook_url, webhook_secret, payload, max_attempts, backoff_ms, now_ms)?;
        Ok(state)
    }

    #[allow(clippy::too_many_arguments)]
    fn enqueue_retry(
        &self,
        tenant_id: &str,
        token: &str,
        report_hash: &str,
        webhook_url: &str,
        webhook_secret: Option<&str>,
        payload: PaymentTriggerPayload,
        max_attempts: u32,
        backoff_ms: u64,
        now_ms: TimestampMs,
    ) -> Result<String, SettldError> {
        let idempotency_key = settld_crypto::sha256_str(report_hash);
        let id = job_id(tenant_id, token, &idempotency_key);
        if self.pending_path(&id).exists() || self.dead_letter_path(&id).exists() {
            return Ok(id);
        }

        let job = PaymentTriggerRetryJob {
            tenant_id: tenant_id.to_string(),
            token: token.to_string(),
            report_hash: report_hash.to_string(),
            webhook_url: webhook_url.to_string(),
            webhook_secret: webhook_secret.map(str::to_string),
            payload,
            max_attempts,
            backoff_ms,
            attempt_count: 1,
            next_attempt_at: now_ms + crate::retry::backoff_delay_ms(backoff_ms, 1) as i64,
            replay_count: 0,
        };
        write_json(&self.pending_path(&id), &job)?;
        Ok(id)
    }

    /// One scan of `payment_trigger_retry/pending/` for due jobs.
    pub async fn tick(&self, now_ms: TimestampMs) -> Result<u64, SettldError> {
        let dir = self.data_dir.join("payment_trigger_retry").join("pending");
        let entries = match std::fs::read_dir(&dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(SettldError::Storage(e.to_string())),
        };

        let mut delivered = 0u64;
        for entry in entries {
            let entry = entry.map_err(|e| SettldError::Storage(e.to_string()))?;
            let id = entry.path().file_stem().map(|s| s.to_string_lossy().to_string()).unwrap_or_default();
            let mut job: PaymentTriggerRetryJob = read_json(&entry.path())?;
            if job.next_attempt_at > now_ms {
                continue;
            }

            let outcome = self.attempter.attempt(&job.webhook_url, job.webhook_secret.as_deref(), &job.payload).await;
            append_attempt_log(&self.attempts_log_path(&id), now_ms, &outcome)?;

            if outcome.ok {
                let mut state = self.load_state(&job.tenant_id, &job.token)?;
                state.ok = true;
                state.delivered_at = Some(now_ms);
                write_json(&self.state_path(&job.tenant_id, &job.token), &state)?;
                std::fs::remove_file(entry.path()).map_err(|e| SettldError::Storage(e.to_string()))?;
                delivered += 1;
                continue;
            }

            job.attempt_count += 1;
            if job.attempt_count >= job.max_attempts {
                write_json(&self.dead_letter_path(&id), &job)?;
                std::fs::remove_file(entry.path()).map_err(|e| SettldError::Storage(e.to_string()))?;
                warn!(tenant_id = %job.tenant_id, token = %job.token, id = %id, "payment trigger retry exhausted, moved to dead letter");
            } else {
                job.next_attempt_at = now_ms + crate::retry::backoff_delay_ms(job.backoff_ms, job.attempt_count) as i64;
                write_json(&entry.path(), &job)?;
            }
        }
        Ok(delivered)
    }

    pub fn replay(&self, id: &str, reset_attempts: bool, now_ms: TimestampMs) -> Result<(), SettldError> {
        let dl_path = self.dead_letter_path(id);
        if !dl_path.exists() {
            return Err(SettldError::NotFound);
        }
        if self.pending_path(id).exists() {
            return Err(SettldError::PendingExists);
        }
        let mut job: PaymentTriggerRetryJob = read_json(&dl_path)?;
        job.next_attempt_at = now_ms;
        job.replay_count += 1;
        if reset_attempts {
            job.attempt_count = 0;
        }
        write_json(&self.pending_path(id), &job)?;
        std::fs::remove_file(&dl_path).map_err(|e| SettldError::Storage(e.to_string()))
    }
}

fn append_attempt_log(path: &Path, now_ms: TimestampMs, outcome: &AttemptOutcome) -> Result<(), SettldError> {
    use std::io::Write;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| SettldError::Storage(e.to_string()))?;
    }
    let line = serde_json::json!({"attemptedAt": now_ms, "ok": outcome.ok, "statusCode": outcome.status_code, "error": outcome.error});
    let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path).map_err(|e| SettldError::Storage(e.to_string()))?;
    writeln!(file, "{line}").map_err(|e| SettldError::Storage(e.to_string()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), SettldError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| SettldError::Storage(e.to_string()))?;
    }
    let body = serde_json::to_vec_pretty(value).map_err(|e| SettldError::Serialization(e.to_string()))?;
    std::fs::write(path, body).map_err(|e| SettldError::Storage(e.to_string()))
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, SettldError> {
    let raw = std::fs::read_to_string(path).map_err(|e| SettldError::Storage(e.to_string()))?;
    serde_json::from_str(&raw).map_err(|e| SettldError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ScriptedAttempter {
        ok: bool,
    }

    #[async_trait]
    impl PaymentTriggerAttempter for ScriptedAttempter {
        async fn attempt(&self, _url: &str, _secret: Option<&str>, _payload: &PaymentTriggerPayload) -> AttemptOutcome {
            AttemptOutcome { ok: self.ok, status_code: Some(if self.ok { 200 } else { 500 }), error: (!self.ok).then(|| "boom".to_string()) }
        }
    }

    #[tokio::test]
    async fn fire_rejects_non_approve_decisions() {
        let dir = tempfile::tempdir().unwrap();
        let engine = PaymentTriggerEngine::new(dir.path(), Box::new(ScriptedAttempter { ok: true }));
        let err = engine
            .fire("acme", "ml_a", Decision::Hold, VerificationStatus::Green, "hash", "https://ex/cb", None, "https://api.example.com", 3, 1000, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, SettldError::PaymentTriggerNotApproved));
    }

    #[tokio::test]
    async fn fire_delivers_inline_on_success() {
        let dir = tempfile::tempdir().unwrap();
        let engine = PaymentTriggerEngine::new(dir.path(), Box::new(ScriptedAttempter { ok: true }));
        let state = engine
            .fire("acme", "ml_a", Decision::Approve, VerificationStatus::Green, "hash", "https://ex/cb", Some("s3cr3t"), "https://api.example.com", 3, 1000, 5000)
            .await
            .unwrap();
        assert!(state.ok);
        assert_eq!(state.delivered_at, Some(5000));
    }

    #[tokio::test]
    async fn fire_is_a_no_op_once_already_delivered() {
        let dir = tempfile::tempdir().unwrap();
        let engine = PaymentTriggerEngine::new(dir.path(), Box::new(ScriptedAttempter { ok: false }));
        let mut delivered = PaymentTriggerState::default();
        delivered.ok = true;
        delivered.delivered_at = Some(1000);
        write_json(&engine.state_path("acme", "ml_a"), &delivered).unwrap();

        let state = engine
            .fire("acme", "ml_a", Decision::Approve, VerificationStatus::Green, "hash", "https://ex/cb", None, "https://api.example.com", 3, 1000, 9000)
            .await
            .unwrap();
        assert_eq!(state.delivered_at, Some(1000));
    }

    #[tokio::test]
    async fn fire_enqueues_retry_on_inline_failure_and_tick_delivers() {
        let dir = tempfile::tempdir().unwrap();
        let engine = PaymentTriggerEngine::new(dir.path(), Box::new(ScriptedAttempter { ok: false }));
        engine
            .fire("acme", "ml_a", Decision::Approve, VerificationStatus::Green, "report-hash-1", "https://ex/cb", None, "https://api.example.com", 3, 0, 0)
            .await
            .unwrap();

        let pending_count = std::fs::read_dir(dir.path().join("payment_trigger_retry").join("pending")).unwrap().count();
        assert_eq!(pending_count, 1);
    }
}
