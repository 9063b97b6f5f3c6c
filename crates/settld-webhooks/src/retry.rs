//! Durable webhook retry queue: `pending/<id>.json` → delivered or
//! `dead-letter/<id>.json`, replayable by an operator (spec §4.11).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use settld_core::{SettldError, TimestampMs};
use settld_store::WebhookConfig;

/// Attempt exponent cap and absolute delay cap (spec §5).
const MAX_BACKOFF_EXPONENT: u32 = 16;
const MAX_BACKOFF_MS: u64 = 86_400_000;

/// `backoffMs · 2^(n-1)`, capped (spec §8 property 8). `n` is 1-based.
pub fn backoff_delay_ms(backoff_ms: u64, attempt_n: u32) -> u64 {
    let exponent = attempt_n.saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
    backoff_ms.saturating_mul(1u64 << exponent).min(MAX_BACKOFF_MS)
}

/// The outcome of one dispatch attempt, reported back by whatever
/// implements [`WebhookAttempter`] (the concrete HTTP dispatcher lives in
/// `settld-dispatch`, injected here to keep this crate transport-free).
#[derive(Debug, Clone)]
pub struct AttemptOutcome {
    pub ok: bool,
    pub status_code: Option<u16>,
    pub error: Option<String>,
}

#[async_trait]
pub trait WebhookAttempter: Send + Sync {
    async fn attempt(&self, webhook: &WebhookConfig, event: &str, payload: &Value) -> AttemptOutcome;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    #[serde(rename = "attemptedAt")]
    pub attempted_at: TimestampMs,
    #[serde(rename = "statusCode", skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookRetryJob {
    #[serde(rename = "tenantId")]
    pub tenant_id: String,
    pub token: String,
    pub event: String,
    pub url: String,
    pub payload: Value,
    pub webhook: WebhookConfig,
    #[serde(rename = "maxAttempts")]
    pub max_attempts: u32,
    #[serde(rename = "backoffMs")]
    pub backoff_ms: u64,
    #[serde(rename = "attemptCount")]
    pub attempt_count: u32,
    #[serde(rename = "nextAttemptAt")]
    pub next_attempt_at: TimestampMs,
    #[serde(default)]
    pub attempts: Vec<AttemptRecord>,
    #[serde(rename = "lastError", skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(rename = "lastStatusCode", skip_serializing_if = "Option::is_none")]
    pub last_status_code: Option<u16>,
    #[serde(rename = "replayCount", default)]
    pub replay_count: u32,
    #[serde(rename = "createdAt")]
    pub created_at: TimestampMs,
    #[serde(rename = "deadLetteredAt", skip_serializing_if = "Option::is_none")]
    pub dead_lettered_at: Option<TimestampMs>,
}

/// `<tenantId>_<token>_<hex24>`: the first 24 hex chars of
/// `SHA-256(idempotencyKey)` (spec §4.11).
pub fn job_id(tenant_id: &str, token: &str, idempotency_key: &[u8; 32]) -> String {
    let hex24 = &settld_crypto::sha256_hex(idempotency_key)[..24];
    format!("{tenant_id}_{token}_{hex24}")
}

pub struct WebhookRetryEngine {
    data_dir: PathBuf,
    attempter: Box<dyn WebhookAttempter>,
    running: AtomicBool,
    delivered: std::sync::atomic::AtomicU64,
}

impl WebhookRetryEngine {
    pub fn new(data_dir: impl Into<PathBuf>, attempter: Box<dyn WebhookAttempter>) -> Self {
        WebhookRetryEngine {
            data_dir: data_dir.into(),
            attempter,
            running: AtomicBool::new(false),
            delivered: std::sync::atomic::AtomicU64::new(0),
        }
    }

    fn pending_path(&self, id: &str) -> PathBuf {
        self.data_dir.join("webhook_retry").join("pending").join(format!("{id}.json"))
    }

    fn dead_letter_path(&self, id: &str) -> PathBuf {
        self.data_dir.join("webhook_retry").join("dead-letter").join(format!("{id}.json"))
    }

    pub fn delivered_count(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Enqueues a job after an inline dispatch failure. `initial_attempts`
    /// is the attempt count the inline dispatcher already made
    /// (`result.attempts`); if it already equals `max_attempts` the job
    /// lands directly in dead-letter (spec §4.11 "Enqueue rule"). Returns
    /// the job id; a pre-existing pending or dead-letter file for this id
    /// is left untouched (idempotent enqueue, spec §8 property 1).
    pub fn enqueue(
        &self,
        tenant_id: &str,
        token: &str,
        event: &str,
        url: &str,
        payload: Value,
        webhook: WebhookConfig,
        max_attempts: u32,
        backoff_ms: u64,
        initial_attempts: u32,
        now_ms: TimestampMs,
    ) -> Result<String, SettldError> {
        let payload_json = serde_json::to_string(&payload).map_err(|e| SettldError::Serialization(e.to_string()))?;
        let idempotency_key = settld_crypto::webhook_idempotency_key(tenant_id, token, event, url, &payload_json);
        let id = job_id(tenant_id, token, &idempotency_key);

        if self.pending_path(&id).exists() || self.dead_letter_path(&id).exists() {
            return Ok(id);
        }

        let job = WebhookRetryJob {
            tenant_id: tenant_id.to_string(),
            token: token.to_string(),
            event: event.to_string(),
            url: url.to_string(),
            payload,
            webhook,
            max_attempts,
            backoff_ms,
            attempt_count: initial_attempts,
            next_attempt_at: now_ms + backoff_delay_ms(backoff_ms, initial_attempts.max(1)) as i64,
            attempts: Vec::new(),
            last_error: None,
            last_status_code: None,
            replay_count: 0,
            created_at: now_ms,
            dead_lettered_at: None,
        };

        if initial_attempts >= max_attempts {
            write_json(&self.dead_letter_path(&id), &WebhookRetryJob { dead_lettered_at: Some(now_ms), ..job })?;
        } else {
            write_json(&self.pending_path(&id), &job)?;
        }
        Ok(id)
    }

    /// One reentrancy-guarded scan of `pending/` for jobs whose
    /// `nextAttemptAt <= now`. Returns the number of jobs delivered this
    /// tick (spec §4.11 "Worker").
    pub async fn tick(&self, now_ms: TimestampMs) -> Result<u64, SettldError> {
        if self.running.swap(true, Ordering::Acquire) {
            warn!("webhook retry tick skipped, previous tick still in flight");
            return Ok(0);
        }
        let result = self.tick_inner(now_ms).await;
        self.running.store(false, Ordering::Release);
        result
    }

    async fn tick_inner(&self, now_ms: TimestampMs) -> Result<u64, SettldError> {
        let dir = self.data_dir.join("webhook_retry").join("pending");
        let entries = match std::fs::read_dir(&dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(SettldError::Storage(e.to_string())),
        };

        let mut delivered_this_tick = 0u64;
        for entry in entries {
            let entry = entry.map_err(|e| SettldError::Storage(e.to_string()))?;
            let id = entry.path().file_stem().map(|s| s.to_string_lossy().to_string()).unwrap_or_default();
            let mut job: WebhookRetryJob = read_json(&entry.path())?;
            if job.next_attempt_at > now_ms {
                continue;
            }

            let outcome = self.attempter.attempt(&job.webhook, &job.event, &job.payload).await;
            if outcome.ok {
                std::fs::remove_file(&entry.path()).map_err(|e| SettldError::Storage(e.to_string()))?;
                self.delivered.fetch_add(1, Ordering::Relaxed);
                delivered_this_tick += 1;
                info!(tenant_id = %job.tenant_id, token = %job.token, id = %id, "webhook retry delivered");
                continue;
            }

            job.attempts.push(AttemptRecord { attempted_at: now_ms, status_code: outcome.status_code, error: outcome.error.clone() });
            job.last_error = outcome.error;
            job.last_status_code = outcome.status_code;
            job.attempt_count += 1;

            if job.attempt_count >= job.max_attempts {
                job.dead_lettered_at = Some(now_ms);
                write_json(&self.dead_letter_path(&id), &job)?;
                std::fs::remove_file(&entry.path()).map_err(|e| SettldError::Storage(e.to_string()))?;
                warn!(tenant_id = %job.tenant_id, token = %job.token, id = %id, "webhook retry exhausted, moved to dead letter");
            } else {
                job.next_attempt_at = now_ms + backoff_delay_ms(job.backoff_ms, job.attempt_count) as i64;
                write_json(&entry.path(), &job)?;
            }
        }
        Ok(delivered_this_tick)
    }

    /// Restores a dead-lettered job to pending. Fails with `NOT_FOUND` if
    /// no dead-letter file exists, or `PENDING_EXISTS` if one already does
    /// (spec §4.11 "Replay"). When `current_webhooks` is `Some` (the
    /// tenant's *current* settings, for `useCurrentSettings=true`), the
    /// job's `url`/`webhook` row is refreshed from whichever enabled webhook
    /// still subscribes to the job's event, so a replay picks up secret
    /// rotations and url changes made since the job was first enqueued.
    pub fn replay(
        &self,
        id: &str,
        reset_attempts: bool,
        current_webhooks: Option<&[WebhookConfig]>,
        now_ms: TimestampMs,
    ) -> Result<(), SettldError> {
        let dl_path = self.dead_letter_path(id);
        if !dl_path.exists() {
            return Err(SettldError::NotFound);
        }
        if self.pending_path(id).exists() {
            return Err(SettldError::PendingExists);
        }

        let mut job: WebhookRetryJob = read_json(&dl_path)?;
        job.next_attempt_at = now_ms;
        job.replay_count += 1;
        job.dead_lettered_at = None;
        if reset_attempts {
            job.attempt_count = 0;
            job.attempts.clear();
        }
        if let Some(webhooks) = current_webhooks {
            if let Some(current) = webhooks.iter().find(|w| w.enabled && w.events.iter().any(|e| e == &job.event)) {
                job.url = current.url.clone();
                job.webhook = current.clone();
            }
        }

        write_json(&self.pending_path(id), &job)?;
        std::fs::remove_file(&dl_path).map_err(|e| SettldError::Storage(e.to_string()))
    }
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
    use std::sync::Mutex;

    struct ScriptedAttempter {
        outcomes: Mutex<Vec<AttemptOutcome>>,
    }

    #[async_trait]
    impl WebhookAttempter for ScriptedAttempter {
        async fn attempt(&self, _webhook: &WebhookConfig, _event: &str, _payload: &Value) -> AttemptOutcome {
            self.outcomes.lock().unwrap().remove(0)
        }
    }

    fn webhook() -> WebhookConfig {
        WebhookConfig { url: "https://example.com/hook".into(), events: vec!["run.completed".into()], enabled: true, secret: None }
    }

    #[test]
    fn backoff_grows_and_caps() {
        assert_eq!(backoff_delay_ms(1000, 1), 1000);
        assert_eq!(backoff_delay_ms(1000, 2), 2000);
        assert_eq!(backoff_delay_ms(1000, 4), 8000);
        assert_eq!(backoff_delay_ms(1_000_000_000, 30), MAX_BACKOFF_MS);
    }

    #[tokio::test]
    async fn enqueue_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let engine = WebhookRetryEngine::new(dir.path(), Box::new(ScriptedAttempter { outcomes: Mutex::new(vec![]) }));
        let payload = serde_json::json!({"a": 1});

        let id1 = engine.enqueue("acme", "ml_a", "run.completed", "https://example.com/hook", payload.clone(), webhook(), 3, 1000, 1, 0).unwrap();
        let id2 = engine.enqueue("acme", "ml_a", "run.completed", "https://example.com/hook", payload, webhook(), 3, 1000, 1, 0).unwrap();
        assert_eq!(id1, id2);

        let pending_count = std::fs::read_dir(dir.path().join("webhook_retry").join("pending")).unwrap().count();
        assert_eq!(pending_count, 1);
    }

    #[tokio::test]
    async fn enqueue_goes_straight_to_dead_letter_when_attempts_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let engine = WebhookRetryEngine::new(dir.path(), Box::new(ScriptedAttempter { outcomes: Mutex::new(vec![]) }));
        let id = engine.enqueue("acme", "ml_a", "run.completed", "https://example.com/hook", serde_json::json!({}), webhook(), 3, 1000, 3, 0).unwrap();

        assert!(!engine.pending_path(&id).exists());
        assert!(engine.dead_letter_path(&id).exists());
    }

    #[tokio::test]
    async fn tick_delivers_due_job_and_removes_pending_file() {
        let dir = tempfile::tempdir().unwrap();
        let engine = WebhookRetryEngine::new(
            dir.path(),
            Box::new(ScriptedAttempter { outcomes: Mutex::new(vec![AttemptOutcome { ok: true, status_code: Some(200), error: None }]) }),
        );
        let id = engine.enqueue("acme", "ml_a", "run.completed", "https://example.com/hook", serde_json::json!({}), webhook(), 3, 1000, 1, 0).unwrap();

        let delivered = engine.tick(10_000).await.unwrap();
        assert_eq!(delivered, 1);
        assert!(!engine.pending_path(&id).exists());
        assert_eq!(engine.delivered_count(), 1);
    }

    #[tokio::test]
    async fn exhausted_job_moves_to_dead_letter_and_replay_restores_it() {
        let dir = tempfile::tempdir().unwrap();
        let engine = WebhookRetryEngine::new(
            dir.path(),
            Box::new(ScriptedAttempter {
                outcomes: Mutex::new(vec![AttemptOutcome { ok: false, status_code: Some(500), error: Some("boom".into()) }]),
            }),
        );
        let id = engine.enqueue("acme", "ml_a", "run.completed", "https://example.com/hook", serde_json::json!({}), webhook(), 1, 1000, 0, 0).unwrap();

        engine.tick(10_000).await.unwrap();
        assert!(engine.dead_letter_path(&id).exists());
        assert!(!engine.pending_path(&id).exists());

        engine.replay(&id, true, None, 20_000).unwrap();
        assert!(engine.pending_path(&id).exists());
        assert!(!engine.dead_letter_path(&id).exists());

        let job: WebhookRetryJob = read_json(&engine.pending_path(&id)).unwrap();
        assert_eq!(job.attempt_count, 0);
        assert_eq!(job.replay_count, 1);
    }

    #[tokio::test]
    async fn replay_refuses_when_pending_already_exists() {
        let dir = tempfile::tempdir().unwrap();
        let engine = WebhookRetryEngine::new(dir.path(), Box::new(ScriptedAttempter { outcomes: Mutex::new(vec![]) }));
        let id = engine.enqueue("acme", "ml_a", "run.completed", "https://example.com/hook", serde_json::json!({}), webhook(), 3, 1000, 3, 0).unwrap();
        write_json(&engine.pending_path(&id), &read_json::<WebhookRetryJob>(&engine.dead_letter_path(&id)).unwrap()).unwrap();

        let err = engine.replay(&id, false, None, 0).unwrap_err();
        assert!(matches!(err, SettldError::PendingExists));
    }

    #[tokio::test]
    async fn replay_missing_dead_letter_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let engine = WebhookRetryEngine::new(dir.path(), Box::new(ScriptedAttempter { outcomes: Mutex::new(vec![]) }));
        let err = engine.replay("nonexistent", false, None, 0).unwrap_err();
        assert!(matches!(err, SettldError::NotFound));
    }

    #[tokio::test]
    async fn replay_with_current_settings_refreshes_url_and_secret() {
        let dir = tempfile::tempdir().unwrap();
        let engine = WebhookRetryEngine::new(
            dir.path(),
            Box::new(ScriptedAttempter {
                outcomes: Mutex::new(vec![AttemptOutcome { ok: false, status_code: Some(500), error: Some("boom".into()) }]),
            }),
        );
        let id = engine.enqueue("acme", "ml_a", "run.completed", "https://old.example.com/hook", serde_json::json!({}), webhook(), 1, 1000, 0, 0).unwrap();
        engine.tick(10_000).await.unwrap();
        assert!(engine.dead_letter_path(&id).exists());

        let rotated = WebhookConfig {
            url: "https://new.example.com/hook".into(),
            events: vec!["run.completed".into()],
            enabled: true,
            secret: Some("enc:v1:rotated".into()),
        };
        engine.replay(&id, true, Some(std::slice::from_ref(&rotated)), 20_000).unwrap();

        let job: WebhookRetryJob = read_json(&engine.pending_path(&id)).unwrap();
        assert_eq!(job.url, "https://new.example.com/hook");
        assert_eq!(job.webhook.secret.as_deref(), Some("enc:v1:rotated"));
    }
}
