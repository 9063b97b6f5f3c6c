//! Outbound webhook delivery: the inline `WebhookDispatcher` (spec §4.10)
//! plus the HTTP [`WebhookAttempter`]/[`PaymentTriggerAttempter`] impls the
//! retry engines in `settld-webhooks` call back into (spec §4.11/§4.12).

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Serialize;
use serde_json::Value;
use sha2::Sha256;
use tracing::warn;

use settld_core::{SettldError, TimestampMs};
use settld_crypto::SecretKey;
use settld_store::WebhookConfig;
use settld_webhooks::{AttemptOutcome, PaymentTriggerAttempter, PaymentTriggerPayload, WebhookAttempter};

type HmacSha256 = Hmac<Sha256>;

const USER_AGENT: &str = concat!("settld-dispatch/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Record,
    Http,
}

fn sign(secret: &str, timestamp: &str, body: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(format!("{timestamp}.{body}").as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

fn build_headers(event: &str, signature: &str, timestamp: &str) -> Vec<(String, String)> {
    vec![
        ("content-type".to_string(), "application/json; charset=utf-8".to_string()),
        ("user-agent".to_string(), USER_AGENT.to_string()),
        ("x-settld-event".to_string(), event.to_string()),
        ("x-settld-timestamp".to_string(), timestamp.to_string()),
        ("x-settld-signature".to_string(), format!("v1={signature}")),
    ]
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), SettldError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| SettldError::Storage(e.to_string()))?;
    }
    let body = serde_json::to_vec_pretty(value).map_err(|e| SettldError::Serialization(e.to_string()))?;
    std::fs::write(path, body).map_err(|e| SettldError::Storage(e.to_string()))
}

/// One outbound POST attempt over a real `reqwest::Client`, signing the body
/// with `secret` the way spec §4.10 describes.
async fn post_signed(
    client: &reqwest::Client,
    url: &str,
    event: &str,
    secret: &str,
    body: &str,
    timeout_ms: u64,
) -> (bool, Option<u16>, Option<String>, Vec<(String, String)>) {
    let timestamp = Utc::now().to_rfc3339();
    let signature = sign(secret, &timestamp, body);
    let headers = build_headers(event, &signature, &timestamp);

    let mut request = client.post(url).timeout(Duration::from_millis(timeout_ms)).body(body.to_string());
    for (name, value) in &headers {
        request = request.header(name, value);
    }

    let (ok, status_code, error) = match request.send().await {
        Ok(response) => {
            let status = response.status();
            if status.is_success() {
                (true, Some(status.as_u16()), None)
            } else {
                (false, Some(status.as_u16()), Some(format!("HTTP_{}", status.as_u16())))
            }
        }
        Err(e) => (false, None, Some(e.to_string())),
    };
    (ok, status_code, error, headers)
}

/// Result of one inline `WebhookDispatcher::dispatch` call for a single webhook.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookDispatchResult {
    #[serde(rename = "webhookUrl")]
    pub webhook_url: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recorded: Option<bool>,
    pub attempts: u32,
    #[serde(rename = "statusCode", skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct WebhookDispatcher {
    client: reqwest::Client,
    data_dir: PathBuf,
    settings_key: SecretKey,
}

impl WebhookDispatcher {
    pub fn new(data_dir: impl Into<PathBuf>, settings_key: SecretKey) -> Self {
        WebhookDispatcher {
            client: reqwest::Client::new(),
            data_dir: data_dir.into(),
            settings_key,
        }
    }

    /// Dispatches `event`/`payload` to every enabled webhook subscribed to
    /// `event` in `webhooks`, inline, with up to `max_attempts` HTTP retries
    /// and `retryBackoffMs·2^(n-1)` backoff between them (spec §4.10).
    #[allow(clippy::too_many_arguments)]
    pub async fn dispatch(
        &self,
        tenant_id: &str,
        token: &str,
        event: &str,
        payload: &Value,
        webhooks: &[WebhookConfig],
        mode: DeliveryMode,
        timeout_ms: u64,
        max_attempts: u32,
        retry_backoff_ms: u64,
        now_ms: TimestampMs,
    ) -> Result<Vec<WebhookDispatchResult>, SettldError> {
        let body = serde_json::to_string(payload).map_err(|e| SettldError::Serialization(e.to_string()))?;
        let mut results = Vec::new();

        for (i, webhook) in webhooks.iter().enumerate().filter(|(_, w)| w.enabled && w.events.iter().any(|e| e == event)) {
            let Some(encrypted_secret) = &webhook.secret else {
                return Err(SettldError::WebhookSecretMissing);
            };
            let secret = settld_crypto::decrypt(Some(&self.settings_key), encrypted_secret)
                .ok_or(SettldError::WebhookSecretMissing)?;

            if mode == DeliveryMode::Record {
                let id = format!("{token}_{now_ms}");
                let timestamp = Utc::now().to_rfc3339();
                let signature = sign(&secret, &timestamp, &body);
                let headers = build_headers(event, &signature, &timestamp);
                let record = serde_json::json!({
                    "tenantId": tenant_id,
                    "token": token,
                    "event": event,
                    "url": webhook.url,
                    "headers": headers,
                    "body": body,
                });
                write_json(&self.data_dir.join("webhooks").join("record").join(format!("{id}.json")), &record)?;
                results.push(WebhookDispatchResult {
                    webhook_url: webhook.url.clone(),
                    ok: true,
                    recorded: Some(true),
                    attempts: 0,
                    status_code: None,
                    error: None,
                });
                continue;
            }

            let mut attempt = 0u32;
            let (mut ok, mut status_code, mut error) = (false, None, None);
            while attempt < max_attempts {
                attempt += 1;
                let (a_ok, a_status, a_err, a_headers) =
                    post_signed(&self.client, &webhook.url, event, &secret, &body, timeout_ms).await;
                self.log_attempt(token, now_ms, i, attempt, &webhook.url, &a_headers, &body, a_ok, a_status, &a_err)?;
                ok = a_ok;
                status_code = a_status;
                error = a_err;
                if ok {
                    break;
                }
                if attempt < max_attempts {
                    let delay = retry_backoff_ms.saturating_mul(1u64 << (attempt - 1).min(16));
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
            }

            if !ok {
                warn!(tenant_id, token, url = %webhook.url, attempts = attempt, "webhook dispatch exhausted inline attempts");
            }

            results.push(WebhookDispatchResult {
                webhook_url: webhook.url.clone(),
                ok,
                recorded: None,
                attempts: attempt,
                status_code,
                error,
            });
        }

        Ok(results)
    }

    /// Persists one attempt log, `webhooks/attempts/<token>_<ms>_<i>_<attempt>.json`,
    /// containing headers, body hash, sent time, and final result (spec §4.10).
    #[allow(clippy::too_many_arguments)]
    fn log_attempt(
        &self,
        token: &str,
        now_ms: TimestampMs,
        webhook_index: usize,
        attempt: u32,
        url: &str,
        headers: &[(String, String)],
        body: &str,
        ok: bool,
        status_code: Option<u16>,
        error: &Option<String>,
    ) -> Result<(), SettldError> {
        let body_hash = settld_crypto::sha256_hex(body.as_bytes());
        let path = self
            .data_dir
            .join("webhooks")
            .join("attempts")
            .join(format!("{token}_{now_ms}_{webhook_index}_{attempt}_attempt.json"));
        let record = serde_json::json!({
            "url": url,
            "headers": headers,
            "bodyHash": body_hash,
            "sentAt": now_ms,
            "ok": ok,
            "statusCode": status_code,
            "error": error,
        });
        write_json(&path, &record)
    }
}

/// Implements the retry-engine-facing attempter traits with real HTTP calls,
/// so `settld-webhooks`' queues stay transport-free.
pub struct HttpAttempter {
    client: reqwest::Client,
    settings_key: SecretKey,
    timeout_ms: u64,
}

impl HttpAttempter {
    pub fn new(settings_key: SecretKey, timeout_ms: u64) -> Self {
        HttpAttempter { client: reqwest::Client::new(), settings_key, timeout_ms }
    }
}

#[async_trait]
impl WebhookAttempter for HttpAttempter {
    async fn attempt(&self, webhook: &WebhookConfig, event: &str, payload: &Value) -> AttemptOutcome {
        let Some(encrypted_secret) = &webhook.secret else {
            return AttemptOutcome { ok: false, status_code: None, error: Some("WEBHOOK_SECRET_MISSING".to_string()) };
        };
        let secret = match settld_crypto::decrypt(Some(&self.settings_key), encrypted_secret) {
            Some(s) => s,
            None => return AttemptOutcome { ok: false, status_code: None, error: Some("WEBHOOK_SECRET_MISSING".to_string()) },
        };
        let body = match serde_json::to_string(payload) {
            Ok(b) => b,
            Err(e) => return AttemptOutcome { ok: false, status_code: None, error: Some(e.to_string()) },
        };
        let (ok, status_code, error, _headers) = post_signed(&self.client, &webhook.url, event, &secret, &body, self.timeout_ms).await;
        AttemptOutcome { ok, status_code, error }
    }
}

#[async_trait]
impl PaymentTriggerAttempter for HttpAttempter {
    async fn attempt(&self, webhook_url: &str, webhook_secret: Option<&str>, payload: &PaymentTriggerPayload) -> AttemptOutcome {
        let Some(secret) = webhook_secret else {
            return AttemptOutcome { ok: false, status_code: None, error: Some("WEBHOOK_SECRET_MISSING".to_string()) };
        };
        let body = match serde_json::to_string(payload) {
            Ok(b) => b,
            Err(e) => return AttemptOutcome { ok: false, status_code: None, error: Some(e.to_string()) },
        };
        let (ok, status_code, error, _headers) = post_signed(&self.client, webhook_url, "payment.approval_ready", secret, &body, self.timeout_ms).await;
        AttemptOutcome { ok, status_code, error }
    }
}
