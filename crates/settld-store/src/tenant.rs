//! Versioned per-tenant settings (spec §4.3).
//!
//! Stored at `<dataDir>/tenants/<tenantId>/settings.json`. Secret fields are
//! either `null`, plaintext (pre-encryption), or an `enc:v1:` envelope; on
//! save, plaintext secrets are encrypted when a settings key is configured,
//! and existing envelopes are preserved untouched.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use settld_core::{DefaultMode, Plan, SettldError, RETENTION_DAYS_MAX, RETENTION_DAYS_MIN};
use settld_crypto::SecretKey;

const SCHEMA_VERSION: &str = "MagicLinkTenantSettings.v2";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    Record,
    Webhook,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    pub events: Vec<String>,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PaymentTriggersConfig {
    pub enabled: bool,
    #[serde(rename = "deliveryMode")]
    pub delivery_mode: Option<DeliveryMode>,
    #[serde(rename = "webhookUrl", skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    #[serde(rename = "webhookSecret", skip_serializing_if = "Option::is_none")]
    pub webhook_secret: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuyerNotifications {
    #[serde(rename = "otpEmailEnabled", default = "default_true")]
    pub otp_email_enabled: bool,
    #[serde(rename = "decisionEmailEnabled", default = "default_true")]
    pub decision_email_enabled: bool,
}

fn default_true() -> bool {
    true
}

/// `webhook.url must be http(s)` (spec §8): rejects non-`http(s)` schemes and
/// unparsable urls alike.
fn validate_webhook_url(raw: &str) -> Result<(), SettldError> {
    let parsed = url::Url::parse(raw).map_err(|_| SettldError::Validation("webhook.url must be http(s)".into()))?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(SettldError::Validation("webhook.url must be http(s)".into()));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SseMode {
    None,
    Aes256,
    #[serde(rename = "aws:kms")]
    AwsKms,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArchiveExportSink {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sse: Option<SseMode>,
    #[serde(rename = "kmsKeyId", skip_serializing_if = "Option::is_none")]
    pub kms_key_id: Option<String>,
    #[serde(rename = "accessKeyId", skip_serializing_if = "Option::is_none")]
    pub access_key_id: Option<String>,
    #[serde(rename = "secretAccessKey", skip_serializing_if = "Option::is_none")]
    pub secret_access_key: Option<String>,
    #[serde(rename = "sessionToken", skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SettlementDecisionSigner {
    #[serde(rename = "privateKeyPem", skip_serializing_if = "Option::is_none")]
    pub private_key_pem: Option<String>,
    #[serde(rename = "remoteSignerUrl", skip_serializing_if = "Option::is_none")]
    pub remote_signer_url: Option<String>,
    #[serde(rename = "remoteSignerBearerToken", skip_serializing_if = "Option::is_none")]
    pub remote_signer_bearer_token: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateLimits {
    #[serde(default)]
    pub limits: std::collections::HashMap<String, u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantSettings {
    #[serde(rename = "schemaVersion")]
    pub schema_version: String,
    pub plan: Plan,
    #[serde(rename = "defaultMode")]
    pub default_mode: DefaultMode,
    #[serde(rename = "retentionDays")]
    pub retention_days: u32,
    #[serde(rename = "rateLimits", default)]
    pub rate_limits: RateLimits,
    #[serde(default)]
    pub webhooks: Vec<WebhookConfig>,
    #[serde(rename = "settlementDecisionSigner", skip_serializing_if = "Option::is_none")]
    pub settlement_decision_signer: Option<SettlementDecisionSigner>,
    #[serde(rename = "paymentTriggers", default)]
    pub payment_triggers: PaymentTriggersConfig,
    #[serde(rename = "buyerNotifications", default)]
    pub buyer_notifications: BuyerNotifications,
    #[serde(rename = "archiveExportSink", default)]
    pub archive_export_sink: ArchiveExportSink,
    #[serde(rename = "vendorPolicies", default)]
    pub vendor_policies: std::collections::HashMap<String, settld_policy::PolicyProfile>,
    #[serde(rename = "contractPolicies", default)]
    pub contract_policies: std::collections::HashMap<String, settld_policy::PolicyProfile>,
    /// Present only before v1→v2 migration runs; absent afterward.
    #[serde(rename = "artifactStorage", skip_serializing_if = "Option::is_none")]
    pub artifact_storage: Option<Value>,
}

impl TenantSettings {
    pub fn default_for_plan(plan: Plan) -> Self {
        TenantSettings {
            schema_version: SCHEMA_VERSION.to_string(),
            plan,
            default_mode: DefaultMode::Auto,
            retention_days: settld_core::DEFAULT_RETENTION_DAYS,
            rate_limits: RateLimits::default(),
            webhooks: Vec::new(),
            settlement_decision_signer: None,
            payment_triggers: PaymentTriggersConfig::default(),
            buyer_notifications: BuyerNotifications {
                otp_email_enabled: true,
                decision_email_enabled: true,
            },
            archive_export_sink: ArchiveExportSink::default(),
            vendor_policies: Default::default(),
            contract_policies: Default::default(),
            artifact_storage: None,
        }
    }
}

/// Entitlement limits resolved from the plan catalog, falling back to plan
/// defaults for any field the tenant left null (spec §4.3).
#[derive(Debug, Clone, PartialEq)]
pub struct Entitlements {
    pub max_webhooks: u32,
    pub max_monthly_runs: u32,
    pub archive_export_allowed: bool,
}

fn plan_catalog(plan: Plan) -> Entitlements {
    match plan {
        Plan::Free => Entitlements {
            max_webhooks: 1,
            max_monthly_runs: 50,
            archive_export_allowed: false,
        },
        Plan::Builder => Entitlements {
            max_webhooks: 5,
            max_monthly_runs: 2_000,
            archive_export_allowed: false,
        },
        Plan::Growth => Entitlements {
            max_webhooks: 20,
            max_monthly_runs: 20_000,
            archive_export_allowed: true,
        },
        Plan::Enterprise => Entitlements {
            max_webhooks: 200,
            max_monthly_runs: 1_000_000,
            archive_export_allowed: true,
        },
    }
}

pub struct TenantSettingsStore {
    data_dir: PathBuf,
    settings_key: Option<SecretKey>,
}

impl TenantSettingsStore {
    pub fn new(data_dir: impl Into<PathBuf>, settings_key: Option<SecretKey>) -> Self {
        TenantSettingsStore {
            data_dir: data_dir.into(),
            settings_key,
        }
    }

    fn path(&self, tenant_id: &str) -> PathBuf {
        self.data_dir.join("tenants").join(tenant_id).join("settings.json")
    }

    pub fn load(&self, tenant_id: &str) -> Result<TenantSettings, SettldError> {
        let path = self.path(tenant_id);
        if !path.exists() {
            return Ok(TenantSettings::default_for_plan(Plan::Free));
        }
        let raw = fs::read_to_string(&path).map_err(|e| SettldError::Storage(e.to_string()))?;
        let mut settings: TenantSettings = serde_json::from_str(&raw)
            .map_err(|e| SettldError::Serialization(e.to_string()))?;
        migrate_v1_to_v2(&mut settings);
        Ok(settings)
    }

    pub fn save(&self, tenant_id: &str, mut settings: TenantSettings) -> Result<(), SettldError> {
        validate(&settings)?;
        encrypt_secrets(&mut settings, self.settings_key.as_ref());

        let path = self.path(tenant_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| SettldError::Storage(e.to_string()))?;
        }
        let body = serde_json::to_vec_pretty(&settings)
            .map_err(|e| SettldError::Serialization(e.to_string()))?;
        fs::write(&path, body).map_err(|e| SettldError::Storage(e.to_string()))
    }

    /// Deep-merges `patch` onto the tenant's current settings, validating
    /// each touched sub-object before persisting (spec §4.3). On any
    /// validation failure the existing settings are left untouched.
    pub fn apply_patch(&self, tenant_id: &str, patch: SettingsPatch) -> Result<TenantSettings, SettldError> {
        let mut settings = self.load(tenant_id)?;

        if let Some(plan) = patch.plan {
            settings.plan = Plan::parse(&plan)?;
        }
        if let Some(mode) = patch.default_mode {
            settings.default_mode = mode;
        }
        if let Some(days) = patch.retention_days {
            if !(RETENTION_DAYS_MIN..=RETENTION_DAYS_MAX).contains(&days) {
                return Err(SettldError::Validation(format!(
                    "retentionDays must be in [{RETENTION_DAYS_MIN},{RETENTION_DAYS_MAX}]"
                )));
            }
            settings.retention_days = days;
        }
        if let Some(webhooks) = patch.webhooks {
            for w in &webhooks {
                validate_webhook_url(&w.url)?;
                if w.events.is_empty() {
                    return Err(SettldError::Validation("webhook.events must be non-empty".into()));
                }
            }
            settings.webhooks = webhooks;
        }
        if let Some(pt) = patch.payment_triggers {
            if pt.enabled
                && pt.delivery_mode == Some(DeliveryMode::Webhook)
                && pt.webhook_url.is_none()
            {
                return Err(SettldError::Validation(
                    "paymentTriggers.webhookUrl required when deliveryMode=webhook".into(),
                ));
            }
            settings.payment_triggers = pt;
        }
        if let Some(sink) = patch.archive_export_sink {
            if sink.enabled && sink.sse == Some(SseMode::AwsKms) && sink.kms_key_id.is_none() {
                return Err(SettldError::Validation(
                    "archiveExportSink.kmsKeyId required when sse=aws:kms".into(),
                ));
            }
            settings.archive_export_sink = sink;
        }
        if let Some(bn) = patch.buyer_notifications {
            settings.buyer_notifications = bn;
        }
        if let Some(signer) = patch.settlement_decision_signer {
            settings.settlement_decision_signer = Some(signer);
        }

        self.save(tenant_id, settings.clone())?;
        Ok(settings)
    }

    pub fn resolve_entitlements(&self, settings: &TenantSettings) -> Entitlements {
        plan_catalog(settings.plan)
    }
}

/// A deep-merge patch request; every field is optional, and only the fields
/// present are validated and written.
#[derive(Debug, Default, Deserialize)]
pub struct SettingsPatch {
    pub plan: Option<String>,
    #[serde(rename = "defaultMode")]
    pub default_mode: Option<DefaultMode>,
    #[serde(rename = "retentionDays")]
    pub retention_days: Option<u32>,
    pub webhooks: Option<Vec<WebhookConfig>>,
    #[serde(rename = "paymentTriggers")]
    pub payment_triggers: Option<PaymentTriggersConfig>,
    #[serde(rename = "archiveExportSink")]
    pub archive_export_sink: Option<ArchiveExportSink>,
    #[serde(rename = "buyerNotifications")]
    pub buyer_notifications: Option<BuyerNotifications>,
    #[serde(rename = "settlementDecisionSigner")]
    pub settlement_decision_signer: Option<SettlementDecisionSigner>,
}

fn validate(settings: &TenantSettings) -> Result<(), SettldError> {
    if !(RETENTION_DAYS_MIN..=RETENTION_DAYS_MAX).contains(&settings.retention_days) {
        return Err(SettldError::Validation(format!(
            "retentionDays must be in [{RETENTION_DAYS_MIN},{RETENTION_DAYS_MAX}]"
        )));
    }
    for w in &settings.webhooks {
        validate_webhook_url(&w.url)?;
        if w.events.is_empty() {
            return Err(SettldError::Validation("webhook.events must be non-empty".into()));
        }
    }
    if settings.archive_export_sink.enabled
        && settings.archive_export_sink.sse == Some(SseMode::AwsKms)
        && settings.archive_export_sink.kms_key_id.is_none()
    {
        return Err(SettldError::Validation(
            "archiveExportSink.kmsKeyId required when sse=aws:kms".into(),
        ));
    }
    Ok(())
}

/// Strips secret envelopes to `null` before returning settings in an API
/// response (spec §4.3): `webhook.secret`, `webhookSecret`, `privateKeyPem`,
/// `remoteSignerBearerToken`, `secretAccessKey`, `sessionToken`.
pub fn sanitize_for_api(mut settings: TenantSettings) -> TenantSettings {
    for w in &mut settings.webhooks {
        w.secret = None;
    }
    settings.payment_triggers.webhook_secret = None;
    if let Some(signer) = &mut settings.settlement_decision_signer {
        signer.private_key_pem = None;
        signer.remote_signer_bearer_token = None;
    }
    settings.archive_export_sink.secret_access_key = None;
    settings.archive_export_sink.session_token = None;
    settings
}

fn encrypt_secrets(settings: &mut TenantSettings, key: Option<&SecretKey>) {
    let Some(key) = key else { return };
    for w in &mut settings.webhooks {
        if let Some(secret) = &w.secret {
            if !settld_crypto::is_envelope(secret) {
                w.secret = Some(settld_crypto::encrypt(key, secret));
            }
        }
    }
    if let Some(secret) = &settings.payment_triggers.webhook_secret {
        if !settld_crypto::is_envelope(secret) {
            settings.payment_triggers.webhook_secret = Some(settld_crypto::encrypt(key, secret));
        }
    }
    if let Some(signer) = &mut settings.settlement_decision_signer {
        if let Some(pem) = &signer.private_key_pem {
            if !settld_crypto::is_envelope(pem) {
                signer.private_key_pem = Some(settld_crypto::encrypt(key, pem));
            }
        }
        if let Some(token) = &signer.remote_signer_bearer_token {
            if !settld_crypto::is_envelope(token) {
                signer.remote_signer_bearer_token = Some(settld_crypto::encrypt(key, token));
            }
        }
    }
    if let Some(secret) = &settings.archive_export_sink.secret_access_key {
        if !settld_crypto::is_envelope(secret) {
            settings.archive_export_sink.secret_access_key = Some(settld_crypto::encrypt(key, secret));
        }
    }
}

/// `v1 → v2`: fills `artifactStorage` and `archiveExportSink` when absent,
/// then clears the legacy `artifactStorage` marker (spec §4.3).
fn migrate_v1_to_v2(settings: &mut TenantSettings) {
    if settings.schema_version == SCHEMA_VERSION {
        return;
    }
    if settings.archive_export_sink == ArchiveExportSink::default() {
        if let Some(legacy) = settings.artifact_storage.take() {
            if let Some(bucket) = legacy.get("bucket").and_then(Value::as_str) {
                settings.archive_export_sink.bucket = Some(bucket.to_string());
                settings.archive_export_sink.enabled = true;
            }
        }
    }
    settings.artifact_storage = None;
    settings.schema_version = SCHEMA_VERSION.to_string();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, TenantSettingsStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = TenantSettingsStore::new(dir.path(), None);
        (dir, store)
    }

    #[test]
    fn load_missing_tenant_returns_free_defaults() {
        let (_dir, store) = store();
        let settings = store.load("acme").unwrap();
        assert_eq!(settings.plan, Plan::Free);
        assert_eq!(settings.retention_days, settld_core::DEFAULT_RETENTION_DAYS);
    }

    #[test]
    fn save_then_load_round_trips() {
        let (_dir, store) = store();
        let mut settings = TenantSettings::default_for_plan(Plan::Growth);
        settings.retention_days = 90;
        store.save("acme", settings.clone()).unwrap();

        let loaded = store.load("acme").unwrap();
        assert_eq!(loaded.plan, Plan::Growth);
        assert_eq!(loaded.retention_days, 90);
    }

    #[test]
    fn apply_patch_rejects_out_of_range_retention_without_writing() {
        let (_dir, store) = store();
        let before = store.load("acme").unwrap();
        let err = store
            .apply_patch(
                "acme",
                SettingsPatch {
                    retention_days: Some(9999),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, SettldError::Validation(_)));
        let after = store.load("acme").unwrap();
        assert_eq!(before.retention_days, after.retention_days);
    }

    #[test]
    fn apply_patch_rejects_webhook_with_no_events() {
        let (_dir, store) = store();
        let err = store
            .apply_patch(
                "acme",
                SettingsPatch {
                    webhooks: Some(vec![WebhookConfig {
                        url: "https://example.com/hook".into(),
                        events: vec![],
                        enabled: true,
                        secret: None,
                    }]),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, SettldError::Validation(_)));
    }

    #[test]
    fn apply_patch_rejects_non_http_webhook_scheme() {
        let (_dir, store) = store();
        let err = store
            .apply_patch(
                "acme",
                SettingsPatch {
                    webhooks: Some(vec![WebhookConfig {
                        url: "ftp://x".into(),
                        events: vec!["run.completed".into()],
                        enabled: true,
                        secret: None,
                    }]),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, SettldError::Validation(ref msg) if msg == "webhook.url must be http(s)"));
    }

    #[test]
    fn apply_patch_requires_webhook_url_for_webhook_delivery_mode() {
        let (_dir, store) = store();
        let err = store
            .apply_patch(
                "acme",
                SettingsPatch {
                    payment_triggers: Some(PaymentTriggersConfig {
                        enabled: true,
                        delivery_mode: Some(DeliveryMode::Webhook),
                        webhook_url: None,
                        webhook_secret: None,
                    }),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, SettldError::Validation(_)));
    }

    #[test]
    fn sanitize_for_api_strips_all_secret_fields() {
        let mut settings = TenantSettings::default_for_plan(Plan::Builder);
        settings.webhooks.push(WebhookConfig {
            url: "https://example.com".into(),
            events: vec!["run.completed".into()],
            enabled: true,
            secret: Some("top-secret".into()),
        });
        settings.payment_triggers.webhook_secret = Some("also-secret".into());
        settings.settlement_decision_signer = Some(SettlementDecisionSigner {
            private_key_pem: Some("pem".into()),
            remote_signer_url: Some("https://signer.example.com".into()),
            remote_signer_bearer_token: Some("bearer".into()),
        });
        settings.archive_export_sink.secret_access_key = Some("ak".into());
        settings.archive_export_sink.session_token = Some("st".into());

        let sanitized = sanitize_for_api(settings);
        assert!(sanitized.webhooks[0].secret.is_none());
        assert!(sanitized.payment_triggers.webhook_secret.is_none());
        let signer = sanitized.settlement_decision_signer.unwrap();
        assert!(signer.private_key_pem.is_none());
        assert!(signer.remote_signer_bearer_token.is_none());
        assert_eq!(signer.remote_signer_url.as_deref(), Some("https://signer.example.com"));
        assert!(sanitized.archive_export_sink.secret_access_key.is_none());
        assert!(sanitized.archive_export_sink.session_token.is_none());
    }

    #[test]
    fn save_encrypts_plaintext_secrets_when_key_present() {
        let dir = tempfile::tempdir().unwrap();
        let key = SecretKey::derive_from_bytes(b"a-sixteen-byte-or-longer-key!!");
        let store = TenantSettingsStore::new(dir.path(), Some(key));

        let mut settings = TenantSettings::default_for_plan(Plan::Builder);
        settings.webhooks.push(WebhookConfig {
            url: "https://example.com".into(),
            events: vec!["run.completed".into()],
            enabled: true,
            secret: Some("plaintext-secret".into()),
        });
        store.save("acme", settings).unwrap();

        let loaded = store.load("acme").unwrap();
        let stored_secret = loaded.webhooks[0].secret.as_ref().unwrap();
        assert!(settld_crypto::is_envelope(stored_secret));
    }

    #[test]
    fn resolve_entitlements_falls_back_to_plan_defaults() {
        let (_dir, store) = store();
        let settings = TenantSettings::default_for_plan(Plan::Enterprise);
        let ent = store.resolve_entitlements(&settings);
        assert_eq!(ent.max_webhooks, 200);
        assert!(ent.archive_export_allowed);
    }
}
