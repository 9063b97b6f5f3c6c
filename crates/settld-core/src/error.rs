use thiserror::Error;

/// The closed taxonomy of stable error codes carried by this system (spec §7).
///
/// Callers never parse the `Display` string; they match on variant or call
/// [`SettldError::code`] to get the exact code string that crosses process
/// boundaries (log lines, job `lastError` fields, admin API responses).
#[derive(Debug, Error)]
pub enum SettldError {
    // ── Input validation ─────────────────────────────────────────────────────
    #[error("invalid email: {0}")]
    InvalidEmail(String),

    #[error("invalid tenant id: {0}")]
    InvalidTenant(String),

    #[error("invalid run token: {0}")]
    InvalidRunToken(String),

    #[error("invalid decision: {0}")]
    InvalidDecision(String),

    #[error("invalid actor: {0}")]
    InvalidActor(String),

    #[error("invalid ttl: {0}")]
    InvalidTtl(String),

    #[error("invalid session input")]
    InvalidSessionInput,

    #[error("session signing key missing or too short")]
    SessionKeyMissing,

    #[error("validation error: {0}")]
    Validation(String),

    // ── State ────────────────────────────────────────────────────────────────
    #[error("no active OTP for this tenant/email")]
    OtpMissing,

    #[error("OTP already consumed")]
    OtpConsumed,

    #[error("OTP expired")]
    OtpExpired,

    #[error("OTP locked out after too many attempts")]
    OtpLocked,

    #[error("OTP code does not match")]
    OtpInvalid,

    #[error("session token invalid")]
    SessionInvalid,

    #[error("session token expired")]
    SessionExpired,

    #[error("tenant already exists: {0}")]
    TenantExists(String),

    #[error("not found")]
    NotFound,

    #[error("a pending job already exists for this idempotency key")]
    PendingExists,

    // ── Transport ────────────────────────────────────────────────────────────
    #[error("SMTP send failed: {0}")]
    SmtpSendFailed(String),

    #[error("SMTP is not configured for this tenant")]
    SmtpNotConfigured,

    #[error("payment trigger webhook call failed: {0}")]
    PaymentTriggerWebhookFailed(String),

    #[error("payment trigger webhook returned non-2xx: {0}")]
    PaymentTriggerWebhookNon2xx(u16),

    #[error("payment trigger webhook url missing")]
    PaymentTriggerWebhookUrlMissing,

    #[error("invalid payment trigger delivery mode: {0}")]
    PaymentTriggerInvalidDeliveryMode(String),

    #[error("payment trigger fired for a run that is not approved")]
    PaymentTriggerNotApproved,

    #[error("payment triggers are disabled for this tenant")]
    PaymentTriggerDisabled,

    #[error("payment trigger already delivered for this decision")]
    PaymentTriggerAlreadyDelivered,

    #[error("payment trigger enqueued for retry")]
    PaymentTriggerRetryEnqueued,

    #[error("payment trigger already has a pending retry")]
    PaymentTriggerRetryAlreadyEnqueued,

    #[error("webhook secret missing or undecryptable")]
    WebhookSecretMissing,

    #[error("http {0}")]
    Http(u16),

    #[error("transport error: {0}")]
    Transport(String),

    // ── Storage ──────────────────────────────────────────────────────────────
    #[error("data directory uninitialized")]
    DataDirUninitialized,

    #[error("data directory format is newer than this binary supports")]
    DataDirTooNew,

    #[error("data directory format.json is invalid: {0}")]
    DataDirFormatInvalid(String),

    #[error("migrations disabled (MAGIC_LINK_MIGRATE_ON_STARTUP=0)")]
    MigrationsDisabled,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    // ── Queue ────────────────────────────────────────────────────────────────
    #[error("verify queue is closed")]
    VerifyQueueClosed,

    #[error("verify queue job handler error: {0}")]
    VerifyQueueHandlerError(String),

    #[error("verify queue job moved to dead letter after exhausting retries")]
    VerifyQueueDeadLetter,

    #[error("verify queue drain timed out")]
    VerifyQueueDrainTimeout,

    #[error("{0}")]
    Other(String),
}

impl SettldError {
    /// The stable code string that crosses process boundaries (spec §7).
    /// Never changes for a given variant; safe to match on by callers.
    pub fn code(&self) -> &'static str {
        match self {
            SettldError::InvalidEmail(_) => "INVALID_EMAIL",
            SettldError::InvalidTenant(_) => "INVALID_TENANT",
            SettldError::InvalidRunToken(_) => "INVALID_RUN_TOKEN",
            SettldError::InvalidDecision(_) => "INVALID_DECISION",
            SettldError::InvalidActor(_) => "INVALID_ACTOR",
            SettldError::InvalidTtl(_) => "INVALID_TTL",
            SettldError::InvalidSessionInput => "INVALID_SESSION_INPUT",
            SettldError::SessionKeyMissing => "SESSION_KEY_MISSING",
            SettldError::Validation(_) => "VALIDATION_ERROR",
            SettldError::OtpMissing => "OTP_MISSING",
            SettldError::OtpConsumed => "OTP_CONSUMED",
            SettldError::OtpExpired => "OTP_EXPIRED",
            SettldError::OtpLocked => "OTP_LOCKED",
            SettldError::OtpInvalid => "OTP_INVALID",
            SettldError::SessionInvalid => "SESSION_INVALID",
            SettldError::SessionExpired => "SESSION_EXPIRED",
            SettldError::TenantExists(_) => "TENANT_EXISTS",
            SettldError::NotFound => "NOT_FOUND",
            SettldError::PendingExists => "PENDING_EXISTS",
            SettldError::SmtpSendFailed(_) => "SMTP_SEND_FAILED",
            SettldError::SmtpNotConfigured => "SMTP_NOT_CONFIGURED",
            SettldError::PaymentTriggerWebhookFailed(_) => "PAYMENT_TRIGGER_WEBHOOK_FAILED",
            SettldError::PaymentTriggerWebhookNon2xx(_) => "PAYMENT_TRIGGER_WEBHOOK_NON_2XX",
            SettldError::PaymentTriggerWebhookUrlMissing => "PAYMENT_TRIGGER_WEBHOOK_URL_MISSING",
            SettldError::PaymentTriggerInvalidDeliveryMode(_) => {
                "PAYMENT_TRIGGER_INVALID_DELIVERY_MODE"
            }
            SettldError::PaymentTriggerNotApproved => "PAYMENT_TRIGGER_NOT_APPROVED",
            SettldError::PaymentTriggerDisabled => "PAYMENT_TRIGGER_DISABLED",
            SettldError::PaymentTriggerAlreadyDelivered => "PAYMENT_TRIGGER_ALREADY_DELIVERED",
            SettldError::PaymentTriggerRetryEnqueued => "PAYMENT_TRIGGER_RETRY_ENQUEUED",
            SettldError::PaymentTriggerRetryAlreadyEnqueued => {
                "PAYMENT_TRIGGER_RETRY_ALREADY_ENQUEUED"
            }
            SettldError::WebhookSecretMissing => "WEBHOOK_SECRET_MISSING",
            SettldError::Http(_) => "HTTP_ERROR",
            SettldError::Transport(_) => "TRANSPORT_ERROR",
            SettldError::DataDirUninitialized => "DATA_DIR_UNINITIALIZED",
            SettldError::DataDirTooNew => "DATA_DIR_TOO_NEW",
            SettldError::DataDirFormatInvalid(_) => "DATA_DIR_FORMAT_INVALID",
            SettldError::MigrationsDisabled => "MIGRATIONS_DISABLED",
            SettldError::Storage(_) => "STORAGE_ERROR",
            SettldError::Serialization(_) => "SERIALIZATION_ERROR",
            SettldError::VerifyQueueClosed => "VERIFY_QUEUE_CLOSED",
            SettldError::VerifyQueueHandlerError(_) => "VERIFY_QUEUE_HANDLER_ERROR",
            SettldError::VerifyQueueDeadLetter => "VERIFY_QUEUE_DEAD_LETTER",
            SettldError::VerifyQueueDrainTimeout => "VERIFY_QUEUE_DRAIN_TIMEOUT",
            SettldError::Other(_) => "ERROR",
        }
    }

    /// `HTTP_<code>` formatted for a non-2xx webhook/payment-trigger response.
    pub fn http_code(status: u16) -> String {
        format!("HTTP_{status}")
    }
}
