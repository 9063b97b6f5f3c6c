//! ─── settld service constants ───────────────────────────────────────────────
//!
//! Bounds and defaults referenced throughout the workspace (spec §3, §5, §8).
//! Collected in one place so the retention/backoff/timeout math stays
//! consistent between `settld-store`, `settld-webhooks`, and `settld-node`.

// ── TenantSettings bounds ─────────────────────────────────────────────────────

pub const RETENTION_DAYS_MIN: u32 = 1;
pub const RETENTION_DAYS_MAX: u32 = 3650;

/// Default retention applied when a tenant has no explicit override.
pub const DEFAULT_RETENTION_DAYS: u32 = 30;

// ── Email validation ──────────────────────────────────────────────────────────

pub const MAX_EMAIL_LEN: usize = 320;

// ── Decision report sequencing ────────────────────────────────────────────────

/// Cap on settlement decision report sequence numbers per token (spec §3).
pub const SETTLEMENT_REPORT_SEQ_CAP: u32 = 9999;

// ── Tenant profile event log ──────────────────────────────────────────────────

/// Maximum onboarding event-log entries retained per tenant (spec §3).
pub const TENANT_PROFILE_EVENT_LOG_CAP: usize = 200;

// ── Timeouts (milliseconds) ───────────────────────────────────────────────────

pub const SMTP_TIMEOUT_MS_DEFAULT: u64 = 10_000;
pub const WEBHOOK_HTTP_TIMEOUT_MS_DEFAULT: u64 = 5_000;
pub const S3_PUT_TIMEOUT_MS_DEFAULT: u64 = 30_000;
pub const RETRY_TICK_INTERVAL_MS_DEFAULT: u64 = 2_000;
pub const RETRY_TICK_INTERVAL_MS_FLOOR: u64 = 100;

// ── Backoff ────────────────────────────────────────────────────────────────────

/// Cap on retry backoff delay (spec §5): 24 hours in milliseconds.
pub const BACKOFF_MS_CAP: u64 = 86_400_000;

/// Cap on the backoff exponent `n` in `base * 2^(n-1)` (spec §5).
pub const BACKOFF_EXPONENT_CAP: u32 = 16;

/// Compute the `n`th retry delay in ms: `base * 2^(n-1)`, capped (spec §8
/// testable property 8). `attempt` is 1-based.
pub fn backoff_delay_ms(base_ms: u64, attempt: u32) -> u64 {
    let exponent = attempt.saturating_sub(1).min(BACKOFF_EXPONENT_CAP);
    let delay = base_ms.saturating_mul(1u64.checked_shl(exponent).unwrap_or(u64::MAX));
    delay.min(BACKOFF_MS_CAP)
}

// ── Maintenance loop ───────────────────────────────────────────────────────────

pub const MAINTENANCE_INTERVAL_SECONDS_MIN: u64 = 5;
pub const MAINTENANCE_INTERVAL_SECONDS_DEFAULT: u64 = 60;
