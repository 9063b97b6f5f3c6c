pub mod otp;
pub mod runs;
pub mod tenant;

pub use otp::{OtpDeliveryMode, OtpStore};
pub use runs::{migrate_fs_to_db, DecisionSummary, MigrationSummary, RunRecord, RunRecordStore, StoreMode};
pub use tenant::{
    sanitize_for_api, ArchiveExportSink, BuyerNotifications, DeliveryMode, Entitlements,
    PaymentTriggersConfig, RateLimits, SettingsPatch, SettlementDecisionSigner, SseMode,
    TenantSettings, TenantSettingsStore, WebhookConfig,
};
