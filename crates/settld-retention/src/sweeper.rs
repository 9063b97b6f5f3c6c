//! Periodic deletion of run records past a tenant's effective retention
//! window (spec §4.14).

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use settld_core::SettldError;
use settld_store::{RunRecordStore, TenantSettingsStore};

/// Retention sweeps never run faster than this (spec §4.14).
pub const MIN_INTERVAL_SECONDS: u64 = 5;

const MS_PER_DAY: i64 = 86_400_000;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub tenants_swept: u64,
    pub records_deleted: u64,
    pub tenant_errors: u64,
}

pub struct RetentionSweeper {
    data_dir: PathBuf,
    settings_store: TenantSettingsStore,
    run_store: RunRecordStore,
    interval: Duration,
    running: AtomicBool,
}

impl std::fmt::Debug for RetentionSweeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetentionSweeper")
            .field("data_dir", &self.data_dir)
            .field("interval", &self.interval)
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish()
    }
}

impl RetentionSweeper {
    pub fn new(
        data_dir: impl Into<PathBuf>,
        settings_store: TenantSettingsStore,
        run_store: RunRecordStore,
        interval_seconds: u64,
    ) -> Result<Self, SettldError> {
        if interval_seconds < MIN_INTERVAL_SECONDS {
            return Err(SettldError::Validation(format!(
                "retention sweep interval must be >= {MIN_INTERVAL_SECONDS}s, got {interval_seconds}s"
            )));
        }
        Ok(RetentionSweeper {
            data_dir: data_dir.into(),
            settings_store,
            run_store,
            interval: Duration::from_secs(interval_seconds),
            running: AtomicBool::new(false),
        })
    }

    fn tenant_ids(&self) -> Result<Vec<String>, SettldError> {
        let dir = self.data_dir.join("tenants");
        let entries = match std::fs::read_dir(&dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(SettldError::Storage(e.to_string())),
        };
        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| SettldError::Storage(e.to_string()))?;
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                ids.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        Ok(ids)
    }

    /// Deletes run records for `tenant_id` whose `createdAt` is older than
    /// the tenant's effective `retentionDays`. Returns the number deleted.
    pub async fn sweep_tenant(&self, tenant_id: &str, now_ms: i64) -> Result<u64, SettldError> {
        let settings = self.settings_store.load(tenant_id)?;
        let retention_days = settings.retention_days.max(1) as i64;
        let cutoff = now_ms - retention_days * MS_PER_DAY;

        let records = self.run_store.list(tenant_id).await?;
        let mut deleted = 0u64;
        for record in records {
            if record.created_at < cutoff {
                self.run_store.delete(tenant_id, &record.token).await?;
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// One full pass over every tenant. Per-tenant failures are logged and
    /// counted, never halt the sweep (spec §4.14).
    pub async fn sweep_once(&self, now_ms: i64) -> SweepSummary {
        let mut summary = SweepSummary::default();
        let tenant_ids = match self.tenant_ids() {
            Ok(ids) => ids,
            Err(e) => {
                error!(error = %e, "retention sweep failed to enumerate tenants");
                return summary;
            }
        };

        for tenant_id in tenant_ids {
            summary.tenants_swept += 1;
            match self.sweep_tenant(&tenant_id, now_ms).await {
                Ok(deleted) => {
                    if deleted > 0 {
                        info!(tenant_id = %tenant_id, deleted, "retention sweep evicted run records");
                    }
                    summary.records_deleted += deleted;
                }
                Err(e) => {
                    summary.tenant_errors += 1;
                    warn!(tenant_id = %tenant_id, error = %e, "retention sweep failed for tenant, continuing");
                }
            }
        }
        summary
    }

    /// Runs `sweep_once` on `interval` until `stop` is set. Reentrancy
    /// guarded: if a previous tick is still in flight when the timer fires
    /// again, the new tick is skipped (spec §5).
    pub async fn run_forever(&self, stop: Arc<AtomicBool>, now_ms: impl Fn() -> i64) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            ticker.tick().await;
            if stop.load(Ordering::Relaxed) {
                break;
            }
            if self.running.swap(true, Ordering::Acquire) {
                warn!("retention sweep tick skipped, previous tick still in flight");
                continue;
            }
            let summary = self.sweep_once(now_ms()).await;
            info!(
                tenants_swept = summary.tenants_swept,
                records_deleted = summary.records_deleted,
                tenant_errors = summary.tenant_errors,
                "retention sweep tick complete"
            );
            self.running.store(false, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use settld_core::Plan;
    use settld_store::TenantSettings;

    fn setup(retention_days: u32) -> (tempfile::TempDir, RetentionSweeper) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("tenants").join("acme")).unwrap();
        let settings_store = TenantSettingsStore::new(dir.path(), None);
        let mut settings = TenantSettings::default_for_plan(Plan::Free);
        settings.retention_days = retention_days;
        settings_store.save("acme", settings).unwrap();

        let run_store = RunRecordStore::fs(dir.path());
        let sweeper = RetentionSweeper::new(dir.path(), settings_store, run_store, 5).unwrap();
        (dir, sweeper)
    }

    fn record(tenant_id: &str, token: &str, created_at: i64) -> settld_store::RunRecord {
        settld_store::RunRecord {
            tenant_id: tenant_id.to_string(),
            token: token.to_string(),
            created_at,
            verification_status: settld_core::VerificationStatus::Green,
            evidence_count: 1,
            active_evidence_count: 1,
            sla_compliance_pct: 100,
            template_id: "tmpl-1".into(),
            template_config_hash: "hash".into(),
            decision: None,
            record_json: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn rejects_interval_below_minimum() {
        let dir = tempfile::tempdir().unwrap();
        let err = RetentionSweeper::new(
            dir.path(),
            TenantSettingsStore::new(dir.path(), None),
            RunRecordStore::fs(dir.path()),
            1,
        )
        .unwrap_err();
        assert!(matches!(err, SettldError::Validation(_)));
    }

    #[tokio::test]
    async fn sweep_tenant_deletes_only_records_past_retention() {
        let (_dir, sweeper) = setup(30);
        let now_ms: i64 = 1_700_000_000_000;
        let old = record("acme", "ml_aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa", now_ms - 40 * MS_PER_DAY);
        let fresh = record("acme", "ml_bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb", now_ms - 5 * MS_PER_DAY);
        sweeper.run_store.put(&old).await.unwrap();
        sweeper.run_store.put(&fresh).await.unwrap();

        let deleted = sweeper.sweep_tenant("acme", now_ms).await.unwrap();
        assert_eq!(deleted, 1);
        assert!(sweeper.run_store.get("acme", &old.token).await.unwrap().is_none());
        assert!(sweeper.run_store.get("acme", &fresh.token).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn sweep_once_counts_tenants_and_continues_past_errors() {
        let (_dir, sweeper) = setup(30);
        let now_ms: i64 = 1_700_000_000_000;
        let summary = sweeper.sweep_once(now_ms).await;
        assert_eq!(summary.tenants_swept, 1);
        assert_eq!(summary.tenant_errors, 0);
    }
}
