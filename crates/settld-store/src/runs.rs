//! Per-run denormalized records, with a pluggable storage backend (spec
//! §4.4): `fs` (JSON files), `db` (Postgres via `sqlx`), or `dual` (best
//! effort on both, DB-first read with FS fallback).

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;
use tracing::warn;

use settld_core::{Decision, SettldError, TimestampMs, VerificationStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionSummary {
    pub decision: Decision,
    #[serde(rename = "decidedAt")]
    pub decided_at: TimestampMs,
    #[serde(rename = "decidedByEmail")]
    pub decided_by_email: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    #[serde(rename = "tenantId")]
    pub tenant_id: String,
    pub token: String,
    #[serde(rename = "createdAt")]
    pub created_at: TimestampMs,
    #[serde(rename = "verificationStatus")]
    pub verification_status: VerificationStatus,
    #[serde(rename = "evidenceCount")]
    pub evidence_count: u32,
    #[serde(rename = "activeEvidenceCount")]
    pub active_evidence_count: u32,
    #[serde(rename = "slaCompliancePct")]
    pub sla_compliance_pct: u32,
    #[serde(rename = "templateId")]
    pub template_id: String,
    #[serde(rename = "templateConfigHash")]
    pub template_config_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<DecisionSummary>,
    /// The complete document this projection was derived from; source of
    /// truth (spec §3).
    #[serde(rename = "recordJson")]
    pub record_json: Value,
}

impl RunRecord {
    /// `max(0, 100 − failingClauses)` (spec §3).
    pub fn sla_compliance_pct(failing_clauses: u32) -> u32 {
        100u32.saturating_sub(failing_clauses)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    Fs,
    Db,
    Dual,
}

#[async_trait]
trait RunRecordBackend: Send + Sync {
    async fn put(&self, record: &RunRecord) -> Result<(), SettldError>;
    async fn get(&self, tenant_id: &str, token: &str) -> Result<Option<RunRecord>, SettldError>;
    async fn list(&self, tenant_id: &str) -> Result<Vec<RunRecord>, SettldError>;
    async fn update_decision(
        &self,
        tenant_id: &str,
        token: &str,
        decision: DecisionSummary,
    ) -> Result<(), SettldError>;
    async fn delete(&self, tenant_id: &str, token: &str) -> Result<(), SettldError>;
}

// ── FS backend ──────────────────────────────────────────────────────────────

struct FsBackend {
    data_dir: PathBuf,
}

impl FsBackend {
    fn path(&self, tenant_id: &str, token: &str) -> PathBuf {
        self.data_dir.join("runs").join(tenant_id).join(format!("{token}.json"))
    }
}

#[async_trait]
impl RunRecordBackend for FsBackend {
    async fn put(&self, record: &RunRecord) -> Result<(), SettldError> {
        let path = self.path(&record.tenant_id, &record.token);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SettldError::Storage(e.to_string()))?;
        }
        let body = serde_json::to_vec_pretty(record)
            .map_err(|e| SettldError::Serialization(e.to_string()))?;
        tokio::fs::write(&path, body)
            .await
            .map_err(|e| SettldError::Storage(e.to_string()))
    }

    async fn get(&self, tenant_id: &str, token: &str) -> Result<Option<RunRecord>, SettldError> {
        let path = self.path(tenant_id, token);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(
                serde_json::from_slice(&bytes).map_err(|e| SettldError::Serialization(e.to_string()))?,
            )),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SettldError::Storage(e.to_string())),
        }
    }

    async fn list(&self, tenant_id: &str) -> Result<Vec<RunRecord>, SettldError> {
        let dir = self.data_dir.join("runs").join(tenant_id);
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(SettldError::Storage(e.to_string())),
        };
        while let Some(entry) = entries.next_entry().await.map_err(|e| SettldError::Storage(e.to_string()))? {
            let bytes = tokio::fs::read(entry.path())
                .await
                .map_err(|e| SettldError::Storage(e.to_string()))?;
            let record: RunRecord =
                serde_json::from_slice(&bytes).map_err(|e| SettldError::Serialization(e.to_string()))?;
            out.push(record);
        }
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.token.cmp(&a.token)));
        Ok(out)
    }

    async fn update_decision(
        &self,
        tenant_id: &str,
        token: &str,
        decision: DecisionSummary,
    ) -> Result<(), SettldError> {
        let mut record = self
            .get(tenant_id, token)
            .await?
            .ok_or(SettldError::NotFound)?;
        record.decision = Some(decision);
        self.put(&record).await
    }

    async fn delete(&self, tenant_id: &str, token: &str) -> Result<(), SettldError> {
        let path = self.path(tenant_id, token);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(_) if !path.exists() => Ok(()),
            Err(e) => Err(SettldError::Storage(e.to_string())),
        }
    }
}

// ── DB backend ──────────────────────────────────────────────────────────────

struct DbBackend {
    pool: PgPool,
}

#[async_trait]
impl RunRecordBackend for DbBackend {
    async fn put(&self, record: &RunRecord) -> Result<(), SettldError> {
        let decision_json = record
            .decision
            .as_ref()
            .map(|d| serde_json::to_value(d).unwrap_or(Value::Null));
        sqlx::query(
            r#"
            INSERT INTO run_records
                (tenant_id, token, created_at, verification_status, evidence_count,
                 active_evidence_count, sla_compliance_pct, template_id,
                 template_config_hash, decision_json, record_json)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (tenant_id, token) DO UPDATE SET
                verification_status = EXCLUDED.verification_status,
                evidence_count = EXCLUDED.evidence_count,
                active_evidence_count = EXCLUDED.active_evidence_count,
                sla_compliance_pct = EXCLUDED.sla_compliance_pct,
                template_id = EXCLUDED.template_id,
                template_config_hash = EXCLUDED.template_config_hash,
                decision_json = EXCLUDED.decision_json,
                record_json = EXCLUDED.record_json
            "#,
        )
        .bind(&record.tenant_id)
        .bind(&record.token)
        .bind(record.created_at)
        .bind(format!("{:?}", record.verification_status).to_lowercase())
        .bind(record.evidence_count as i64)
        .bind(record.active_evidence_count as i64)
        .bind(record.sla_compliance_pct as i64)
        .bind(&record.template_id)
        .bind(&record.template_config_hash)
        .bind(decision_json)
        .bind(&record.record_json)
        .execute(&self.pool)
        .await
        .map_err(|e| SettldError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn get(&self, tenant_id: &str, token: &str) -> Result<Option<RunRecord>, SettldError> {
        let row: Option<(Value,)> = sqlx::query_as(
            "SELECT record_json FROM run_records WHERE tenant_id = $1 AND token = $2",
        )
        .bind(tenant_id)
        .bind(token)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| SettldError::Storage(e.to_string()))?;

        match row {
            Some((json,)) => Ok(Some(
                serde_json::from_value(json).map_err(|e| SettldError::Serialization(e.to_string()))?,
            )),
            None => Ok(None),
        }
    }

    async fn list(&self, tenant_id: &str) -> Result<Vec<RunRecord>, SettldError> {
        let rows: Vec<(Value,)> = sqlx::query_as(
            "SELECT record_json FROM run_records WHERE tenant_id = $1 ORDER BY created_at DESC, token DESC",
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SettldError::Storage(e.to_string()))?;

        rows.into_iter()
            .map(|(json,)| serde_json::from_value(json).map_err(|e| SettldError::Serialization(e.to_string())))
            .collect()
    }

    async fn update_decision(
        &self,
        tenant_id: &str,
        token: &str,
        decision: DecisionSummary,
    ) -> Result<(), SettldError> {
        let mut record = self
            .get(tenant_id, token)
            .await?
            .ok_or(SettldError::NotFound)?;
        record.decision = Some(decision);
        self.put(&record).await
    }

    async fn delete(&self, tenant_id: &str, token: &str) -> Result<(), SettldError> {
        sqlx::query("DELETE FROM run_records WHERE tenant_id = $1 AND token = $2")
            .bind(tenant_id)
            .bind(token)
            .execute(&self.pool)
            .await
            .map_err(|e| SettldError::Storage(e.to_string()))?;
        Ok(())
    }
}

// ── Dual backend ────────────────────────────────────────────────────────────

struct DualBackend {
    fs: FsBackend,
    db: DbBackend,
}

#[async_trait]
impl RunRecordBackend for DualBackend {
    async fn put(&self, record: &RunRecord) -> Result<(), SettldError> {
        self.db.put(record).await?;
        if let Err(e) = self.fs.put(record).await {
            warn!(tenant_id = %record.tenant_id, token = %record.token, error = %e, "dual-mode FS write failed, DB write already committed");
        }
        Ok(())
    }

    async fn get(&self, tenant_id: &str, token: &str) -> Result<Option<RunRecord>, SettldError> {
        match self.db.get(tenant_id, token).await {
            Ok(Some(record)) => Ok(Some(record)),
            Ok(None) => self.fs.get(tenant_id, token).await,
            Err(e) => {
                warn!(tenant_id, token, error = %e, "dual-mode DB read failed, falling back to FS");
                self.fs.get(tenant_id, token).await
            }
        }
    }

    async fn list(&self, tenant_id: &str) -> Result<Vec<RunRecord>, SettldError> {
        match self.db.list(tenant_id).await {
            Ok(records) => Ok(records),
            Err(e) => {
                warn!(tenant_id, error = %e, "dual-mode DB list failed, falling back to FS");
                self.fs.list(tenant_id).await
            }
        }
    }

    async fn update_decision(
        &self,
        tenant_id: &str,
        token: &str,
        decision: DecisionSummary,
    ) -> Result<(), SettldError> {
        self.db.update_decision(tenant_id, token, decision.clone()).await?;
        if let Err(e) = self.fs.update_decision(tenant_id, token, decision).await {
            warn!(tenant_id, token, error = %e, "dual-mode FS decision update failed, DB write already committed");
        }
        Ok(())
    }

    async fn delete(&self, tenant_id: &str, token: &str) -> Result<(), SettldError> {
        self.db.delete(tenant_id, token).await?;
        if let Err(e) = self.fs.delete(tenant_id, token).await {
            warn!(tenant_id, token, error = %e, "dual-mode FS delete failed, DB delete already committed");
        }
        Ok(())
    }
}

// ── Public facade ───────────────────────────────────────────────────────────

pub struct RunRecordStore {
    backend: Arc<dyn RunRecordBackend>,
}

impl RunRecordStore {
    pub fn fs(data_dir: impl Into<PathBuf>) -> Self {
        RunRecordStore {
            backend: Arc::new(FsBackend { data_dir: data_dir.into() }),
        }
    }

    pub fn db(pool: PgPool) -> Self {
        RunRecordStore {
            backend: Arc::new(DbBackend { pool }),
        }
    }

    pub fn dual(data_dir: impl Into<PathBuf>, pool: PgPool) -> Self {
        RunRecordStore {
            backend: Arc::new(DualBackend {
                fs: FsBackend { data_dir: data_dir.into() },
                db: DbBackend { pool },
            }),
        }
    }

    pub async fn put(&self, record: &RunRecord) -> Result<(), SettldError> {
        self.backend.put(record).await
    }

    pub async fn get(&self, tenant_id: &str, token: &str) -> Result<Option<RunRecord>, SettldError> {
        self.backend.get(tenant_id, token).await
    }

    /// Ordered `createdAt DESC, token DESC` (spec §4.4).
    pub async fn list(&self, tenant_id: &str) -> Result<Vec<RunRecord>, SettldError> {
        self.backend.list(tenant_id).await
    }

    /// Additive merge: only the `decision` summary is written, never
    /// unrelated fields (spec §4.4).
    pub async fn update_decision(
        &self,
        tenant_id: &str,
        token: &str,
        decision: DecisionSummary,
    ) -> Result<(), SettldError> {
        self.backend.update_decision(tenant_id, token, decision).await
    }

    pub async fn delete(&self, tenant_id: &str, token: &str) -> Result<(), SettldError> {
        self.backend.delete(tenant_id, token).await
    }
}

/// Summary of a best-effort FS→DB migration run (spec §9 open question b).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationSummary {
    pub migrated: u64,
    pub skipped: u64,
    pub errors: Vec<(String, String, String)>,
}

/// Iterates every tenant directory under `<dataDir>/runs` and upserts each
/// record into `pool`. Any row failure is counted as `skipped`, never fatal
/// (spec §4.4).
pub async fn migrate_fs_to_db(data_dir: &std::path::Path, pool: &PgPool) -> Result<MigrationSummary, SettldError> {
    let mut summary = MigrationSummary::default();
    let runs_dir = data_dir.join("runs");
    let mut tenants = match tokio::fs::read_dir(&runs_dir).await {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(summary),
        Err(e) => return Err(SettldError::Storage(e.to_string())),
    };

    let db = DbBackend { pool: pool.clone() };
    while let Some(tenant_entry) = tenants.next_entry().await.map_err(|e| SettldError::Storage(e.to_string()))? {
        let tenant_id = tenant_entry.file_name().to_string_lossy().to_string();
        let fs = FsBackend { data_dir: data_dir.to_path_buf() };
        let records = match fs.list(&tenant_id).await {
            Ok(r) => r,
            Err(e) => {
                summary.errors.push((tenant_id, String::new(), e.to_string()));
                summary.skipped += 1;
                continue;
            }
        };
        for record in records {
            match db.put(&record).await {
                Ok(()) => summary.migrated += 1,
                Err(e) => {
                    summary.errors.push((record.tenant_id.clone(), record.token.clone(), e.to_string()));
                    summary.skipped += 1;
                }
            }
        }
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(tenant_id: &str, token: &str, created_at: TimestampMs) -> RunRecord {
        RunRecord {
            tenant_id: tenant_id.to_string(),
            token: token.to_string(),
            created_at,
            verification_status: VerificationStatus::Green,
            evidence_count: 3,
            active_evidence_count: 3,
            sla_compliance_pct: 100,
            template_id: "tmpl-1".into(),
            template_config_hash: "abc123".into(),
            decision: None,
            record_json: serde_json::json!({"ok": true}),
        }
    }

    #[tokio::test]
    async fn fs_round_trips_a_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunRecordStore::fs(dir.path());
        let record = sample("acme", "ml_000000000000000000000000000000000000000000aa", 1000);
        store.put(&record).await.unwrap();

        let loaded = store.get("acme", &record.token).await.unwrap().unwrap();
        assert_eq!(loaded, record);
    }

    #[tokio::test]
    async fn fs_list_orders_by_created_at_desc_then_token_desc() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunRecordStore::fs(dir.path());
        let a = sample("acme", "ml_aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa", 1000);
        let b = sample("acme", "ml_bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb", 2000);
        store.put(&a).await.unwrap();
        store.put(&b).await.unwrap();

        let listed = store.list("acme").await.unwrap();
        assert_eq!(listed[0].token, b.token);
        assert_eq!(listed[1].token, a.token);
    }

    #[tokio::test]
    async fn update_decision_is_additive() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunRecordStore::fs(dir.path());
        let record = sample("acme", "ml_cccccccccccccccccccccccccccccccccccccccccccccc", 1000);
        store.put(&record).await.unwrap();

        store
            .update_decision(
                "acme",
                &record.token,
                DecisionSummary {
                    decision: Decision::Approve,
                    decided_at: 5000,
                    decided_by_email: "ops@example.com".into(),
                },
            )
            .await
            .unwrap();

        let loaded = store.get("acme", &record.token).await.unwrap().unwrap();
        assert_eq!(loaded.evidence_count, record.evidence_count);
        assert_eq!(loaded.decision.unwrap().decision, Decision::Approve);
    }

    #[tokio::test]
    async fn update_decision_missing_record_returns_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunRecordStore::fs(dir.path());
        let err = store
            .update_decision(
                "acme",
                "ml_dddddddddddddddddddddddddddddddddddddddddddddd",
                DecisionSummary {
                    decision: Decision::Hold,
                    decided_at: 1,
                    decided_by_email: "a@b.com".into(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SettldError::NotFound));
    }

    #[test]
    fn sla_compliance_floors_at_zero() {
        assert_eq!(RunRecord::sla_compliance_pct(0), 100);
        assert_eq!(RunRecord::sla_compliance_pct(40), 60);
        assert_eq!(RunRecord::sla_compliance_pct(500), 0);
    }
}
