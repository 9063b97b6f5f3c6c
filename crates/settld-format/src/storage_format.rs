use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

use settld_core::SettldError;

pub const SCHEMA_VERSION: &str = "MagicLinkDataFormat.v1";

/// The version this binary knows how to read and write. Bump this and add a
/// step to [`migrations`] whenever `format.json`-adjacent on-disk shapes
/// change in a way that needs a rewrite.
pub const CURRENT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FormatFile {
    #[serde(rename = "schemaVersion")]
    schema_version: String,
    version: u32,
    #[serde(rename = "writtenAt")]
    written_at: String,
}

/// Result of a non-writing [`StorageFormat::check`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormatCheck {
    /// `format.json` does not exist yet.
    Uninitialized,
    /// On disk and at `CURRENT_VERSION`.
    UpToDate { version: u32 },
    /// On disk but behind `CURRENT_VERSION`; `migrate` would rewrite it.
    NeedsMigration { found: u32, current: u32 },
    /// On disk but ahead of `CURRENT_VERSION` — this binary is too old.
    TooNew { found: u32, current: u32 },
}

/// One in-place transformation of the data directory, bumping the recorded
/// version by exactly one. Migrations run in order starting from the
/// directory's current version; `CURRENT_VERSION` is the length of this list.
type Migration = fn(&Path) -> Result<(), SettldError>;

fn migrations() -> Vec<Migration> {
    // No migrations yet: CURRENT_VERSION is 1 and format.json's shape has
    // been stable since it was introduced. Add steps here (and bump
    // CURRENT_VERSION) the first time the on-disk layout changes.
    Vec::new()
}

pub struct StorageFormat {
    data_dir: PathBuf,
}

impl StorageFormat {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        StorageFormat {
            data_dir: data_dir.into(),
        }
    }

    fn format_path(&self) -> PathBuf {
        self.data_dir.join("format.json")
    }

    fn read(&self) -> Result<Option<FormatFile>, SettldError> {
        let path = self.format_path();
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path).map_err(|e| SettldError::Storage(e.to_string()))?;
        let file: FormatFile = serde_json::from_str(&raw)
            .map_err(|e| SettldError::DataDirFormatInvalid(e.to_string()))?;
        if file.schema_version != SCHEMA_VERSION {
            return Err(SettldError::DataDirFormatInvalid(format!(
                "unexpected schemaVersion {}",
                file.schema_version
            )));
        }
        Ok(Some(file))
    }

    fn write(&self, version: u32) -> Result<(), SettldError> {
        fs::create_dir_all(&self.data_dir).map_err(|e| SettldError::Storage(e.to_string()))?;
        let file = FormatFile {
            schema_version: SCHEMA_VERSION.to_string(),
            version,
            written_at: Utc::now().to_rfc3339(),
        };
        let body = serde_json::to_vec_pretty(&file)
            .map_err(|e| SettldError::Serialization(e.to_string()))?;
        fs::write(self.format_path(), body).map_err(|e| SettldError::Storage(e.to_string()))
    }

    /// Non-writing inspection of the data directory's format state.
    pub fn check(&self) -> Result<FormatCheck, SettldError> {
        match self.read()? {
            None => Ok(FormatCheck::Uninitialized),
            Some(file) if file.version == CURRENT_VERSION => {
                Ok(FormatCheck::UpToDate { version: file.version })
            }
            Some(file) if file.version < CURRENT_VERSION => Ok(FormatCheck::NeedsMigration {
                found: file.version,
                current: CURRENT_VERSION,
            }),
            Some(file) => Ok(FormatCheck::TooNew {
                found: file.version,
                current: CURRENT_VERSION,
            }),
        }
    }

    /// Ensures the data directory is at `CURRENT_VERSION`, applying
    /// migrations in order and rewriting `format.json` if `migrate_on_startup`
    /// allows it. Every other write to this data directory MUST be gated on
    /// this call succeeding (spec §4.1).
    pub fn ensure(&self, migrate_on_startup: bool) -> Result<(), SettldError> {
        match self.check()? {
            FormatCheck::UpToDate { .. } => Ok(()),
            FormatCheck::TooNew { found, current } => {
                tracing::error!(found, current, "data directory format is newer than this binary supports");
                Err(SettldError::DataDirTooNew)
            }
            FormatCheck::Uninitialized => {
                if !migrate_on_startup {
                    return Err(SettldError::DataDirUninitialized);
                }
                self.write(CURRENT_VERSION)?;
                info!(version = CURRENT_VERSION, "initialized data directory format");
                Ok(())
            }
            FormatCheck::NeedsMigration { found, current } => {
                if !migrate_on_startup {
                    return Err(SettldError::MigrationsDisabled);
                }
                self.migrate(found)?;
                info!(from = found, to = current, "migrated data directory format");
                Ok(())
            }
        }
    }

    /// Applies every migration from `found` up to `CURRENT_VERSION` and
    /// rewrites `format.json`. Used by both [`StorageFormat::ensure`] and the
    /// `storage-cli migrate` subcommand.
    pub fn migrate(&self, found: u32) -> Result<(), SettldError> {
        let steps = migrations();
        for step in steps.iter().skip(found as usize) {
            step(&self.data_dir)?;
        }
        self.write(CURRENT_VERSION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uninitialized_directory_reports_uninitialized() {
        let dir = tempfile::tempdir().unwrap();
        let fmt = StorageFormat::new(dir.path());
        assert_eq!(fmt.check().unwrap(), FormatCheck::Uninitialized);
    }

    #[test]
    fn ensure_initializes_when_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let fmt = StorageFormat::new(dir.path());
        fmt.ensure(true).unwrap();
        assert_eq!(
            fmt.check().unwrap(),
            FormatCheck::UpToDate { version: CURRENT_VERSION }
        );
    }

    #[test]
    fn ensure_fails_closed_when_uninitialized_and_migrations_disallowed() {
        let dir = tempfile::tempdir().unwrap();
        let fmt = StorageFormat::new(dir.path());
        let err = fmt.ensure(false).unwrap_err();
        assert!(matches!(err, SettldError::DataDirUninitialized));
    }

    #[test]
    fn too_new_version_is_rejected_even_with_migrate_on_startup() {
        let dir = tempfile::tempdir().unwrap();
        let fmt = StorageFormat::new(dir.path());
        fmt.write(CURRENT_VERSION + 1).unwrap();
        let err = fmt.ensure(true).unwrap_err();
        assert!(matches!(err, SettldError::DataDirTooNew));
    }

    #[test]
    fn invalid_schema_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path()).unwrap();
        fs::write(
            dir.path().join("format.json"),
            r#"{"schemaVersion":"Bogus.v9","version":1,"writtenAt":"2026-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        let fmt = StorageFormat::new(dir.path());
        let err = fmt.check().unwrap_err();
        assert!(matches!(err, SettldError::DataDirFormatInvalid(_)));
    }
}
