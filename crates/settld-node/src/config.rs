//! Parses the env vars recognized by the service (spec §6) exactly once into
//! an immutable [`ServiceConfig`], passed by reference to every loop.

use std::path::PathBuf;

use settld_core::SettldError;
use settld_crypto::SecretKey;
use settld_store::StoreMode;

fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => v != "0",
        Err(_) => default,
    }
}

#[derive(Clone, Debug)]
pub struct ServiceConfig {
    pub data_dir: PathBuf,
    pub require_durable_data_dir: bool,
    pub migrate_on_startup: bool,
    pub maintenance_interval_seconds: u64,
    pub settings_key: Option<SecretKey>,
    pub run_store_mode: StoreMode,
    pub run_store_database_url: Option<String>,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, SettldError> {
        let require_durable_data_dir = env_flag("MAGIC_LINK_REQUIRE_DURABLE_DATA_DIR", false);

        let data_dir = match std::env::var("MAGIC_LINK_DATA_DIR") {
            Ok(v) if !v.is_empty() => PathBuf::from(v),
            _ => {
                if require_durable_data_dir {
                    return Err(SettldError::Validation(
                        "MAGIC_LINK_DATA_DIR is required when MAGIC_LINK_REQUIRE_DURABLE_DATA_DIR=1".to_string(),
                    ));
                }
                std::env::temp_dir().join("settld-data")
            }
        };

        let migrate_on_startup = env_flag("MAGIC_LINK_MIGRATE_ON_STARTUP", true);

        let maintenance_interval_seconds = std::env::var("MAGIC_LINK_MAINTENANCE_INTERVAL_SECONDS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(settld_core::constants::MAINTENANCE_INTERVAL_SECONDS_DEFAULT);
        if maintenance_interval_seconds < settld_core::constants::MAINTENANCE_INTERVAL_SECONDS_MIN {
            return Err(SettldError::Validation(format!(
                "MAGIC_LINK_MAINTENANCE_INTERVAL_SECONDS must be >= {}",
                settld_core::constants::MAINTENANCE_INTERVAL_SECONDS_MIN
            )));
        }

        let settings_key = match std::env::var("MAGIC_LINK_SETTINGS_KEY_HEX") {
            Ok(hex_str) if !hex_str.is_empty() => {
                let bytes = hex::decode(&hex_str)
                    .map_err(|e| SettldError::Validation(format!("MAGIC_LINK_SETTINGS_KEY_HEX is not valid hex: {e}")))?;
                let array: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| SettldError::Validation("MAGIC_LINK_SETTINGS_KEY_HEX must decode to 32 bytes".to_string()))?;
                Some(SecretKey::from_bytes(array))
            }
            _ => None,
        };

        let run_store_mode = match std::env::var("MAGIC_LINK_RUN_STORE_MODE").unwrap_or_default().as_str() {
            "" | "fs" => StoreMode::Fs,
            "db" => StoreMode::Db,
            "dual" => StoreMode::Dual,
            other => return Err(SettldError::Validation(format!("unknown MAGIC_LINK_RUN_STORE_MODE: {other}"))),
        };

        let run_store_database_url = std::env::var("MAGIC_LINK_RUN_STORE_DATABASE_URL")
            .ok()
            .or_else(|| std::env::var("DATABASE_URL").ok());

        if matches!(run_store_mode, StoreMode::Db | StoreMode::Dual) && run_store_database_url.is_none() {
            return Err(SettldError::Validation(
                "MAGIC_LINK_RUN_STORE_DATABASE_URL (or DATABASE_URL) is required for db/dual run store modes".to_string(),
            ));
        }

        Ok(ServiceConfig {
            data_dir,
            require_durable_data_dir,
            migrate_on_startup,
            maintenance_interval_seconds,
            settings_key,
            run_store_mode,
            run_store_database_url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_env() {
        for key in [
            "MAGIC_LINK_DATA_DIR",
            "MAGIC_LINK_REQUIRE_DURABLE_DATA_DIR",
            "MAGIC_LINK_MIGRATE_ON_STARTUP",
            "MAGIC_LINK_MAINTENANCE_INTERVAL_SECONDS",
            "MAGIC_LINK_SETTINGS_KEY_HEX",
            "MAGIC_LINK_RUN_STORE_MODE",
            "MAGIC_LINK_RUN_STORE_DATABASE_URL",
            "DATABASE_URL",
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    fn defaults_fall_back_to_temp_dir_and_fs_mode() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        let config = ServiceConfig::from_env().unwrap();
        assert_eq!(config.data_dir, std::env::temp_dir().join("settld-data"));
        assert!(matches!(config.run_store_mode, StoreMode::Fs));
        assert!(config.settings_key.is_none());
    }

    #[test]
    fn durable_data_dir_required_flag_rejects_missing_data_dir() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        std::env::set_var("MAGIC_LINK_REQUIRE_DURABLE_DATA_DIR", "1");
        let err = ServiceConfig::from_env().unwrap_err();
        assert!(matches!(err, SettldError::Validation(_)));
        clear_env();
    }

    #[test]
    fn db_mode_requires_a_database_url() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        std::env::set_var("MAGIC_LINK_RUN_STORE_MODE", "db");
        let err = ServiceConfig::from_env().unwrap_err();
        assert!(matches!(err, SettldError::Validation(_)));
        clear_env();
    }

    #[test]
    fn settings_key_hex_must_decode_to_32_bytes() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        std::env::set_var("MAGIC_LINK_SETTINGS_KEY_HEX", "aabb");
        let err = ServiceConfig::from_env().unwrap_err();
        assert!(matches!(err, SettldError::Validation(_)));
        clear_env();
    }
}
