//! settld-node — the settlement-verification service binary.
//!
//! Startup sequence:
//!   1. Parse `ServiceConfig` from the environment (spec §6), once
//!   2. Ensure the data directory's on-disk format is current
//!   3. Build the storage/policy/decision/webhook layers
//!   4. Spawn the retry worker, payment-trigger worker, retention sweeper,
//!      and onboarding sequencer loops
//!   5. Run until SIGINT/SIGTERM, then let in-flight ticks finish

mod config;
mod queue;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use settld_core::constants::RETRY_TICK_INTERVAL_MS_DEFAULT;
use settld_dispatch::HttpAttempter;
use settld_format::StorageFormat;
use settld_retention::{OnboardingSequencer, OnboardingStep, RetentionSweeper, TenantProfile};
use settld_store::{RunRecordStore, TenantSettingsStore};
use settld_webhooks::{PaymentTriggerEngine, WebhookRetryEngine};

use crate::config::ServiceConfig;
use crate::queue::VerifyQueue;

#[derive(Parser, Debug)]
#[command(
    name = "settld-node",
    version,
    about = "settld — multi-tenant settlement verification service"
)]
struct Args {
    /// Override MAGIC_LINK_DATA_DIR.
    #[arg(long)]
    data_dir: Option<std::path::PathBuf>,

    /// Override MAGIC_LINK_MAINTENANCE_INTERVAL_SECONDS.
    #[arg(long)]
    maintenance_interval_seconds: Option<u64>,

    /// Number of VerifyQueue workers.
    #[arg(long, default_value_t = 4)]
    verify_workers: usize,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

async fn build_run_store(config: &ServiceConfig) -> anyhow::Result<RunRecordStore> {
    match config.run_store_mode {
        settld_store::StoreMode::Fs => Ok(RunRecordStore::fs(&config.data_dir)),
        settld_store::StoreMode::Db | settld_store::StoreMode::Dual => {
            let url = config.run_store_database_url.clone().expect("validated in ServiceConfig::from_env");
            let pool = sqlx::postgres::PgPoolOptions::new()
                .max_connections(10)
                .connect(&url)
                .await
                .context("connecting to run store database")?;
            Ok(if matches!(config.run_store_mode, settld_store::StoreMode::Dual) {
                RunRecordStore::dual(&config.data_dir, pool)
            } else {
                RunRecordStore::db(pool)
            })
        }
    }
}

fn default_onboarding_steps() -> Vec<OnboardingStep> {
    vec![
        OnboardingStep {
            step_key: "welcome".to_string(),
            trigger: Box::new(|p: &TenantProfile| p.signed_up_at),
            subject: Box::new(|_| "Welcome to settld".to_string()),
            body: Box::new(|_| "Your workspace is ready. Upload your first bundle to get started.".to_string()),
        },
        OnboardingStep {
            step_key: "first-upload-nudge".to_string(),
            trigger: Box::new(|p: &TenantProfile| {
                p.signed_up_at.map(|t| t + 86_400_000).filter(|_| p.first_upload_at.is_none())
            }),
            subject: Box::new(|_| "Ready to verify your first bundle?".to_string()),
            body: Box::new(|_| "Uploads take under a minute — see the quick-start guide.".to_string()),
        },
        OnboardingStep {
            step_key: "webhook-nudge".to_string(),
            trigger: Box::new(|p: &TenantProfile| {
                p.first_decision_at.filter(|_| p.first_webhook_configured_at.is_none())
            }),
            subject: Box::new(|_| "Automate your payment triggers".to_string()),
            body: Box::new(|_| "Connect a webhook so approvals fire payments automatically.".to_string()),
        },
    ]
}

/// Best-effort enumeration of `<dataDir>/tenants/*` directory names.
fn tenant_ids(data_dir: &std::path::Path) -> Vec<String> {
    let dir = data_dir.join("tenants");
    let Ok(entries) = std::fs::read_dir(&dir) else { return Vec::new() };
    entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .filter_map(|e| e.file_name().into_string().ok())
        .collect()
}

fn load_tenant_profile(data_dir: &std::path::Path, tenant_id: &str) -> TenantProfile {
    let path = data_dir.join("tenants").join(tenant_id).join("profile.json");
    std::fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,settld=debug".parse().unwrap()),
        )
        .init();

    let args = Args::parse();
    info!("settld node starting");

    let mut config = ServiceConfig::from_env().context("parsing service configuration")?;
    if let Some(dir) = args.data_dir {
        config.data_dir = dir;
    }
    if let Some(secs) = args.maintenance_interval_seconds {
        config.maintenance_interval_seconds = secs;
    }

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data dir {}", config.data_dir.display()))?;

    let format = StorageFormat::new(&config.data_dir);
    format.ensure(config.migrate_on_startup).context("ensuring data directory format")?;

    // `SecretKey` zeroizes on drop and isn't `Clone`, so the webhook/payment
    // attempters below re-derive their own copies from the same hex rather
    // than sharing the one `ServiceConfig::from_env` already validated.
    let settings_key_bytes: Option<[u8; 32]> = std::env::var("MAGIC_LINK_SETTINGS_KEY_HEX")
        .ok()
        .filter(|v| !v.is_empty())
        .and_then(|v| hex::decode(v).ok())
        .and_then(|b| b.try_into().ok());

    let settings_store = TenantSettingsStore::new(&config.data_dir, config.settings_key.take());
    let run_store = build_run_store(&config).await?;
    let decision_log = Arc::new(settld_decisions::DecisionLog::new(&config.data_dir));

    let webhook_settings_key = settld_crypto::SecretKey::from_bytes(settings_key_bytes.unwrap_or([0u8; 32]));
    let payment_settings_key = settld_crypto::SecretKey::from_bytes(settings_key_bytes.unwrap_or([0u8; 32]));

    let webhook_retry = Arc::new(WebhookRetryEngine::new(
        &config.data_dir,
        Box::new(HttpAttempter::new(webhook_settings_key, settld_core::constants::WEBHOOK_HTTP_TIMEOUT_MS_DEFAULT)),
    ));
    let payment_trigger = Arc::new(PaymentTriggerEngine::new(
        &config.data_dir,
        Box::new(HttpAttempter::new(payment_settings_key, settld_core::constants::WEBHOOK_HTTP_TIMEOUT_MS_DEFAULT)),
    ));
    let retention_sweeper = Arc::new(
        RetentionSweeper::new(&config.data_dir, settings_store, run_store, config.maintenance_interval_seconds)
            .context("building retention sweeper")?,
    );
    let onboarding = Arc::new(OnboardingSequencer::new(&config.data_dir, default_onboarding_steps()));

    let verify_handler: queue::VerifyHandler = {
        let decision_log = Arc::clone(&decision_log);
        Arc::new(move |payload| {
            let decision_log = Arc::clone(&decision_log);
            Box::pin(async move {
                let token = payload.get("token").and_then(|t| t.as_str()).unwrap_or("");
                let prior_decisions = decision_log.history(token).map(|h| h.len()).unwrap_or(0);
                info!(
                    token,
                    prior_decisions,
                    "verify job received (verify-worker subprocess wiring is opaque to this service)"
                );
                Ok(())
            })
        })
    };
    let verify_queue = Arc::new(VerifyQueue::new(verify_handler, args.verify_workers, 3, RETRY_TICK_INTERVAL_MS_DEFAULT));

    let stop = Arc::new(AtomicBool::new(false));

    // ── Webhook retry worker ──────────────────────────────────────────────────
    {
        let engine = Arc::clone(&webhook_retry);
        let stop = Arc::clone(&stop);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_millis(RETRY_TICK_INTERVAL_MS_DEFAULT));
            loop {
                ticker.tick().await;
                if stop.load(Ordering::Relaxed) {
                    break;
                }
                if let Err(e) = engine.tick(now_ms()).await {
                    warn!(error = %e, "webhook retry tick failed");
                }
            }
        });
    }

    // ── Payment trigger retry worker ──────────────────────────────────────────
    {
        let engine = Arc::clone(&payment_trigger);
        let stop = Arc::clone(&stop);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_millis(RETRY_TICK_INTERVAL_MS_DEFAULT));
            loop {
                ticker.tick().await;
                if stop.load(Ordering::Relaxed) {
                    break;
                }
                if let Err(e) = engine.tick(now_ms()).await {
                    warn!(error = %e, "payment trigger retry tick failed");
                }
            }
        });
    }

    // ── Retention sweeper ──────────────────────────────────────────────────────
    {
        let sweeper = Arc::clone(&retention_sweeper);
        let stop = Arc::clone(&stop);
        tokio::spawn(async move { sweeper.run_forever(stop, now_ms).await });
    }

    // ── Onboarding sequencer ───────────────────────────────────────────────────
    {
        let sequencer = Arc::clone(&onboarding);
        let data_dir = config.data_dir.clone();
        let stop = Arc::clone(&stop);
        let interval_seconds = config.maintenance_interval_seconds;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval_seconds));
            loop {
                ticker.tick().await;
                if stop.load(Ordering::Relaxed) {
                    break;
                }
                for tenant_id in tenant_ids(&data_dir) {
                    let profile = load_tenant_profile(&data_dir, &tenant_id);
                    let sent = sequencer.tick(&tenant_id, &profile, now_ms(), |step_key, subject, _body| {
                        info!(tenant_id = %tenant_id, step_key, subject, "onboarding step delivered (log mode)");
                        true
                    });
                    if let Err(e) = sent {
                        warn!(tenant_id = %tenant_id, error = %e, "onboarding tick failed");
                    }
                }
            }
        });
    }

    info!(
        data_dir = %config.data_dir.display(),
        run_store_mode = ?config.run_store_mode,
        "settld node ready"
    );

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
        }
        _ = terminate_signal() => {
            info!("received terminate signal");
        }
    }

    stop.store(true, Ordering::Relaxed);
    verify_queue.close();
    if let Err(e) = verify_queue.drain(5_000).await {
        warn!(error = %e, "verify queue did not drain before shutdown");
    }
    info!("settld node shut down");
    Ok(())
}

#[cfg(unix)]
async fn terminate_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate()).expect("installing SIGTERM handler");
    term.recv().await;
}

#[cfg(not(unix))]
async fn terminate_signal() {
    std::future::pending::<()>().await
}
