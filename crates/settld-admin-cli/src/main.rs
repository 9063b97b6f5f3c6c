//! storage-cli
//!
//! Read-only and migrating admin tool for a settld data directory's on-disk
//! format (spec §4.1, §6).
//!
//! Usage:
//!   storage-cli check   --data-dir <path> [--allow-uninitialized]
//!   storage-cli migrate --data-dir <path>
//!
//! Exit codes (`check`): 0 up to date, 3 uninitialized (or needs migration)
//! unless `--allow-uninitialized` is passed, 4 too new for this binary,
//! 5 format.json is invalid/corrupt.
//! Exit codes (`migrate`): 0 success, 1 any failure.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use settld_format::{FormatCheck, StorageFormat};

#[derive(Parser, Debug)]
#[command(name = "storage-cli", version, about = "settld data directory format admin tool")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Reports the data directory's on-disk format state without writing.
    Check {
        #[arg(long)]
        data_dir: PathBuf,
        /// Treat an uninitialized or stale data directory as success (exit 0).
        #[arg(long, default_value_t = false)]
        allow_uninitialized: bool,
    },
    /// Initializes or migrates the data directory to the current format.
    Migrate {
        #[arg(long)]
        data_dir: PathBuf,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt().with_env_filter("warn,storage_cli=info").init();

    let args = Args::parse();
    match args.command {
        Command::Check { data_dir, allow_uninitialized } => cmd_check(&data_dir, allow_uninitialized),
        Command::Migrate { data_dir } => cmd_migrate(&data_dir),
    }
}

fn cmd_check(data_dir: &PathBuf, allow_uninitialized: bool) -> ExitCode {
    let format = StorageFormat::new(data_dir);
    match format.check() {
        Ok(FormatCheck::UpToDate { version }) => {
            println!("format up to date (version {version})");
            ExitCode::from(0)
        }
        Ok(FormatCheck::Uninitialized) => {
            println!("data directory is uninitialized: {}", data_dir.display());
            if allow_uninitialized { ExitCode::from(0) } else { ExitCode::from(3) }
        }
        Ok(FormatCheck::NeedsMigration { found, current }) => {
            println!("data directory needs migration: found version {found}, current is {current}");
            if allow_uninitialized { ExitCode::from(0) } else { ExitCode::from(3) }
        }
        Ok(FormatCheck::TooNew { found, current }) => {
            error!(found, current, "data directory format is newer than this binary supports");
            ExitCode::from(4)
        }
        Err(e) => {
            error!(error = %e, "data directory format is invalid or corrupt");
            ExitCode::from(5)
        }
    }
}

fn cmd_migrate(data_dir: &PathBuf) -> ExitCode {
    let format = StorageFormat::new(data_dir);
    match format.check() {
        Ok(FormatCheck::UpToDate { version }) => {
            println!("already up to date (version {version}), nothing to do");
            ExitCode::from(0)
        }
        Ok(FormatCheck::Uninitialized) => match format.ensure(true) {
            Ok(()) => {
                println!("initialized data directory: {}", data_dir.display());
                ExitCode::from(0)
            }
            Err(e) => {
                error!(error = %e, "failed to initialize data directory");
                ExitCode::from(1)
            }
        },
        Ok(FormatCheck::NeedsMigration { found, current }) => match format.migrate(found) {
            Ok(()) => {
                info!(from = found, to = current, "migrated data directory");
                println!("migrated from version {found} to {current}");
                ExitCode::from(0)
            }
            Err(e) => {
                error!(error = %e, "migration failed");
                ExitCode::from(1)
            }
        },
        Ok(FormatCheck::TooNew { found, current }) => {
            error!(found, current, "data directory format is newer than this binary supports, cannot migrate");
            ExitCode::from(1)
        }
        Err(e) => {
            error!(error = %e, "data directory format is invalid or corrupt, cannot migrate");
            ExitCode::from(1)
        }
    }
}
