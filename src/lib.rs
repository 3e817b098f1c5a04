//! Delivery dashboard backend.
//!
//! Loads orders from the hosted backend (or a local SQLite store), derives
//! couriers, stores and statistics from them, and gates manual backend syncs
//! behind a cooldown. `run()` is the command-line entry point used by the
//! `delivery-dashboard` binary.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod api;
pub mod backend;
pub mod clock;
pub mod config;
pub mod dashboard;
pub mod db;
pub mod diagnostics;
pub mod entities;
pub mod error;
pub mod normalize;
pub mod orders;
pub mod pipeline;
pub mod stats;
pub mod storage;
pub mod sync_gate;

use crate::config::DashboardConfig;
use crate::dashboard::Dashboard;
use crate::pipeline::PipelineOutcome;

/// First non-empty text among `keys` in a JSON object. Strings are trimmed;
/// numbers and booleans are rendered as text.
pub(crate) fn value_text(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match value.get(*key)? {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    })
}

/// Console plus daily rolling file logging. The returned guard flushes the
/// file writer when dropped.
fn init_logging() -> tracing_appender::non_blocking::WorkerGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,delivery_dashboard_lib=debug"));

    diagnostics::prune_old_logs();

    let log_dir = diagnostics::get_log_dir();
    std::fs::create_dir_all(&log_dir).ok();

    let file_appender =
        tracing_appender::rolling::daily(&log_dir, diagnostics::LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_writer(std::io::stderr).with_target(true);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    guard
}

fn print_json(value: &Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn check_outcome(outcome: PipelineOutcome) -> anyhow::Result<()> {
    match outcome {
        PipelineOutcome::Completed => Ok(()),
        PipelineOutcome::Failed { step, message } => {
            bail!("dashboard load failed at {step}: {message}")
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "delivery-dashboard")]
#[command(about = "Order statistics and sync control for the delivery dashboard")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
enum Command {
    /// Load orders and print the dashboard summary (default)
    Refresh,
    /// Trigger a backend sync, wait for it, then reload
    Sync,
    /// Print the last sync time and the cooldown
    Status,
    /// Store the backend key in the OS keyring
    SetKey { key: String },
    /// Remove the backend key from the OS keyring
    ClearKey,
}

pub fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Command::Refresh);

    let _log_guard = init_logging();
    info!("Starting delivery dashboard v{}", env!("CARGO_PKG_VERSION"));

    match command {
        Command::SetKey { key } => {
            storage::set_credential(storage::KEY_BACKEND_KEY, &key)
                .map_err(|e| anyhow::anyhow!("failed to store backend key: {e}"))?;
            println!("backend key stored");
            Ok(())
        }
        Command::ClearKey => {
            storage::delete_credential(storage::KEY_BACKEND_KEY)
                .map_err(|e| anyhow::anyhow!("failed to delete backend key: {e}"))?;
            println!("backend key removed");
            Ok(())
        }
        command => {
            let config = DashboardConfig::from_env().context("invalid configuration")?;
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("failed to start async runtime")?;
            runtime.block_on(execute(command, &config))
        }
    }
}

async fn execute(command: Command, config: &DashboardConfig) -> anyhow::Result<()> {
    let dashboard = Arc::new(Dashboard::from_config(config)?);

    let on_interrupt = dashboard.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling pending sync work");
            on_interrupt.shutdown();
        }
    });

    let result = match command {
        Command::Status => {
            dashboard.sync_gate().refresh_timestamp().await;
            let gate = dashboard.sync_gate();
            let state = gate.state();
            print_json(&json!({
                "lastSyncTimestamp": state.last_sync_timestamp,
                "canSync": gate.can_sync(),
                "timeUntilNextSync": gate.time_until_next_sync(),
                "enabled": gate.has_endpoint(),
            }))
        }
        Command::Sync => sync_and_report(&dashboard).await,
        _ => {
            let outcome = dashboard.initialize().await;
            print_json(&dashboard.summary_json())?;
            check_outcome(outcome)
        }
    };
    dashboard.shutdown();
    result
}

/// Load, sync, and print the summary. Fails when the sync is refused or
/// when the reload after it does not complete.
async fn sync_and_report(dashboard: &Dashboard) -> anyhow::Result<()> {
    check_outcome(dashboard.initialize().await)?;
    match dashboard.sync_registries().await {
        Ok(reloaded) => {
            print_json(&dashboard.summary_json())?;
            check_outcome(reloaded)
        }
        Err(e) => {
            error!(error = %e, "sync failed");
            print_json(&dashboard.summary_json())?;
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_text_accepts_scalars() {
        let row = json!({
            "blank": "   ",
            "name": "  Alex ",
            "amount": 15000,
            "flag": true,
            "nothing": null,
            "nested": {"a": 1},
        });
        assert_eq!(value_text(&row, &["name"]).as_deref(), Some("Alex"));
        assert_eq!(value_text(&row, &["amount"]).as_deref(), Some("15000"));
        assert_eq!(value_text(&row, &["flag"]).as_deref(), Some("true"));
        assert_eq!(value_text(&row, &["nothing", "nested", "blank"]), None);
        assert_eq!(value_text(&row, &["missing", "blank", "name"]).as_deref(), Some("Alex"));
        assert_eq!(value_text(&json!("text"), &["name"]), None);
    }

    #[test]
    fn test_check_outcome() {
        assert!(check_outcome(PipelineOutcome::Completed).is_ok());
        let err = check_outcome(PipelineOutcome::Failed {
            step: pipeline::StepId::FetchAll,
            message: "Backend server error (HTTP 500)".into(),
        })
        .unwrap_err();
        assert!(err.to_string().contains("fetch-all"));
    }

    #[test]
    fn test_cli_defaults_to_refresh() {
        let cli = Cli::try_parse_from(["delivery-dashboard"]).unwrap();
        assert_eq!(cli.command, None);
        let cli = Cli::try_parse_from(["delivery-dashboard", "sync"]).unwrap();
        assert_eq!(cli.command, Some(Command::Sync));
    }

    #[test]
    fn test_cli_set_key_requires_key() {
        let cli = Cli::try_parse_from(["delivery-dashboard", "set-key", "secret"]).unwrap();
        assert_eq!(
            cli.command,
            Some(Command::SetKey {
                key: "secret".into()
            })
        );
        let err = Cli::try_parse_from(["delivery-dashboard", "set-key"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn test_cli_help_and_unknown_commands() {
        let err = Cli::try_parse_from(["delivery-dashboard", "status", "--help"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayHelp);
        let err = Cli::try_parse_from(["delivery-dashboard", "purge"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::InvalidSubcommand);
    }
}
