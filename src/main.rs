//! Triage CLI entry point.
//!
//! `triage --mode check` runs one diagnostic cycle and exits; `--mode heal`
//! adds auto-restarts; `--continuous` keeps polling until interrupted.
//! Exit code is 0 on normal completion or clean shutdown, non-zero on a
//! fatal startup failure (including an unreachable container runtime at
//! first contact in one-shot mode).

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use triage::alert::{AlertDispatcher, AlertLog, EmailDispatcher, LogOnlyDispatcher};
use triage::config::{data_dir, load_config};
use triage::credentials::MailCredentials;
use triage::diagnosis::OllamaDiagnosis;
use triage::healer::{Healer, RetryPolicy};
use triage::orchestrator::{Mode, Orchestrator};
use triage::runtime::{ContainerRuntime, DockerRuntime};

/// Triage — container fleet watchdog with AI diagnosis.
#[derive(Parser)]
#[command(name = "triage", version, about)]
struct Cli {
    /// Operating mode: 'check' (diagnose and alert only) or 'heal'
    /// (diagnose, auto-restart, verify).
    #[arg(long, value_enum)]
    mode: Mode,

    /// Keep polling at the configured interval. Without this flag, run a
    /// single cycle and exit.
    #[arg(long)]
    continuous: bool,

    /// Config file path (default: ./triage.toml or $TRIAGE_CONFIG_PATH).
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Credentials may live in a local .env, as in a compose deployment.
    dotenvy::dotenv().ok();

    let data_dir = data_dir().context("failed to resolve data directory")?;

    // Continuous mode gets rotated JSON file logs; one-shot stays on stderr.
    let _logging_guard = if cli.continuous {
        Some(triage::logging::init_production(&data_dir.join("logs"))?)
    } else {
        triage::logging::init_cli();
        None
    };

    let config = load_config(cli.config.as_deref()).context("failed to load configuration")?;

    let runtime: Arc<dyn ContainerRuntime> = Arc::new(
        DockerRuntime::connect(config.healing.restart_timeout_secs)
            .context("cannot connect to the container runtime")?,
    );

    let diagnosis = Arc::new(OllamaDiagnosis::new(
        config.diagnosis.model.clone(),
        config.diagnosis.base_url.clone(),
    ));

    let healer = Healer::new(
        Arc::clone(&runtime),
        RetryPolicy::new(
            config.healing.max_restart_attempts,
            config.healing.restart_timeout_secs,
            config.healing.readiness_poll_millis,
        ),
    );

    let dispatcher: Arc<dyn AlertDispatcher> = match MailCredentials::from_env() {
        Some(creds) => {
            info!(to = %creds.to, "email alerting configured");
            Arc::new(EmailDispatcher::new(
                &config.email.smtp_host,
                config.email.smtp_port,
                &creds,
                config.email.min_severity,
            )?)
        }
        None => {
            warn!("EMAIL_FROM/EMAIL_APP_PASSWORD/EMAIL_TO not set, alerts go to the log only");
            Arc::new(LogOnlyDispatcher)
        }
    };

    let alert_log_path = config
        .alerts
        .log_path
        .clone()
        .unwrap_or_else(|| data_dir.join("alerts.log"));
    let alert_log = AlertLog::new(&alert_log_path)
        .with_context(|| format!("failed to open alert log {}", alert_log_path.display()))?;

    let mut orchestrator = Orchestrator::new(
        config,
        cli.mode,
        runtime,
        diagnosis,
        healer,
        dispatcher,
        alert_log,
    )?;

    if cli.continuous {
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("received shutdown signal");
                let _ = shutdown_tx.send(true);
            }
        });

        orchestrator.run_continuous(shutdown_rx).await;
    } else {
        let summary = orchestrator
            .run_cycle(None)
            .await
            .context("inventory unavailable")?;
        info!(
            total = summary.total,
            healthy = summary.healthy,
            unhealthy = summary.unhealthy,
            "cycle complete"
        );
    }

    Ok(())
}
