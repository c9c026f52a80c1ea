//! Configuration loading and validation.
//!
//! Loads `triage.toml` with per-section defaults. All sections use
//! `#[serde(default)]` so a minimal or empty config file is valid.
//! The config is built once at startup and passed explicitly into the
//! orchestrator, healer, and dispatcher; no global state.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::alert::Severity;

/// Top-level triage configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TriageConfig {
    /// Poll cycle timing and container selection.
    pub monitoring: MonitoringConfig,

    /// Restart retry policy and cool-down.
    pub healing: HealingConfig,

    /// LLM diagnosis backend settings.
    pub diagnosis: DiagnosisConfig,

    /// SMTP relay settings for email alerts.
    pub email: EmailConfig,

    /// Alert audit log settings.
    pub alerts: AlertsConfig,
}

/// Poll cycle timing and container selection.
#[derive(Debug, Clone, Deserialize)]
pub struct MonitoringConfig {
    /// Seconds between poll cycles in continuous mode.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Label selector identifying managed containers, `"key=value"` or
    /// bare `"key"` for a presence check.
    #[serde(default = "default_label_selector")]
    pub label_selector: String,

    /// Container names receiving `critical` severity and the stricter
    /// diagnosis-required rule before auto-heal.
    #[serde(default)]
    pub critical_services: Vec<String>,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            label_selector: default_label_selector(),
            critical_services: Vec::new(),
        }
    }
}

/// Restart retry policy and cool-down timing.
#[derive(Debug, Clone, Deserialize)]
pub struct HealingConfig {
    /// Maximum restart attempts per heal episode.
    #[serde(default = "default_max_restart_attempts")]
    pub max_restart_attempts: u32,

    /// Seconds to wait for the runtime to report `running` after each
    /// restart attempt.
    #[serde(default = "default_restart_timeout_secs")]
    pub restart_timeout_secs: u64,

    /// Milliseconds between readiness re-inspections within an attempt.
    #[serde(default = "default_readiness_poll_millis")]
    pub readiness_poll_millis: u64,

    /// Seconds a container with exhausted retries is suppressed before a
    /// fresh heal episode may open. Defaults to one poll interval.
    #[serde(default)]
    pub cooldown_secs: Option<u64>,
}

impl Default for HealingConfig {
    fn default() -> Self {
        Self {
            max_restart_attempts: default_max_restart_attempts(),
            restart_timeout_secs: default_restart_timeout_secs(),
            readiness_poll_millis: default_readiness_poll_millis(),
            cooldown_secs: None,
        }
    }
}

/// LLM diagnosis backend settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DiagnosisConfig {
    /// Model name passed to the backend.
    #[serde(default = "default_model")]
    pub model: String,

    /// Base URL of the Ollama API.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Seconds before a diagnosis call is treated as unavailable.
    #[serde(default = "default_diagnosis_timeout_secs")]
    pub timeout_secs: u64,

    /// Number of log lines included in the diagnosis evidence.
    #[serde(default = "default_log_tail_lines")]
    pub log_tail_lines: u32,
}

impl Default for DiagnosisConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            base_url: default_base_url(),
            timeout_secs: default_diagnosis_timeout_secs(),
            log_tail_lines: default_log_tail_lines(),
        }
    }
}

/// SMTP relay settings for email alerts.
///
/// Credentials come from the environment (`EMAIL_FROM`,
/// `EMAIL_APP_PASSWORD`, `EMAIL_TO`), never from this file.
#[derive(Debug, Clone, Deserialize)]
pub struct EmailConfig {
    /// SMTP relay host.
    #[serde(default = "default_smtp_host")]
    pub smtp_host: String,

    /// SMTP relay port (STARTTLS).
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,

    /// Minimum severity that goes out by email. Lower severities are
    /// still written to the alert log.
    #[serde(default = "default_min_severity")]
    pub min_severity: Severity,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            smtp_host: default_smtp_host(),
            smtp_port: default_smtp_port(),
            min_severity: default_min_severity(),
        }
    }
}

/// Alert audit log settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AlertsConfig {
    /// Path of the append-only alert log. Defaults to
    /// `~/.triage/alerts.log`.
    #[serde(default)]
    pub log_path: Option<PathBuf>,
}

// Default value functions for serde

fn default_interval_secs() -> u64 {
    30
}
fn default_label_selector() -> String {
    "environment=production".to_owned()
}
fn default_max_restart_attempts() -> u32 {
    3
}
fn default_restart_timeout_secs() -> u64 {
    10
}
fn default_readiness_poll_millis() -> u64 {
    500
}
fn default_model() -> String {
    "llama3.2:latest".to_owned()
}
fn default_base_url() -> String {
    "http://127.0.0.1:11434".to_owned()
}
fn default_diagnosis_timeout_secs() -> u64 {
    30
}
fn default_log_tail_lines() -> u32 {
    20
}
fn default_smtp_host() -> String {
    "smtp.gmail.com".to_owned()
}
fn default_smtp_port() -> u16 {
    587
}
fn default_min_severity() -> Severity {
    Severity::Warning
}

impl TriageConfig {
    /// Cool-down window after exhausted retries. Defaults to one poll
    /// interval when not configured.
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(
            self.healing
                .cooldown_secs
                .unwrap_or(self.monitoring.interval_secs),
        )
    }

    /// Per-diagnosis-call timeout.
    pub fn diagnosis_timeout(&self) -> Duration {
        Duration::from_secs(self.diagnosis.timeout_secs)
    }
}

/// Load configuration from a TOML file.
///
/// Path precedence: explicit argument, then `$TRIAGE_CONFIG_PATH`, then
/// `./triage.toml`. A missing file yields defaults.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<TriageConfig> {
    let resolved = match path {
        Some(p) => p.to_path_buf(),
        None => std::env::var("TRIAGE_CONFIG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("triage.toml")),
    };

    match std::fs::read_to_string(&resolved) {
        Ok(contents) => {
            tracing::info!(path = %resolved.display(), "loading config from file");
            let config: TriageConfig = toml::from_str(&contents)
                .with_context(|| format!("failed to parse config at {}", resolved.display()))?;
            Ok(config)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!("no config file found, using defaults");
            Ok(TriageConfig::default())
        }
        Err(e) => Err(anyhow::anyhow!(
            "failed to read config at {}: {e}",
            resolved.display()
        )),
    }
}

/// Resolve the triage data directory (`~/.triage/`).
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn data_dir() -> anyhow::Result<PathBuf> {
    let home = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
    Ok(home.home_dir().join(".triage"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_gives_defaults() {
        let config: TriageConfig = toml::from_str("").expect("empty config should parse");
        assert_eq!(config.monitoring.interval_secs, 30);
        assert_eq!(config.monitoring.label_selector, "environment=production");
        assert_eq!(config.healing.max_restart_attempts, 3);
        assert_eq!(config.healing.restart_timeout_secs, 10);
        assert_eq!(config.diagnosis.timeout_secs, 30);
        assert_eq!(config.email.smtp_port, 587);
    }

    #[test]
    fn cooldown_defaults_to_poll_interval() {
        let config = TriageConfig::default();
        assert_eq!(config.cooldown(), Duration::from_secs(30));
    }

    #[test]
    fn explicit_cooldown_wins() {
        let config: TriageConfig = toml::from_str("[healing]\ncooldown_secs = 120\n")
            .expect("config should parse");
        assert_eq!(config.cooldown(), Duration::from_secs(120));
    }

    #[test]
    fn partial_section_fills_defaults() {
        let config: TriageConfig = toml::from_str(
            "[monitoring]\ninterval_secs = 5\ncritical_services = [\"prod-db-01\"]\n",
        )
        .expect("config should parse");
        assert_eq!(config.monitoring.interval_secs, 5);
        assert_eq!(config.monitoring.critical_services, vec!["prod-db-01"]);
        assert_eq!(config.healing.max_restart_attempts, 3);
    }
}
