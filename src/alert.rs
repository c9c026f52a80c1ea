//! Alert payloads, email dispatch, and the append-only alert log.
//!
//! The orchestrator emits one [`AlertPayload`] per incident state
//! transition. Delivery goes through the [`AlertDispatcher`] capability
//! (swappable with an in-memory collector in tests); every payload is
//! also recorded in the write-only [`AlertLog`] regardless of delivery
//! outcome. Delivery failures are logged and never retried in-cycle.

use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::credentials::MailCredentials;
use crate::diagnosis::DiagnosisResult;
use crate::healer::HealResult;
use crate::runtime::ContainerSnapshot;

/// Alert severity. `Critical` at detection time is reserved for
/// containers in the configured critical-services set; exhausted or
/// blocked heals are always `Critical`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational; a healed container recovering.
    Info,
    /// A container is down but handling is routine.
    Warning,
    /// Manual intervention is or may become necessary.
    Critical,
}

impl Severity {
    /// Uppercase tag for subjects and log lines.
    pub fn tag(self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Critical => "CRITICAL",
        }
    }
}

/// A structured alert about one incident state transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertPayload {
    /// Alert severity.
    pub severity: Severity,
    /// Name of the affected container.
    pub container: String,
    /// Subject line.
    pub subject: String,
    /// Plain-text body.
    pub body: String,
    /// Deduplication key: container id plus incident detection time.
    pub dedupe_key: String,
}

/// Errors returned by alert dispatchers.
#[derive(Debug, thiserror::Error)]
pub enum AlertError {
    /// The payload could not be delivered. Logged, never escalated.
    #[error("alert delivery failed: {0}")]
    Delivery(String),
}

/// Alert delivery capability consumed by the orchestrator.
#[async_trait::async_trait]
pub trait AlertDispatcher: Send + Sync {
    /// Deliver one alert payload.
    ///
    /// # Errors
    ///
    /// Returns [`AlertError::Delivery`] on transport failure. Callers log
    /// and move on; the next state transition is the next opportunity.
    async fn send(&self, payload: &AlertPayload) -> Result<(), AlertError>;
}

// ---------------------------------------------------------------------------
// Payload builders
// ---------------------------------------------------------------------------

/// Render the diagnosis section of an alert body.
///
/// An unavailable diagnosis is stated explicitly rather than silently
/// omitted.
fn diagnosis_section(label: &str, diagnosis: Option<&DiagnosisResult>) -> String {
    match diagnosis {
        Some(d) => format!(
            "{label}: {summary}\n  Root cause: {cause:?}\n  Confidence: {confidence:?}\n  Restart safe: {safe}\n",
            summary = d.summary,
            cause = d.root_cause,
            confidence = d.confidence,
            safe = if d.restart_safe { "yes" } else { "no" },
        ),
        None => format!("{label}: unavailable (diagnosis backend unreachable or timed out)\n"),
    }
}

/// Build the detection alert for check mode.
pub fn detected(
    snapshot: &ContainerSnapshot,
    diagnosis: Option<&DiagnosisResult>,
    is_critical: bool,
    dedupe_key: &str,
) -> AlertPayload {
    let severity = if is_critical {
        Severity::Critical
    } else {
        Severity::Warning
    };

    let exit_line = snapshot
        .exit_code
        .map(|code| format!("Exit code: {code}\n"))
        .unwrap_or_default();

    let body = format!(
        "Container {name} is DOWN.\n\n\
         Status: {status}\n\
         Image: {image}\n\
         {exit_line}\
         Mode: check only, no auto-healing attempted. Awaiting manual intervention.\n\n\
         {diag}",
        name = snapshot.name,
        status = snapshot.status,
        image = snapshot.image,
        diag = diagnosis_section("Diagnosis", diagnosis),
    );

    AlertPayload {
        severity,
        container: snapshot.name.clone(),
        subject: format!("Container {} DOWN - check mode, no auto-heal", snapshot.name),
        body,
        dedupe_key: dedupe_key.to_owned(),
    }
}

/// Build the resolution summary after a successful heal episode.
pub fn resolved(
    container_name: &str,
    result: &HealResult,
    post_diagnosis: Option<&DiagnosisResult>,
    dedupe_key: &str,
) -> AlertPayload {
    let body = format!(
        "Container {container_name} was DOWN and has been auto-restarted.\n\n\
         Restart attempts: {attempts}\n\
         Result: SUCCESS\n\n\
         {diag}\
         No further action required.\n",
        attempts = result.attempts.len(),
        diag = diagnosis_section("Post-heal verification", post_diagnosis),
    );

    AlertPayload {
        severity: Severity::Info,
        container: container_name.to_owned(),
        subject: format!("Container {container_name} auto-healed successfully"),
        body,
        dedupe_key: dedupe_key.to_owned(),
    }
}

/// Build the failure summary after an exhausted heal episode.
pub fn heal_failed(
    container_name: &str,
    result: &HealResult,
    pre_diagnosis: Option<&DiagnosisResult>,
    post_diagnosis: Option<&DiagnosisResult>,
    dedupe_key: &str,
) -> AlertPayload {
    let last_error = result
        .attempts
        .last()
        .and_then(|a| a.error.as_deref())
        .unwrap_or("unknown error");

    let body = format!(
        "Container {container_name} is DOWN and auto-healing FAILED.\n\n\
         Restart attempts: {attempts}\n\
         Last error: {last_error}\n\n\
         {pre}\
         {post}\n\
         ACTION REQUIRED: this container needs manual intervention.\n\
         Suggested first steps:\n\
         1. Check container logs: docker logs {container_name}\n\
         2. Inspect container: docker inspect {container_name}\n\
         3. Check host resources: disk space, memory\n",
        attempts = result.attempts.len(),
        pre = diagnosis_section("Pre-heal diagnosis", pre_diagnosis),
        post = diagnosis_section("Post-heal diagnosis", post_diagnosis),
    );

    AlertPayload {
        severity: Severity::Critical,
        container: container_name.to_owned(),
        subject: format!("URGENT: Container {container_name} DOWN - auto-heal failed"),
        body,
        dedupe_key: dedupe_key.to_owned(),
    }
}

/// Build the escalation alert for a blocked auto-heal (critical service
/// without a diagnosis, or a diagnosis reporting restart unsafe).
pub fn escalation(
    container_name: &str,
    reason: &str,
    pre_diagnosis: Option<&DiagnosisResult>,
    dedupe_key: &str,
) -> AlertPayload {
    let body = format!(
        "Container {container_name} is DOWN and was NOT auto-restarted.\n\n\
         Reason: {reason}\n\n\
         {diag}\n\
         ACTION REQUIRED: this container needs manual intervention before\n\
         any restart is attempted.\n",
        diag = diagnosis_section("Pre-heal diagnosis", pre_diagnosis),
    );

    AlertPayload {
        severity: Severity::Critical,
        container: container_name.to_owned(),
        subject: format!("URGENT: Container {container_name} DOWN - manual intervention required"),
        body,
        dedupe_key: dedupe_key.to_owned(),
    }
}

// ---------------------------------------------------------------------------
// Email dispatcher
// ---------------------------------------------------------------------------

/// SMTP-backed alert dispatcher using STARTTLS.
pub struct EmailDispatcher {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Mailbox,
    min_severity: Severity,
}

impl EmailDispatcher {
    /// Build a dispatcher from SMTP settings and mail credentials.
    ///
    /// # Errors
    ///
    /// Returns an error when an address does not parse or the transport
    /// cannot be constructed.
    pub fn new(
        smtp_host: &str,
        smtp_port: u16,
        creds: &MailCredentials,
        min_severity: Severity,
    ) -> anyhow::Result<Self> {
        let from: Mailbox = creds
            .from
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid EMAIL_FROM address: {e}"))?;
        let to: Mailbox = creds
            .to
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid EMAIL_TO address: {e}"))?;

        let smtp_creds = Credentials::new(creds.from.clone(), creds.app_password.clone());
        let mailer = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(smtp_host)
            .map_err(|e| anyhow::anyhow!("failed to create SMTP transport: {e}"))?
            .port(smtp_port)
            .credentials(smtp_creds)
            .build();

        Ok(Self {
            mailer,
            from,
            to,
            min_severity,
        })
    }
}

#[async_trait::async_trait]
impl AlertDispatcher for EmailDispatcher {
    async fn send(&self, payload: &AlertPayload) -> Result<(), AlertError> {
        if payload.severity < self.min_severity {
            debug!(
                container = %payload.container,
                severity = payload.severity.tag(),
                "below email severity threshold, log-only"
            );
            return Ok(());
        }

        let email = Message::builder()
            .from(self.from.clone())
            .to(self.to.clone())
            .subject(format!("[{}] {}", payload.severity.tag(), payload.subject))
            .header(ContentType::TEXT_PLAIN)
            .body(payload.body.clone())
            .map_err(|e| AlertError::Delivery(format!("failed to build message: {e}")))?;

        self.mailer
            .send(email)
            .await
            .map_err(|e| AlertError::Delivery(e.to_string()))?;

        debug!(container = %payload.container, "alert email sent");
        Ok(())
    }
}

impl std::fmt::Debug for EmailDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmailDispatcher")
            .field("from", &self.from.to_string())
            .field("to", &self.to.to_string())
            .field("min_severity", &self.min_severity)
            .finish_non_exhaustive()
    }
}

/// Fallback dispatcher used when mail credentials are not configured.
///
/// Alerts still land in the alert log; this just surfaces them on the
/// console.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogOnlyDispatcher;

#[async_trait::async_trait]
impl AlertDispatcher for LogOnlyDispatcher {
    async fn send(&self, payload: &AlertPayload) -> Result<(), AlertError> {
        info!(
            container = %payload.container,
            severity = payload.severity.tag(),
            subject = %payload.subject,
            "alert (email not configured)"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Append-only alert log
// ---------------------------------------------------------------------------

/// One line of the alert log.
#[derive(Debug, Serialize)]
struct AlertLogEntry<'a> {
    timestamp: String,
    severity: Severity,
    container: &'a str,
    subject: &'a str,
    message: &'a str,
}

/// Append-only audit trail of emitted alerts.
///
/// Write-only: the core never reads it back.
pub struct AlertLog {
    writer: Mutex<Box<dyn Write + Send>>,
}

impl AlertLog {
    /// Create an alert log that appends to the given file path.
    ///
    /// # Errors
    ///
    /// Returns an error when the parent directory or file cannot be
    /// created.
    pub fn new(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                anyhow::anyhow!("failed to create {}: {e}", parent.display())
            })?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| anyhow::anyhow!("failed to open alert log {}: {e}", path.display()))?;
        Ok(Self {
            writer: Mutex::new(Box::new(file)),
        })
    }

    /// Create an alert log from an arbitrary writer (for testing).
    pub fn from_writer(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Append one JSON line for an emitted alert.
    ///
    /// # Errors
    ///
    /// Returns an error when serialization or the write fails.
    pub fn record(&self, payload: &AlertPayload) -> anyhow::Result<()> {
        let entry = AlertLogEntry {
            timestamp: Utc::now().to_rfc3339(),
            severity: payload.severity,
            container: &payload.container,
            subject: &payload.subject,
            message: &payload.body,
        };
        let line = serde_json::to_string(&entry)?;

        let mut writer = self
            .writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        writeln!(writer, "{line}")?;
        writer.flush()?;
        Ok(())
    }
}

impl std::fmt::Debug for AlertLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertLog").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_ordering_supports_threshold_gating() {
        assert!(Severity::Info < Severity::Warning);
        assert!(Severity::Warning < Severity::Critical);
    }

    #[test]
    fn severity_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&Severity::Critical).expect("serialize"),
            "\"critical\""
        );
    }
}
