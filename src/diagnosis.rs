//! LLM-based failure diagnosis.
//!
//! A [`DiagnosisService`] turns a container snapshot plus a log tail into
//! a structured [`DiagnosisResult`]. The production backend is a local
//! Ollama model; tests substitute deterministic stubs. Absence of a
//! diagnosis is a handled value everywhere, never a missing-value bug.

use serde::{Deserialize, Serialize};

use crate::runtime::ContainerSnapshot;

/// Maximum character length for the evidence string sent to the LLM.
const MAX_EVIDENCE_CHARS: usize = 8000;

/// System prompt for the LLM diagnostician.
const DIAGNOSIS_SYSTEM_PROMPT: &str = "\
You are a container infrastructure diagnostician. Analyze the container \
state and logs below and identify the likely root cause of the failure.

Respond with a JSON object:
{
  \"root_cause\": \"config\" | \"resource\" | \"dependency\" | \"app-crash\" | \"unknown\",
  \"summary\": \"one or two sentences\",
  \"restart_safe\": true | false,
  \"confidence\": \"high\" | \"medium\" | \"low\"
}

restart_safe is false only when a restart would be harmful before manual \
intervention (broken configuration, corrupted state, missing dependency).

Output ONLY the JSON object, no other text.";

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

/// Root-cause category of a container failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RootCause {
    /// Misconfiguration (bad env, bad mounts, bad flags).
    Config,
    /// Resource exhaustion (memory, disk, CPU).
    Resource,
    /// A dependency the container needs is down or unreachable.
    Dependency,
    /// The application itself crashed.
    AppCrash,
    /// No clear signal.
    Unknown,
}

/// Confidence level for a diagnosis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosisConfidence {
    /// Strong signal, high certainty.
    High,
    /// Probable but not certain.
    Medium,
    /// Weak signal, speculative.
    Low,
}

/// Structured diagnosis of one container failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosisResult {
    /// Root-cause category.
    pub root_cause: RootCause,
    /// Free-text explanation for the operator.
    pub summary: String,
    /// Whether an automatic restart is considered safe.
    pub restart_safe: bool,
    /// How certain the backend is.
    pub confidence: DiagnosisConfidence,
}

/// Errors returned by diagnosis backends.
#[derive(Debug, thiserror::Error)]
pub enum DiagnosisError {
    /// Backend down, unreachable, or timed out.
    #[error("diagnosis backend unavailable: {0}")]
    Unavailable(String),
    /// Backend responded, but not with a parseable diagnosis.
    #[error("diagnosis response unparseable: {0}")]
    Parse(String),
}

/// Diagnosis capability consumed by the orchestrator.
///
/// The concrete backend is injected; tests use deterministic stubs.
#[async_trait::async_trait]
pub trait DiagnosisService: Send + Sync {
    /// Diagnose a failed container from its snapshot and log tail.
    ///
    /// # Errors
    ///
    /// Returns [`DiagnosisError`] when the backend is unavailable or its
    /// response cannot be parsed. Callers treat every error as "no
    /// diagnosis", never as fatal.
    async fn diagnose(
        &self,
        snapshot: &ContainerSnapshot,
        log_tail: &str,
    ) -> Result<DiagnosisResult, DiagnosisError>;
}

// ---------------------------------------------------------------------------
// Ollama backend
// ---------------------------------------------------------------------------

/// Ollama chat API request body.
#[derive(Debug, Serialize)]
struct OllamaRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
}

/// A message in Ollama format.
#[derive(Debug, Serialize)]
struct OllamaMessage {
    role: String,
    content: String,
}

/// Ollama chat API response body.
#[derive(Debug, Deserialize)]
struct OllamaResponse {
    message: OllamaResponseMessage,
}

/// The message part of an Ollama response.
#[derive(Debug, Deserialize)]
struct OllamaResponseMessage {
    content: String,
}

/// Ollama-backed diagnosis service using the `/api/chat` API.
#[derive(Debug, Clone)]
pub struct OllamaDiagnosis {
    model: String,
    base_url: String,
    client: reqwest::Client,
}

impl OllamaDiagnosis {
    /// Create a diagnosis service against an Ollama server.
    pub fn new(model: String, base_url: String) -> Self {
        Self {
            model,
            base_url,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait::async_trait]
impl DiagnosisService for OllamaDiagnosis {
    async fn diagnose(
        &self,
        snapshot: &ContainerSnapshot,
        log_tail: &str,
    ) -> Result<DiagnosisResult, DiagnosisError> {
        let request = OllamaRequest {
            model: self.model.clone(),
            messages: vec![
                OllamaMessage {
                    role: "system".to_owned(),
                    content: DIAGNOSIS_SYSTEM_PROMPT.to_owned(),
                },
                OllamaMessage {
                    role: "user".to_owned(),
                    content: build_evidence(snapshot, log_tail),
                },
            ],
            stream: false,
        };

        let url = format!("{}/api/chat", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| DiagnosisError::Unavailable(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| DiagnosisError::Unavailable(e.to_string()))?;
        if !status.is_success() {
            return Err(DiagnosisError::Unavailable(format!(
                "backend returned status {status}"
            )));
        }

        let parsed: OllamaResponse =
            serde_json::from_str(&body).map_err(|e| DiagnosisError::Parse(e.to_string()))?;

        parse_diagnosis(&parsed.message.content).ok_or_else(|| {
            DiagnosisError::Parse("no diagnosis JSON object in model response".to_owned())
        })
    }
}

// ---------------------------------------------------------------------------
// Parsing and evidence
// ---------------------------------------------------------------------------

/// Parse diagnosis JSON from LLM response text, returning `None` on failure.
///
/// Tries to find `{...}` in the response (the model may include extra
/// text), then parses with `serde_json`.
pub fn parse_diagnosis(text: &str) -> Option<DiagnosisResult> {
    let trimmed = text.trim();

    let json_text = match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if end > start => trimmed.get(start..=end).unwrap_or(trimmed),
        _ => trimmed,
    };

    match serde_json::from_str::<DiagnosisResult>(json_text) {
        Ok(d) => Some(d),
        Err(e) => {
            tracing::warn!(
                error = %e,
                text_preview = %text.chars().take(200).collect::<String>(),
                "failed to parse diagnosis JSON"
            );
            None
        }
    }
}

/// Build the evidence string from a snapshot and its log tail.
///
/// Truncates to a bounded size to avoid excessive token usage.
pub fn build_evidence(snapshot: &ContainerSnapshot, log_tail: &str) -> String {
    let mut evidence = String::with_capacity(MAX_EVIDENCE_CHARS.min(1024));

    evidence.push_str("## Container\n");
    evidence.push_str(&format!("name: {}\n", snapshot.name));
    evidence.push_str(&format!("image: {}\n", snapshot.image));
    evidence.push_str(&format!("status: {}\n", snapshot.status));
    if let Some(code) = snapshot.exit_code {
        evidence.push_str(&format!("exit_code: {code}\n"));
    }
    if snapshot.failing_health_check {
        evidence.push_str("health_check: failing\n");
    }
    if let Some(at) = snapshot.last_transition {
        evidence.push_str(&format!("last_transition: {}\n", at.to_rfc3339()));
    }

    evidence.push_str("\n## Recent Logs\n");
    if log_tail.trim().is_empty() {
        evidence.push_str("no logs available\n");
    } else {
        evidence.push_str(log_tail);
        if !log_tail.ends_with('\n') {
            evidence.push('\n');
        }
    }

    if evidence.len() > MAX_EVIDENCE_CHARS {
        evidence.truncate(MAX_EVIDENCE_CHARS);
        evidence.push_str("\n...[truncated]");
    }

    evidence
}
