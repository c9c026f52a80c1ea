//! Incident records: the lifecycle of one unhealthy episode.
//!
//! An incident is created on first unhealthy observation, mutated in
//! place by diagnosis and heal steps, and closed when the container
//! returns healthy or retries exhaust. Closed records are retained for
//! audit only, never reopened.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::diagnosis::DiagnosisResult;
use crate::healer::HealAttempt;
use crate::runtime::ContainerStatus;

/// Resolution state of an incident. Monotonic: `Open` moves to
/// `Resolved` or `Failed` and never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Episode in progress.
    Open,
    /// Container verified healthy after healing.
    Resolved,
    /// Retries exhausted or auto-heal blocked.
    Failed,
}

/// Which per-transition alerts have been emitted for this episode.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AlertFlags {
    /// Detection alert sent (check mode).
    pub detected: bool,
    /// Resolution summary sent after a successful heal.
    pub resolved: bool,
    /// Failure summary or escalation sent.
    pub failed: bool,
}

/// The lifecycle record of one continuous unhealthy episode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncidentRecord {
    /// Unique incident identifier.
    pub id: String,
    /// Runtime id of the affected container.
    pub container_id: String,
    /// Name of the affected container.
    pub container_name: String,
    /// When the episode was first observed.
    pub detected_at: DateTime<Utc>,
    /// Status observed at detection; a change counts as a new signal.
    pub observed_status: ContainerStatus,
    /// Pre-heal diagnosis; absent when the backend was unavailable.
    pub pre_diagnosis: Option<DiagnosisResult>,
    /// Ordered restart attempts, bounded by the retry policy.
    pub attempts: Vec<HealAttempt>,
    /// Post-heal diagnosis; absent when the backend was unavailable.
    pub post_diagnosis: Option<DiagnosisResult>,
    /// Current resolution state.
    pub resolution: Resolution,
    /// Per-transition alert bookkeeping.
    pub alerts: AlertFlags,
    /// When the last alert for this episode went out.
    pub last_alert_at: Option<DateTime<Utc>>,
    /// When the episode reached `Failed`, for cool-down accounting.
    pub failed_at: Option<DateTime<Utc>>,
}

impl IncidentRecord {
    /// Open a new incident for a container observed unhealthy.
    pub fn open(
        container_id: &str,
        container_name: &str,
        observed_status: ContainerStatus,
        detected_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: format!("incident-{}", uuid::Uuid::new_v4()),
            container_id: container_id.to_owned(),
            container_name: container_name.to_owned(),
            detected_at,
            observed_status,
            pre_diagnosis: None,
            attempts: Vec::new(),
            post_diagnosis: None,
            resolution: Resolution::Open,
            alerts: AlertFlags::default(),
            last_alert_at: None,
            failed_at: None,
        }
    }

    /// Alert deduplication key: container id plus detection time.
    pub fn dedupe_key(&self) -> String {
        format!("{}:{}", self.container_id, self.detected_at.to_rfc3339())
    }
}
