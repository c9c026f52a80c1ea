//! Container runtime contract and the Docker-backed implementation.
//!
//! The orchestrator and healer only ever see the [`ContainerRuntime`]
//! trait; [`DockerRuntime`] is the bollard-backed production client.
//! Snapshots are point-in-time reads, produced fresh on every poll.

use std::collections::HashMap;

use bollard::container::{
    InspectContainerOptions, ListContainersOptions, LogsOptions, RestartContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::models::ContainerStateStatusEnum;
use bollard::Docker;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_stream::StreamExt;

/// Runtime status of a container at snapshot time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// Container process is running.
    Running,
    /// Container has stopped with an exit code.
    Exited,
    /// Container is mid-restart.
    Restarting,
    /// Any other or unreadable state.
    Unknown,
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Running => "running",
            Self::Exited => "exited",
            Self::Restarting => "restarting",
            Self::Unknown => "unknown",
        };
        f.write_str(label)
    }
}

/// Point-in-time read of one container. Ephemeral; recreated every poll.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSnapshot {
    /// Runtime-assigned container id.
    pub id: String,
    /// Container name without the leading slash.
    pub name: String,
    /// Container labels.
    pub labels: HashMap<String, String>,
    /// Runtime status.
    pub status: ContainerStatus,
    /// Exit code, when the container has exited.
    pub exit_code: Option<i64>,
    /// Image reference the container was created from.
    pub image: String,
    /// Timestamp of the last status transition, when the runtime reports one.
    pub last_transition: Option<DateTime<Utc>>,
    /// True when the runtime reports a failing health check despite the
    /// container running.
    pub failing_health_check: bool,
}

impl ContainerSnapshot {
    /// Whether this snapshot counts as healthy: running with no failing
    /// health check.
    pub fn is_healthy(&self) -> bool {
        self.status == ContainerStatus::Running && !self.failing_health_check
    }
}

/// Filter restricting management to containers carrying a label.
///
/// Parsed from `"key=value"`, or bare `"key"` for a presence check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelSelector {
    /// Label key that must be present.
    pub key: String,
    /// Required label value; `None` matches any value.
    pub value: Option<String>,
}

impl LabelSelector {
    /// Parse a selector from its `key=value` or bare `key` form.
    ///
    /// # Errors
    ///
    /// Returns an error when the key part is empty.
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let (key, value) = match raw.split_once('=') {
            Some((k, v)) => (k.trim(), Some(v.trim().to_owned())),
            None => (raw.trim(), None),
        };
        if key.is_empty() {
            anyhow::bail!("label selector has an empty key: {raw:?}");
        }
        Ok(Self {
            key: key.to_owned(),
            value,
        })
    }

    /// Render the selector in the Docker API `label` filter form.
    pub fn as_filter(&self) -> String {
        match &self.value {
            Some(value) => format!("{}={value}", self.key),
            None => self.key.clone(),
        }
    }
}

impl std::fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_filter())
    }
}

/// Errors returned by the container runtime.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// The runtime daemon cannot be reached.
    #[error("container runtime unavailable: {0}")]
    Unavailable(String),
    /// The named container does not exist.
    #[error("container not found: {0}")]
    NotFound(String),
    /// Any other runtime API failure.
    #[error("container runtime error: {0}")]
    Api(String),
}

/// Read/restart access to the container runtime.
///
/// The healer is the sole caller of [`restart`](ContainerRuntime::restart);
/// everything else is read-only.
#[async_trait::async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Enumerate containers (running or not) matching the label selector.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Unavailable`] when the daemon cannot be
    /// reached.
    async fn list(&self, selector: &LabelSelector) -> Result<Vec<ContainerSnapshot>, RuntimeError>;

    /// Produce a fresh snapshot of one container.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError`] on daemon or lookup failure.
    async fn inspect(&self, id: &str) -> Result<ContainerSnapshot, RuntimeError>;

    /// Issue a restart command for one container.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError`] when the restart cannot be issued.
    async fn restart(&self, id: &str) -> Result<(), RuntimeError>;

    /// Read the last `lines` log lines of one container, timestamped.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError`] on daemon or lookup failure.
    async fn tail_logs(&self, id: &str, lines: u32) -> Result<String, RuntimeError>;
}

/// Docker-backed runtime client.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    docker: Docker,
    stop_timeout_secs: u64,
}

impl DockerRuntime {
    /// Connect to the local Docker daemon.
    ///
    /// `stop_timeout_secs` is the grace period Docker gives a container
    /// before killing it during restart.
    ///
    /// # Errors
    ///
    /// Returns an error when the Docker socket cannot be resolved.
    pub fn connect(stop_timeout_secs: u64) -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;
        Ok(Self {
            docker,
            stop_timeout_secs,
        })
    }
}

#[async_trait::async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list(&self, selector: &LabelSelector) -> Result<Vec<ContainerSnapshot>, RuntimeError> {
        let mut filters: HashMap<String, Vec<String>> = HashMap::new();
        filters.insert("label".to_owned(), vec![selector.as_filter()]);

        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };

        let summaries = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;

        let mut snapshots = Vec::with_capacity(summaries.len());
        for summary in summaries {
            let Some(id) = summary.id else { continue };
            // The summary lacks exit codes and health state; inspect for
            // the full picture.
            match self.inspect(&id).await {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(RuntimeError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(snapshots)
    }

    async fn inspect(&self, id: &str) -> Result<ContainerSnapshot, RuntimeError> {
        let inspect = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(map_api_error)?;

        let state = inspect.state.unwrap_or_default();
        let status = match state.status {
            Some(ContainerStateStatusEnum::RUNNING) => ContainerStatus::Running,
            Some(ContainerStateStatusEnum::EXITED) => ContainerStatus::Exited,
            Some(ContainerStateStatusEnum::RESTARTING) => ContainerStatus::Restarting,
            _ => ContainerStatus::Unknown,
        };

        let exit_code = match status {
            ContainerStatus::Exited => state.exit_code,
            _ => None,
        };

        let failing_health_check = matches!(
            state.health.as_ref().and_then(|h| h.status.as_ref()),
            Some(bollard::models::HealthStatusEnum::UNHEALTHY)
        );

        let last_transition = match status {
            ContainerStatus::Exited => parse_docker_time(state.finished_at.as_deref()),
            _ => parse_docker_time(state.started_at.as_deref()),
        };

        let config = inspect.config.unwrap_or_default();

        Ok(ContainerSnapshot {
            id: inspect.id.unwrap_or_else(|| id.to_owned()),
            name: inspect
                .name
                .map(|n| n.trim_start_matches('/').to_owned())
                .unwrap_or_else(|| id.to_owned()),
            labels: config.labels.unwrap_or_default(),
            status,
            exit_code,
            image: config.image.unwrap_or_else(|| "unknown".to_owned()),
            last_transition,
            failing_health_check,
        })
    }

    async fn restart(&self, id: &str) -> Result<(), RuntimeError> {
        let options = RestartContainerOptions {
            t: isize::try_from(self.stop_timeout_secs).unwrap_or(10),
        };
        self.docker
            .restart_container(id, Some(options))
            .await
            .map_err(map_api_error)
    }

    async fn tail_logs(&self, id: &str, lines: u32) -> Result<String, RuntimeError> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            timestamps: true,
            tail: lines.to_string(),
            ..Default::default()
        };

        let mut stream = self.docker.logs(id, Some(options));
        let mut collected = String::new();

        while let Some(chunk) = stream.next().await {
            let log = chunk.map_err(map_api_error)?;
            match log {
                bollard::container::LogOutput::StdOut { message }
                | bollard::container::LogOutput::StdErr { message }
                | bollard::container::LogOutput::Console { message } => {
                    collected.push_str(&String::from_utf8_lossy(&message));
                }
                bollard::container::LogOutput::StdIn { .. } => {}
            }
        }

        Ok(collected)
    }
}

/// Map a bollard error to the runtime taxonomy, distinguishing 404s.
fn map_api_error(e: BollardError) -> RuntimeError {
    match e {
        BollardError::DockerResponseServerError {
            status_code: 404,
            message,
        } => RuntimeError::NotFound(message),
        other => RuntimeError::Api(other.to_string()),
    }
}

/// Parse a Docker RFC 3339 timestamp, treating the zero value as absent.
fn parse_docker_time(raw: Option<&str>) -> Option<DateTime<Utc>> {
    let raw = raw?;
    if raw.is_empty() || raw.starts_with("0001-") {
        return None;
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}
