//! Bounded-retry restart protocol.
//!
//! The healer is the sole writer of restart commands. Each heal episode
//! issues up to `max_attempts` restarts, waiting a fixed per-attempt
//! timeout for the runtime to report `running` before retrying, with no
//! exponential backoff. Concurrent heals for the same container are
//! rejected; serialization is enforced in-process, no lock store needed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::runtime::{ContainerRuntime, ContainerStatus};

/// Retry policy for heal episodes.
///
/// An explicit policy object, decoupled from the runtime client, so the
/// bounded-retry behavior can be verified without a real container.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum restart attempts per episode.
    pub max_attempts: u32,
    /// How long each attempt waits for the runtime to report `running`.
    pub restart_timeout: Duration,
    /// Cadence of readiness re-inspections within an attempt.
    pub poll_interval: Duration,
}

impl RetryPolicy {
    /// Build a policy from raw config values.
    pub fn new(max_attempts: u32, restart_timeout_secs: u64, poll_millis: u64) -> Self {
        Self {
            max_attempts,
            restart_timeout: Duration::from_secs(restart_timeout_secs),
            poll_interval: Duration::from_millis(poll_millis),
        }
    }
}

/// Outcome of one restart attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// Container reached `running` within the attempt window.
    Succeeded,
    /// The restart command itself failed.
    Failed,
    /// The restart was issued but `running` was not observed in time.
    TimedOut,
}

/// Record of one restart attempt within a heal episode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealAttempt {
    /// 1-based attempt number.
    pub number: u32,
    /// When the attempt started.
    pub started_at: DateTime<Utc>,
    /// How the attempt ended.
    pub outcome: AttemptOutcome,
    /// Error detail when the attempt failed.
    pub error: Option<String>,
}

/// Result of a full heal episode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealResult {
    /// Ordered attempts; never longer than the policy's `max_attempts`.
    pub attempts: Vec<HealAttempt>,
    /// True when some attempt observed the container running.
    pub succeeded: bool,
}

/// Errors returned by the healer.
#[derive(Debug, thiserror::Error)]
pub enum HealError {
    /// A heal for this container is already in flight.
    #[error("heal already in flight for container {0}")]
    InFlight(String),
}

/// Executes the restart protocol against a single container at a time.
pub struct Healer {
    runtime: Arc<dyn ContainerRuntime>,
    policy: RetryPolicy,
    /// Per-container mutual exclusion; entries live for the fleet's lifetime.
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Healer {
    /// Create a healer over a runtime with the given retry policy.
    pub fn new(runtime: Arc<dyn ContainerRuntime>, policy: RetryPolicy) -> Self {
        Self {
            runtime,
            policy,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// The policy this healer runs under.
    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Run one heal episode for a container.
    ///
    /// Restarts and waits for readiness up to the policy's attempt limit,
    /// stopping at the first success. A second call for the same container
    /// while one is in flight is rejected, never run in parallel.
    ///
    /// # Errors
    ///
    /// Returns [`HealError::InFlight`] when this container is already
    /// being healed.
    pub async fn heal(&self, container_id: &str, name: &str) -> Result<HealResult, HealError> {
        let lock = self.lock_for(container_id);
        let _guard = lock
            .try_lock()
            .map_err(|_| HealError::InFlight(name.to_owned()))?;

        let mut attempts: Vec<HealAttempt> = Vec::new();

        for number in 1..=self.policy.max_attempts {
            let started_at = Utc::now();
            debug!(container = %name, attempt = number, "issuing restart");

            if let Err(e) = self.runtime.restart(container_id).await {
                warn!(container = %name, attempt = number, error = %e, "restart command failed");
                attempts.push(HealAttempt {
                    number,
                    started_at,
                    outcome: AttemptOutcome::Failed,
                    error: Some(e.to_string()),
                });
                continue;
            }

            if self.await_running(container_id).await {
                info!(container = %name, attempt = number, "container running again");
                attempts.push(HealAttempt {
                    number,
                    started_at,
                    outcome: AttemptOutcome::Succeeded,
                    error: None,
                });
                return Ok(HealResult {
                    attempts,
                    succeeded: true,
                });
            }

            warn!(
                container = %name,
                attempt = number,
                timeout_secs = self.policy.restart_timeout.as_secs(),
                "container did not reach running in time"
            );
            attempts.push(HealAttempt {
                number,
                started_at,
                outcome: AttemptOutcome::TimedOut,
                error: Some(format!(
                    "not running after {}s",
                    self.policy.restart_timeout.as_secs()
                )),
            });
        }

        Ok(HealResult {
            attempts,
            succeeded: false,
        })
    }

    /// Poll the runtime until the container reports `running` or the
    /// per-attempt window elapses. Inspect errors keep the poll going;
    /// the container may be mid-restart.
    async fn await_running(&self, container_id: &str) -> bool {
        let deadline = tokio::time::Instant::now()
            .checked_add(self.policy.restart_timeout)
            .unwrap_or_else(tokio::time::Instant::now);

        loop {
            match self.runtime.inspect(container_id).await {
                Ok(snapshot) if snapshot.status == ContainerStatus::Running => return true,
                Ok(_) => {}
                Err(e) => debug!(container = container_id, error = %e, "inspect during readiness wait"),
            }

            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(self.policy.poll_interval).await;
        }
    }

    /// Fetch or create the per-container lock.
    fn lock_for(&self, container_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut table = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(
            table
                .entry(container_id.to_owned())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }
}

impl std::fmt::Debug for Healer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Healer")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
