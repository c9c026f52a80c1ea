//! The incident orchestrator: per-container state machines over poll cycles.
//!
//! Each cycle pulls inventory, walks the containers sequentially, and
//! drives one incident per unhealthy container through pre-diagnosis,
//! bounded-retry healing, post-heal verification, and deduplicated
//! alerting. Check mode never mutates the runtime. A container whose
//! retries exhausted sits in a cool-down window before a fresh episode
//! may open, which bounds heal bursts and repeat alerts to one per window.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::alert::{self, AlertDispatcher, AlertLog, AlertPayload};
use crate::config::TriageConfig;
use crate::diagnosis::{DiagnosisResult, DiagnosisService};
use crate::healer::Healer;
use crate::incident::{IncidentRecord, Resolution};
use crate::runtime::{ContainerRuntime, ContainerSnapshot, LabelSelector, RuntimeError};

/// Operating mode of the watchdog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Mode {
    /// Monitor, diagnose, and alert; never restart anything.
    Check,
    /// Monitor, diagnose, auto-restart, verify, and alert.
    Heal,
}

/// Counts from one completed poll cycle.
#[derive(Debug, Clone, Copy)]
pub struct CycleSummary {
    /// Containers matching the label selector.
    pub total: usize,
    /// Containers observed healthy.
    pub healthy: usize,
    /// Containers observed unhealthy.
    pub unhealthy: usize,
}

/// Drives the per-container incident state machines.
pub struct Orchestrator {
    config: TriageConfig,
    mode: Mode,
    selector: LabelSelector,
    runtime: Arc<dyn ContainerRuntime>,
    diagnosis: Arc<dyn DiagnosisService>,
    healer: Healer,
    dispatcher: Arc<dyn AlertDispatcher>,
    alert_log: AlertLog,
    /// Open or cooled-down episodes, keyed by container name. At most one
    /// entry per container.
    incidents: HashMap<String, IncidentRecord>,
    /// Closed episodes, retained for audit only.
    retired: Vec<IncidentRecord>,
}

impl Orchestrator {
    /// Wire up an orchestrator from its collaborators.
    ///
    /// # Errors
    ///
    /// Returns an error when the configured label selector does not parse.
    pub fn new(
        config: TriageConfig,
        mode: Mode,
        runtime: Arc<dyn ContainerRuntime>,
        diagnosis: Arc<dyn DiagnosisService>,
        healer: Healer,
        dispatcher: Arc<dyn AlertDispatcher>,
        alert_log: AlertLog,
    ) -> anyhow::Result<Self> {
        let selector = LabelSelector::parse(&config.monitoring.label_selector)?;
        Ok(Self {
            config,
            mode,
            selector,
            runtime,
            diagnosis,
            healer,
            dispatcher,
            alert_log,
            incidents: HashMap::new(),
            retired: Vec::new(),
        })
    }

    /// The episode record currently tracked for a container, if any.
    pub fn incident_for(&self, container_name: &str) -> Option<&IncidentRecord> {
        self.incidents.get(container_name)
    }

    /// Closed episodes retained for audit.
    pub fn retired(&self) -> &[IncidentRecord] {
        &self.retired
    }

    /// Run one poll cycle.
    ///
    /// Containers are processed sequentially; the optional shutdown signal
    /// is honored between container steps, never mid-step.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Unavailable`] when the inventory cannot be
    /// pulled. Fatal in one-shot mode; continuous mode skips the cycle.
    pub async fn run_cycle(
        &mut self,
        shutdown: Option<&watch::Receiver<bool>>,
    ) -> Result<CycleSummary, RuntimeError> {
        let snapshots = self.runtime.list(&self.selector).await?;

        let total = snapshots.len();
        let healthy = snapshots.iter().filter(|s| s.is_healthy()).count();
        let summary = CycleSummary {
            total,
            healthy,
            unhealthy: total.saturating_sub(healthy),
        };
        info!(
            selector = %self.selector,
            running = healthy,
            total,
            "container status"
        );

        for snapshot in &snapshots {
            if shutdown.is_some_and(|rx| *rx.borrow()) {
                info!("shutdown requested, finishing cycle early");
                break;
            }
            self.process_container(snapshot).await;
        }

        Ok(summary)
    }

    /// Run the continuous monitoring loop until the shutdown signal fires.
    ///
    /// Inventory failures are non-fatal here: the cycle is skipped and
    /// retried at the next interval.
    pub async fn run_continuous(&mut self, mut shutdown_rx: watch::Receiver<bool>) {
        let interval_secs = self.config.monitoring.interval_secs;
        info!(interval_secs, mode = ?self.mode, "continuous monitoring started");

        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
        let mut cycle: u64 = 0;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    cycle = cycle.saturating_add(1);
                    debug!(cycle, "poll cycle starting");
                    match self.run_cycle(Some(&shutdown_rx)).await {
                        Ok(summary) => {
                            debug!(
                                cycle,
                                total = summary.total,
                                unhealthy = summary.unhealthy,
                                "poll cycle complete"
                            );
                        }
                        Err(e) => {
                            warn!(cycle, error = %e, "inventory unavailable, skipping cycle");
                        }
                    }
                }
                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        info!(cycles = cycle, "continuous monitoring stopped");
    }

    /// Advance the state machine for one container snapshot.
    async fn process_container(&mut self, snapshot: &ContainerSnapshot) {
        let name = snapshot.name.clone();

        if snapshot.is_healthy() {
            // Healthy containers are never touched; a tracked episode ends
            // here.
            if let Some(record) = self.incidents.remove(&name) {
                info!(
                    container = %name,
                    resolution = ?record.resolution,
                    "container healthy again, closing episode"
                );
                self.retired.push(record);
            }
            return;
        }

        let tracked = self.incidents.get(&name).map(|r| r.resolution);
        match tracked {
            Some(Resolution::Open) => {
                // Same ongoing episode; the detection alert already went out.
                debug!(container = %name, "incident already open, no new alert");
            }
            Some(Resolution::Failed) => {
                self.handle_cooldown(snapshot).await;
            }
            _ => {
                info!(
                    container = %name,
                    status = %snapshot.status,
                    exit_code = ?snapshot.exit_code,
                    "incident detected"
                );
                self.open_incident(snapshot).await;
            }
        }
    }

    /// Handle an unhealthy container whose previous episode exhausted its
    /// retries. Within the cool-down window the container is left alone;
    /// after it (or on a new distinguishing signal) the exhausted episode
    /// retires and a fresh one opens with a fresh attempt budget.
    async fn handle_cooldown(&mut self, snapshot: &ContainerSnapshot) {
        let name = &snapshot.name;
        let Some(record) = self.incidents.get(name) else {
            return;
        };

        let now = Utc::now();
        let failed_at = record.failed_at.unwrap_or(record.detected_at);
        let elapsed = now.signed_duration_since(failed_at);
        let window = cooldown_window(&self.config);
        let new_signal = snapshot.status != record.observed_status;

        if new_signal || elapsed >= window {
            if new_signal {
                info!(
                    container = %name,
                    was = %record.observed_status,
                    now = %snapshot.status,
                    "status changed after failed heal, opening fresh episode"
                );
            } else {
                info!(container = %name, "cool-down expired, opening fresh episode");
            }
            if let Some(old) = self.incidents.remove(name) {
                self.retired.push(old);
            }
            self.open_incident(snapshot).await;
        } else {
            debug!(container = %name, "cool-down active, suppressing heal and alert");
        }
    }

    /// Open a new incident and drive it per the operating mode.
    async fn open_incident(&mut self, snapshot: &ContainerSnapshot) {
        match self.mode {
            Mode::Check => self.run_check_episode(snapshot).await,
            Mode::Heal => self.run_heal_episode(snapshot).await,
        }
    }

    /// Check mode: diagnose, alert once, never touch the runtime.
    ///
    /// The record stays open while the container remains unhealthy, which
    /// is what suppresses one-alert-per-tick; it closes quietly on the
    /// next healthy observation.
    async fn run_check_episode(&mut self, snapshot: &ContainerSnapshot) {
        let mut record = IncidentRecord::open(
            &snapshot.id,
            &snapshot.name,
            snapshot.status,
            Utc::now(),
        );

        let pre = self.diagnose(snapshot).await;
        record.pre_diagnosis = pre.clone();

        let payload = alert::detected(
            snapshot,
            pre.as_ref(),
            self.is_critical(&snapshot.name),
            &record.dedupe_key(),
        );
        self.emit(&payload).await;
        record.alerts.detected = true;
        record.last_alert_at = Some(Utc::now());

        self.incidents.insert(snapshot.name.clone(), record);
    }

    /// Heal mode: diagnose, restart with bounded retries, verify, alert
    /// once with the episode summary.
    async fn run_heal_episode(&mut self, snapshot: &ContainerSnapshot) {
        let mut record = IncidentRecord::open(
            &snapshot.id,
            &snapshot.name,
            snapshot.status,
            Utc::now(),
        );

        let pre = self.diagnose(snapshot).await;
        record.pre_diagnosis = pre.clone();

        // Restart-safety gate: critical services are never restarted
        // blind, and an explicit unsafe verdict blocks everything.
        let blocked_reason = match &pre {
            None if self.is_critical(&snapshot.name) => Some(
                "diagnosis unavailable for a critical service; diagnosis is required before restarting it"
                    .to_owned(),
            ),
            Some(d) if !d.restart_safe => {
                Some(format!("diagnosis reports restart unsafe: {}", d.summary))
            }
            _ => None,
        };

        if let Some(reason) = blocked_reason {
            warn!(container = %snapshot.name, %reason, "auto-heal blocked, escalating");
            record.resolution = Resolution::Failed;
            record.failed_at = Some(Utc::now());

            let payload =
                alert::escalation(&snapshot.name, &reason, pre.as_ref(), &record.dedupe_key());
            self.emit(&payload).await;
            record.alerts.failed = true;
            record.last_alert_at = Some(Utc::now());

            self.incidents.insert(snapshot.name.clone(), record);
            return;
        }

        info!(container = %snapshot.name, "attempting auto-heal");
        let result = match self.healer.heal(&snapshot.id, &snapshot.name).await {
            Ok(result) => result,
            Err(e) => {
                // Another heal holds this container; re-detect next cycle.
                warn!(container = %snapshot.name, error = %e, "heal request rejected");
                return;
            }
        };
        record.attempts = result.attempts.clone();

        // Post-heal verification: fresh snapshot, then best-effort
        // post-diagnosis, always before the resolution alert.
        let fresh = self.runtime.inspect(&snapshot.id).await.ok();
        let post_subject = fresh.as_ref().unwrap_or(snapshot);
        let post = self.diagnose(post_subject).await;
        record.post_diagnosis = post.clone();

        let verified_healthy = fresh.as_ref().is_some_and(ContainerSnapshot::is_healthy);

        if result.succeeded && verified_healthy {
            record.resolution = Resolution::Resolved;
            info!(
                container = %snapshot.name,
                attempts = result.attempts.len(),
                "incident resolved"
            );

            let payload = alert::resolved(
                &snapshot.name,
                &result,
                post.as_ref(),
                &record.dedupe_key(),
            );
            self.emit(&payload).await;
            record.alerts.resolved = true;
            record.last_alert_at = Some(Utc::now());

            self.retired.push(record);
        } else {
            record.resolution = Resolution::Failed;
            record.failed_at = Some(Utc::now());
            warn!(
                container = %snapshot.name,
                attempts = result.attempts.len(),
                "heal episode failed, manual intervention required"
            );

            let payload = alert::heal_failed(
                &snapshot.name,
                &result,
                pre.as_ref(),
                post.as_ref(),
                &record.dedupe_key(),
            );
            self.emit(&payload).await;
            record.alerts.failed = true;
            record.last_alert_at = Some(Utc::now());

            self.incidents.insert(snapshot.name.clone(), record);
        }
    }

    /// Best-effort diagnosis with a bounded timeout. Absence is a handled
    /// value: any failure or timeout yields `None`.
    async fn diagnose(&self, snapshot: &ContainerSnapshot) -> Option<DiagnosisResult> {
        let log_tail = match self
            .runtime
            .tail_logs(&snapshot.id, self.config.diagnosis.log_tail_lines)
            .await
        {
            Ok(tail) => tail,
            Err(e) => {
                debug!(container = %snapshot.name, error = %e, "log tail unavailable");
                String::new()
            }
        };

        let timeout = self.config.diagnosis_timeout();
        match tokio::time::timeout(timeout, self.diagnosis.diagnose(snapshot, &log_tail)).await {
            Ok(Ok(diagnosis)) => Some(diagnosis),
            Ok(Err(e)) => {
                warn!(container = %snapshot.name, error = %e, "diagnosis unavailable");
                None
            }
            Err(_) => {
                warn!(
                    container = %snapshot.name,
                    timeout_secs = timeout.as_secs(),
                    "diagnosis timed out"
                );
                None
            }
        }
    }

    /// Record the alert and hand it to the dispatcher. Delivery failures
    /// are logged only.
    async fn emit(&self, payload: &AlertPayload) {
        if let Err(e) = self.alert_log.record(payload) {
            warn!(error = %e, "failed to write alert log");
        }
        if let Err(e) = self.dispatcher.send(payload).await {
            warn!(container = %payload.container, error = %e, "alert delivery failed");
        }
    }

    /// Whether a container name is in the configured critical-services set.
    fn is_critical(&self, container_name: &str) -> bool {
        self.config
            .monitoring
            .critical_services
            .iter()
            .any(|s| s == container_name)
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("mode", &self.mode)
            .field("selector", &self.selector)
            .field("open_incidents", &self.incidents.len())
            .finish_non_exhaustive()
    }
}

/// The cool-down window as a chrono duration.
fn cooldown_window(config: &TriageConfig) -> chrono::Duration {
    chrono::Duration::from_std(config.cooldown()).unwrap_or(chrono::TimeDelta::MAX)
}
