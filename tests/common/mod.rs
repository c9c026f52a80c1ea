//! Shared stub collaborators for integration tests.
//!
//! In-memory implementations of the runtime, diagnosis, and dispatcher
//! traits, with call recording so tests can assert counts and ordering.

use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use triage::alert::{AlertDispatcher, AlertError, AlertLog, AlertPayload};
use triage::config::TriageConfig;
use triage::diagnosis::{
    DiagnosisConfidence, DiagnosisError, DiagnosisResult, DiagnosisService, RootCause,
};
use triage::healer::{Healer, RetryPolicy};
use triage::orchestrator::{Mode, Orchestrator};
use triage::runtime::{
    ContainerRuntime, ContainerSnapshot, ContainerStatus, LabelSelector, RuntimeError,
};

/// Shared ordered trace of collaborator calls.
pub type EventTrace = Arc<Mutex<Vec<String>>>;

pub fn new_trace() -> EventTrace {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn push_event(trace: &EventTrace, event: impl Into<String>) {
    trace.lock().expect("trace lock").push(event.into());
}

/// Build a snapshot for a container in the managed fleet.
pub fn snapshot(name: &str, status: ContainerStatus, exit_code: Option<i64>) -> ContainerSnapshot {
    let mut labels = HashMap::new();
    labels.insert("environment".to_owned(), "production".to_owned());
    ContainerSnapshot {
        id: format!("id-{name}"),
        name: name.to_owned(),
        labels,
        status,
        exit_code,
        image: "example/app:latest".to_owned(),
        last_transition: None,
        failing_health_check: false,
    }
}

/// A fixed diagnosis result for stubbed backends.
pub fn fixed_diagnosis(restart_safe: bool) -> DiagnosisResult {
    DiagnosisResult {
        root_cause: RootCause::AppCrash,
        summary: "process exited after an unhandled error".to_owned(),
        restart_safe,
        confidence: DiagnosisConfidence::High,
    }
}

/// Config tuned for fast tests: one-second timeouts, tight polling.
pub fn test_config() -> TriageConfig {
    let mut config = TriageConfig::default();
    config.healing.max_restart_attempts = 3;
    config.healing.restart_timeout_secs = 1;
    config.healing.readiness_poll_millis = 10;
    config.diagnosis.timeout_secs = 1;
    config
}

// ---------------------------------------------------------------------------
// Stub runtime
// ---------------------------------------------------------------------------

/// In-memory container runtime with scriptable restart behavior.
pub struct StubRuntime {
    containers: Mutex<HashMap<String, ContainerSnapshot>>,
    /// Number of restart calls (per container) before the container
    /// reaches `running`. `u32::MAX` means restarts never help.
    restarts_until_running: u32,
    restart_counts: Mutex<HashMap<String, u32>>,
    restart_calls: AtomicU32,
    unavailable: AtomicBool,
    trace: EventTrace,
}

impl StubRuntime {
    pub fn new(restarts_until_running: u32, trace: EventTrace) -> Arc<Self> {
        Arc::new(Self {
            containers: Mutex::new(HashMap::new()),
            restarts_until_running,
            restart_counts: Mutex::new(HashMap::new()),
            restart_calls: AtomicU32::new(0),
            unavailable: AtomicBool::new(false),
            trace,
        })
    }

    pub fn insert(&self, snapshot: ContainerSnapshot) {
        self.containers
            .lock()
            .expect("containers lock")
            .insert(snapshot.id.clone(), snapshot);
    }

    pub fn set_status(&self, id: &str, status: ContainerStatus) {
        if let Some(snapshot) = self.containers.lock().expect("containers lock").get_mut(id) {
            snapshot.status = status;
        }
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn restart_calls(&self) -> u32 {
        self.restart_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContainerRuntime for StubRuntime {
    async fn list(&self, _selector: &LabelSelector) -> Result<Vec<ContainerSnapshot>, RuntimeError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RuntimeError::Unavailable("stub daemon down".to_owned()));
        }
        let mut snapshots: Vec<ContainerSnapshot> = self
            .containers
            .lock()
            .expect("containers lock")
            .values()
            .cloned()
            .collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(snapshots)
    }

    async fn inspect(&self, id: &str) -> Result<ContainerSnapshot, RuntimeError> {
        self.containers
            .lock()
            .expect("containers lock")
            .get(id)
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound(id.to_owned()))
    }

    async fn restart(&self, id: &str) -> Result<(), RuntimeError> {
        push_event(&self.trace, format!("restart:{id}"));
        self.restart_calls.fetch_add(1, Ordering::SeqCst);

        let count = {
            let mut counts = self.restart_counts.lock().expect("counts lock");
            let entry = counts.entry(id.to_owned()).or_insert(0);
            *entry = entry.saturating_add(1);
            *entry
        };
        if count >= self.restarts_until_running {
            self.set_status(id, ContainerStatus::Running);
        }
        Ok(())
    }

    async fn tail_logs(&self, _id: &str, _lines: u32) -> Result<String, RuntimeError> {
        Ok("2024-06-01T12:00:00Z error: connection refused\n".to_owned())
    }
}

/// Runtime whose restart command always errors.
pub struct BrokenRestartRuntime {
    inner: Arc<StubRuntime>,
}

impl BrokenRestartRuntime {
    pub fn new(inner: Arc<StubRuntime>) -> Arc<Self> {
        Arc::new(Self { inner })
    }
}

#[async_trait]
impl ContainerRuntime for BrokenRestartRuntime {
    async fn list(&self, selector: &LabelSelector) -> Result<Vec<ContainerSnapshot>, RuntimeError> {
        self.inner.list(selector).await
    }

    async fn inspect(&self, id: &str) -> Result<ContainerSnapshot, RuntimeError> {
        self.inner.inspect(id).await
    }

    async fn restart(&self, _id: &str) -> Result<(), RuntimeError> {
        Err(RuntimeError::Api("restart refused by daemon".to_owned()))
    }

    async fn tail_logs(&self, id: &str, lines: u32) -> Result<String, RuntimeError> {
        self.inner.tail_logs(id, lines).await
    }
}

// ---------------------------------------------------------------------------
// Stub diagnosis
// ---------------------------------------------------------------------------

/// How the stub diagnosis backend behaves.
#[derive(Clone)]
pub enum DiagnosisBehavior {
    /// Always return this result.
    Fixed(DiagnosisResult),
    /// Always report the backend as unavailable.
    Unavailable,
    /// Never answer; the orchestrator's timeout must fire.
    Hang,
}

pub struct StubDiagnosis {
    behavior: DiagnosisBehavior,
    calls: AtomicU32,
    trace: EventTrace,
}

impl StubDiagnosis {
    pub fn new(behavior: DiagnosisBehavior, trace: EventTrace) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            calls: AtomicU32::new(0),
            trace,
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DiagnosisService for StubDiagnosis {
    async fn diagnose(
        &self,
        snapshot: &ContainerSnapshot,
        _log_tail: &str,
    ) -> Result<DiagnosisResult, DiagnosisError> {
        push_event(&self.trace, format!("diagnose:{}", snapshot.name));
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.behavior {
            DiagnosisBehavior::Fixed(result) => Ok(result.clone()),
            DiagnosisBehavior::Unavailable => {
                Err(DiagnosisError::Unavailable("stub backend down".to_owned()))
            }
            DiagnosisBehavior::Hang => {
                tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
                Err(DiagnosisError::Unavailable("unreachable".to_owned()))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Collector dispatcher
// ---------------------------------------------------------------------------

/// Dispatcher that collects payloads in memory.
pub struct CollectorDispatcher {
    sent: Mutex<Vec<AlertPayload>>,
    fail_delivery: AtomicBool,
    trace: EventTrace,
}

impl CollectorDispatcher {
    pub fn new(trace: EventTrace) -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            fail_delivery: AtomicBool::new(false),
            trace,
        })
    }

    pub fn set_fail_delivery(&self, fail: bool) {
        self.fail_delivery.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<AlertPayload> {
        self.sent.lock().expect("sent lock").clone()
    }
}

#[async_trait]
impl AlertDispatcher for CollectorDispatcher {
    async fn send(&self, payload: &AlertPayload) -> Result<(), AlertError> {
        push_event(&self.trace, format!("alert:{}", payload.container));
        if self.fail_delivery.load(Ordering::SeqCst) {
            return Err(AlertError::Delivery("stub transport down".to_owned()));
        }
        self.sent.lock().expect("sent lock").push(payload.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Shared alert log buffer
// ---------------------------------------------------------------------------

/// `Write` implementation over a shared buffer so tests can read back the
/// alert log.
#[derive(Clone, Default)]
pub struct SharedBuf(pub Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().expect("buffer lock").extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl SharedBuf {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().expect("buffer lock")).into_owned()
    }
}

// ---------------------------------------------------------------------------
// Orchestrator assembly
// ---------------------------------------------------------------------------

/// Wire an orchestrator over stub collaborators.
pub fn build_orchestrator(
    config: TriageConfig,
    mode: Mode,
    runtime: Arc<dyn ContainerRuntime>,
    diagnosis: Arc<StubDiagnosis>,
    dispatcher: Arc<CollectorDispatcher>,
    log_buf: &SharedBuf,
) -> Orchestrator {
    let policy = RetryPolicy::new(
        config.healing.max_restart_attempts,
        config.healing.restart_timeout_secs,
        config.healing.readiness_poll_millis,
    );
    let healer = Healer::new(Arc::clone(&runtime), policy);
    let alert_log = AlertLog::from_writer(Box::new(log_buf.clone()));

    Orchestrator::new(config, mode, runtime, diagnosis, healer, dispatcher, alert_log)
        .expect("orchestrator should build")
}
