//! Job lifecycle engine.
//!
//! The manager owns the registry, spawns one worker task per accepted
//! job, relays backend progress into the registry, and orchestrates
//! cancellation and the bounded shutdown drain. All status writes go
//! through the registry guard; a worker's terminal write is suppressed
//! when an API cancel got there first.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

use vmexport_protocol::{
    defaults, CancelResponse, CapabilityTable, DaemonStatus, ExportError, ExportMethod,
    ExportPhase, ExportResult, Job, JobDefinition, JobProgress, JobStatus, SubmitResponse,
};

use crate::exporter::ExporterRegistry;
use crate::progress::ProgressSink;
use crate::registry::JobRegistry;
use crate::webhook::WebhookSink;

struct ManagerInner {
    registry: JobRegistry,
    exporters: ExporterRegistry,
    webhook: OnceLock<Arc<dyn WebhookSink>>,
    /// Per-job cancellation tokens, removed when the worker exits.
    tokens: Mutex<HashMap<String, CancellationToken>>,
    /// Root context; shutdown cancels every derived worker token.
    root: CancellationToken,
    tracker: TaskTracker,
    started_at: Instant,
}

impl ManagerInner {
    fn tokens(&self) -> std::sync::MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.tokens.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, f: impl FnOnce(&dyn WebhookSink)) {
        if let Some(sink) = self.webhook.get() {
            f(sink.as_ref());
        }
    }
}

#[derive(Clone)]
pub struct JobManager {
    inner: Arc<ManagerInner>,
}

impl JobManager {
    pub fn new(exporters: ExporterRegistry) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                registry: JobRegistry::new(),
                exporters,
                webhook: OnceLock::new(),
                tokens: Mutex::new(HashMap::new()),
                root: CancellationToken::new(),
                tracker: TaskTracker::new(),
                started_at: Instant::now(),
            }),
        }
    }

    /// Attach the optional webhook sink. Effective only for the first
    /// call; meant to be wired once before traffic.
    pub fn set_webhook_sink(&self, sink: Arc<dyn WebhookSink>) {
        if self.inner.webhook.set(sink).is_err() {
            warn!("webhook sink already set, ignoring");
        }
    }

    pub fn capabilities(&self) -> &CapabilityTable {
        self.inner.exporters.capabilities()
    }

    // ========================================================================
    // Submission
    // ========================================================================

    /// Accept one job: assign id and creation stamp, insert as
    /// pending, then launch its worker. Errors after insertion are
    /// recorded on the job, never raised here.
    pub fn submit(&self, mut def: JobDefinition) -> Result<String, ExportError> {
        if def.id.is_empty() {
            def.id = Uuid::new_v4().to_string();
        }
        if def.created_at.is_none() {
            def.created_at = Some(Utc::now());
        }
        let job = Job::new(def);
        let id = job.id().to_string();
        self.inner.registry.insert(job.clone())?;
        info!(job_id = %id, vm_path = %job.definition.vm_path, "job accepted");
        self.inner.notify(|s| s.job_created(&job.redacted()));

        let inner = Arc::clone(&self.inner);
        let job_id = id.clone();
        self.inner.tracker.spawn(async move {
            run_job(inner, job_id).await;
        });
        Ok(id)
    }

    /// Submit a batch; per-item failures do not abort the rest.
    pub fn submit_batch(&self, defs: Vec<JobDefinition>) -> SubmitResponse {
        let mut response = SubmitResponse::default();
        for def in defs {
            match self.submit(def) {
                Ok(id) => {
                    response.accepted += 1;
                    response.job_ids.push(id);
                }
                Err(err) => {
                    response.rejected += 1;
                    response.errors.push(err.to_string());
                }
            }
        }
        response
    }

    // ========================================================================
    // Cancellation
    // ========================================================================

    /// Mark the job cancelled and fire its token. The status flips
    /// synchronously; the worker notices the token at its next
    /// cancellation point and its late error is suppressed.
    pub fn cancel(&self, id: &str) -> Result<(), ExportError> {
        let snapshot = self.inner.registry.update(id, |job| {
            if job.status.is_terminal() {
                return Err(ExportError::NotCancellable(job.status));
            }
            job.cancel();
            Ok(job.clone())
        })??;

        if let Some(token) = self.inner.tokens().get(id) {
            token.cancel();
        }
        info!(job_id = %id, "job cancelled");
        self.inner.notify(|s| s.job_cancelled(&snapshot.redacted()));
        Ok(())
    }

    pub fn cancel_batch(&self, ids: &[String]) -> CancelResponse {
        let mut response = CancelResponse::default();
        for id in ids {
            match self.cancel(id) {
                Ok(()) => response.cancelled.push(id.clone()),
                Err(err) => {
                    response.failed.push(id.clone());
                    response.errors.insert(id.clone(), err.to_string());
                }
            }
        }
        response
    }

    // ========================================================================
    // Observability
    // ========================================================================

    /// Independent snapshot of one job.
    pub fn get_job(&self, id: &str) -> Result<Job, ExportError> {
        self.inner.registry.get(id)
    }

    pub fn list_jobs(&self, statuses: &[JobStatus], limit: usize) -> Vec<Job> {
        self.inner.registry.list(statuses, limit)
    }

    /// Snapshots for the given ids; unknown ids are skipped.
    pub fn jobs_by_ids(&self, ids: &[String]) -> Vec<Job> {
        self.inner.registry.get_many(ids)
    }

    pub fn status(&self) -> DaemonStatus {
        let counts = self.inner.registry.counts();
        DaemonStatus {
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime: format_uptime(self.inner.started_at.elapsed()),
            total_jobs: counts.total,
            pending: counts.pending,
            running: counts.running,
            completed: counts.completed,
            failed: counts.failed,
            cancelled: counts.cancelled,
            timestamp: Utc::now(),
        }
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Cancel every worker and wait, bounded, for the drain. Returns
    /// true when all workers exited within the timeout.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        info!("cancelling outstanding jobs");
        self.inner.root.cancel();
        self.inner.tracker.close();
        match tokio::time::timeout(timeout, self.inner.tracker.wait()).await {
            Ok(()) => {
                info!("all export workers drained");
                true
            }
            Err(_) => {
                warn!(?timeout, "drain timed out with workers still running");
                false
            }
        }
    }
}

impl Default for JobManager {
    fn default() -> Self {
        Self::new(ExporterRegistry::new(crate::capability::detect_capabilities()))
    }
}

// ============================================================================
// Worker
// ============================================================================

async fn run_job(inner: Arc<ManagerInner>, job_id: String) {
    let token = inner.root.child_token();
    inner.tokens().insert(job_id.clone(), token.clone());

    let started = inner.registry.update(&job_id, |job| {
        if !job.start() {
            return false;
        }
        job.set_progress(JobProgress::new(ExportPhase::Connecting));
        true
    });
    if !matches!(started, Ok(true)) {
        // Cancelled before the worker ran; nothing to do.
        inner.tokens().remove(&job_id);
        return;
    }
    if let Ok(snapshot) = inner.registry.get(&job_id) {
        inner.notify(|s| s.job_started(&snapshot.redacted()));
    }

    let outcome = std::panic::AssertUnwindSafe(execute_export(&inner, &job_id, token))
        .catch_unwind()
        .await;
    match outcome {
        Ok(Ok(result)) => finish_completed(&inner, &job_id, result),
        Ok(Err(err)) => finish_failed(&inner, &job_id, err),
        Err(_) => finish_failed(
            &inner,
            &job_id,
            ExportError::ExportFailed("export worker panicked".into()),
        ),
    }
    inner.tokens().remove(&job_id);
}

async fn execute_export(
    inner: &Arc<ManagerInner>,
    job_id: &str,
    token: CancellationToken,
) -> Result<ExportResult, ExportError> {
    // Normalize the stored definition once, then work on a snapshot.
    let def = inner.registry.update(job_id, |job| {
        job.definition.normalize();
        job.definition.clone()
    })?;

    let method = select_method(inner, &def)?;
    let exporter = inner.exporters.create(method)?;
    exporter.validate(&def)?;

    let sink = RegistrySink {
        inner: Arc::clone(inner),
        job_id: job_id.to_string(),
        method,
    };
    sink.report(JobProgress::new(ExportPhase::Connecting).with_step("connecting to hypervisor"));
    exporter.export(token, &def, &sink).await
}

fn select_method(inner: &ManagerInner, def: &JobDefinition) -> Result<ExportMethod, ExportError> {
    if let Some(requested) = def.requested_method() {
        if inner.exporters.is_available(requested) {
            return Ok(requested);
        }
    }
    let fallback = inner.exporters.default_method().ok_or_else(|| {
        ExportError::Internal("no export backend available on this host".into())
    })?;
    if !def.export_method.is_empty() {
        warn!(
            job_id = %def.id,
            requested = %def.export_method,
            fallback = %fallback,
            "requested export backend unavailable, using default"
        );
    }
    Ok(fallback)
}

fn finish_completed(inner: &Arc<ManagerInner>, job_id: &str, result: ExportResult) {
    let applied = inner
        .registry
        .update(job_id, |job| job.complete(result))
        .unwrap_or(false);
    if !applied {
        debug!(job_id, "completion suppressed, job already terminal");
        return;
    }
    info!(job_id, "export completed");
    if let Ok(snapshot) = inner.registry.get(job_id) {
        inner.notify(|s| s.job_completed(&snapshot.redacted()));
    }
}

fn finish_failed(inner: &Arc<ManagerInner>, job_id: &str, err: ExportError) {
    let message = match &err {
        ExportError::Cancelled => defaults::CANCELLED_BY_USER_MESSAGE.to_string(),
        other => other.to_string(),
    };
    let applied = inner
        .registry
        .update(job_id, |job| job.fail(message.clone()))
        .unwrap_or(false);
    if !applied {
        // Normal when the API cancelled the job and the backend then
        // aborted with an error.
        debug!(job_id, error = %message, "failure suppressed, job already terminal");
        return;
    }
    warn!(job_id, error = %message, "export failed");
    if let Ok(snapshot) = inner.registry.get(job_id) {
        inner.notify(|s| s.job_failed(&snapshot.redacted()));
    }
}

/// Sink that copies each report into the registry under the guard and
/// forwards a best-effort webhook notification.
struct RegistrySink {
    inner: Arc<ManagerInner>,
    job_id: String,
    method: ExportMethod,
}

impl ProgressSink for RegistrySink {
    fn report(&self, mut progress: JobProgress) {
        progress.method = Some(self.method);
        let applied = self.inner.registry.update(&self.job_id, |job| {
            if job.status != JobStatus::Running {
                return false;
            }
            job.set_progress(progress);
            true
        });
        if matches!(applied, Ok(true)) {
            if let Ok(snapshot) = self.inner.registry.get(&self.job_id) {
                self.inner.notify(|s| s.job_progress(&snapshot.redacted()));
            }
        }
    }
}

fn format_uptime(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let (days, secs) = (secs / 86_400, secs % 86_400);
    let (hours, secs) = (secs / 3_600, secs % 3_600);
    let (mins, secs) = (secs / 60, secs % 60);
    let mut out = String::new();
    if days > 0 {
        out.push_str(&format!("{}d ", days));
    }
    if hours > 0 || days > 0 {
        out.push_str(&format!("{}h ", hours));
    }
    if mins > 0 || hours > 0 || days > 0 {
        out.push_str(&format!("{}m ", mins));
    }
    out.push_str(&format!("{}s", secs));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{mock_manager, wait_for_status, MockExporter};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn submit_runs_to_completion() {
        let manager = mock_manager(MockExporter::instant);

        let id = manager
            .submit(JobDefinition {
                vm_path: "/dc/vm/A".to_string(),
                output_path: "/tmp/A".to_string(),
                ..JobDefinition::default()
            })
            .unwrap();

        // Immediately visible, not yet terminal.
        let early = manager.get_job(&id).unwrap();
        assert!(matches!(
            early.status,
            JobStatus::Pending | JobStatus::Running | JobStatus::Completed
        ));

        let job = wait_for_status(&manager, &id, JobStatus::Completed).await;
        let result = job.result.expect("completed job carries a result");
        assert_eq!(result.files, vec!["A.ovf", "A.mf", "disk1.vmdk"]);
        assert!(result.total_bytes > 0);
        assert!(job.started_at.is_some());
        assert!(job.completed_at.is_some());
        assert!(job.error.is_none());
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected() {
        let manager = mock_manager(MockExporter::instant);
        let def = JobDefinition {
            id: "dup".to_string(),
            vm_path: "x".to_string(),
            output_path: "/out".to_string(),
            ..JobDefinition::default()
        };
        manager.submit(def.clone()).unwrap();
        let err = manager.submit(def).unwrap_err();
        assert!(matches!(err, ExportError::DuplicateId(id) if id == "dup"));

        let response = manager.submit_batch(vec![JobDefinition {
            id: "dup".to_string(),
            vm_path: "x".to_string(),
            output_path: "/out".to_string(),
            ..JobDefinition::default()
        }]);
        assert_eq!(response.accepted, 0);
        assert_eq!(response.rejected, 1);
        assert!(response.errors[0].contains("already exists"));
        assert_eq!(manager.jobs_by_ids(&["dup".to_string()]).len(), 1);
    }

    #[tokio::test]
    async fn cancel_running_job() {
        let manager = mock_manager(|| MockExporter::slow(Duration::from_secs(30)));
        let id = manager
            .submit(JobDefinition {
                vm_path: "/dc/vm/A".to_string(),
                output_path: "/tmp/A".to_string(),
                ..JobDefinition::default()
            })
            .unwrap();
        wait_for_status(&manager, &id, JobStatus::Running).await;

        manager.cancel(&id).unwrap();
        let job = manager.get_job(&id).unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.completed_at.is_some());

        // The worker observes the token and must not resurrect the job.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let job = manager.get_job(&id).unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.result.is_none());
    }

    #[tokio::test]
    async fn cancel_terminal_job_fails() {
        let manager = mock_manager(MockExporter::instant);
        let id = manager
            .submit(JobDefinition {
                vm_path: "/dc/vm/A".to_string(),
                output_path: "/tmp/A".to_string(),
                ..JobDefinition::default()
            })
            .unwrap();
        wait_for_status(&manager, &id, JobStatus::Completed).await;

        let err = manager.cancel(&id).unwrap_err();
        assert_eq!(
            err.to_string(),
            "job cannot be cancelled (status: completed)"
        );
        assert_eq!(manager.get_job(&id).unwrap().status, JobStatus::Completed);

        assert!(matches!(
            manager.cancel("missing"),
            Err(ExportError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn unavailable_backend_downgrades_to_default() {
        let manager = mock_manager(MockExporter::instant);
        let id = manager
            .submit(JobDefinition {
                vm_path: "/dc/vm/A".to_string(),
                output_path: "/tmp/A".to_string(),
                export_method: "nonexistent".to_string(),
                ..JobDefinition::default()
            })
            .unwrap();

        let job = wait_for_status(&manager, &id, JobStatus::Completed).await;
        let progress = job.progress.expect("progress recorded");
        assert_eq!(progress.method, Some(ExportMethod::Ovftool));
    }

    #[tokio::test]
    async fn failing_backend_marks_job_failed() {
        let manager = mock_manager(|| MockExporter::failing("connection refused"));
        let id = manager
            .submit(JobDefinition {
                vm_path: "/dc/vm/A".to_string(),
                output_path: "/tmp/A".to_string(),
                ..JobDefinition::default()
            })
            .unwrap();
        let job = wait_for_status(&manager, &id, JobStatus::Failed).await;
        assert!(job.error.unwrap().contains("connection refused"));
        assert!(job.result.is_none());
    }

    #[tokio::test]
    async fn panicking_backend_marks_job_failed() {
        let manager = mock_manager(MockExporter::panicking);
        let id = manager
            .submit(JobDefinition {
                vm_path: "/dc/vm/A".to_string(),
                output_path: "/tmp/A".to_string(),
                ..JobDefinition::default()
            })
            .unwrap();
        let job = wait_for_status(&manager, &id, JobStatus::Failed).await;
        assert!(job.error.unwrap().contains("panicked"));
    }

    #[tokio::test]
    async fn invalid_definition_fails_the_job() {
        let manager = mock_manager(MockExporter::instant);
        let id = manager
            .submit(JobDefinition {
                vm_path: String::new(),
                output_path: "/tmp/A".to_string(),
                ..JobDefinition::default()
            })
            .unwrap();
        let job = wait_for_status(&manager, &id, JobStatus::Failed).await;
        assert!(job.error.unwrap().contains("vm_path"));
    }

    #[tokio::test]
    async fn batch_yields_distinct_ids() {
        let manager = mock_manager(MockExporter::instant);
        let defs: Vec<_> = (0..5)
            .map(|i| JobDefinition {
                vm_path: format!("/dc/vm/vm-{}", i),
                output_path: format!("/tmp/vm-{}", i),
                ..JobDefinition::default()
            })
            .collect();
        let response = manager.submit_batch(defs);
        assert_eq!(response.accepted, 5);

        let mut ids = response.job_ids.clone();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 5);
        assert_eq!(manager.jobs_by_ids(&response.job_ids).len(), 5);
    }

    #[tokio::test]
    async fn shutdown_drains_and_terminates_jobs() {
        let manager = mock_manager(|| MockExporter::slow(Duration::from_secs(60)));
        let mut ids = Vec::new();
        for i in 0..3 {
            ids.push(
                manager
                    .submit(JobDefinition {
                        vm_path: format!("/dc/vm/vm-{}", i),
                        output_path: format!("/tmp/vm-{}", i),
                        ..JobDefinition::default()
                    })
                    .unwrap(),
            );
        }
        for id in &ids {
            wait_for_status(&manager, id, JobStatus::Running).await;
        }

        let clean = manager.shutdown(Duration::from_secs(5)).await;
        assert!(clean);
        for id in &ids {
            let job = manager.get_job(id).unwrap();
            assert!(
                matches!(job.status, JobStatus::Failed | JobStatus::Cancelled),
                "job {} ended as {}",
                id,
                job.status
            );
        }
    }

    #[tokio::test]
    async fn progress_last_write_wins() {
        let manager = mock_manager(MockExporter::instant);
        let id = manager
            .submit(JobDefinition {
                vm_path: "/dc/vm/A".to_string(),
                output_path: "/tmp/A".to_string(),
                ..JobDefinition::default()
            })
            .unwrap();
        let job = wait_for_status(&manager, &id, JobStatus::Completed).await;
        // The mock's final report is the 100% one.
        assert_eq!(job.progress.unwrap().percent, 100.0);
    }

    #[tokio::test]
    async fn normalization_persists_to_stored_definition() {
        let manager = mock_manager(MockExporter::instant);
        let id = manager
            .submit(JobDefinition {
                vm_path: "x".to_string(),
                output_path: "/o".to_string(),
                vcenter_url: "v.example.com".to_string(),
                username: "u".to_string(),
                password: "p".to_string(),
                insecure: true,
                ..JobDefinition::default()
            })
            .unwrap();
        let job = wait_for_status(&manager, &id, JobStatus::Completed).await;

        let creds = job.definition.credentials.expect("normalized credentials");
        assert_eq!(creds.server, "v.example.com");
        assert_eq!(creds.username, "u");
        assert_eq!(creds.password, "p");
        assert!(creds.insecure);
        assert_eq!(job.definition.format, "ovf");
    }

    #[tokio::test]
    async fn webhook_sees_lifecycle_events() {
        use crate::testing::RecordingSink;

        let manager = mock_manager(MockExporter::instant);
        let sink = Arc::new(RecordingSink::default());
        manager.set_webhook_sink(sink.clone());

        let id = manager
            .submit(JobDefinition {
                vm_path: "/dc/vm/A".to_string(),
                output_path: "/tmp/A".to_string(),
                ..JobDefinition::default()
            })
            .unwrap();
        wait_for_status(&manager, &id, JobStatus::Completed).await;

        let events = sink.events();
        assert_eq!(events.first().map(String::as_str), Some("job.created"));
        assert!(events.contains(&"job.started".to_string()));
        assert_eq!(events.last().map(String::as_str), Some("job.completed"));
    }

    #[test]
    fn uptime_formatting() {
        assert_eq!(format_uptime(Duration::from_secs(5)), "5s");
        assert_eq!(format_uptime(Duration::from_secs(125)), "2m 5s");
        assert_eq!(format_uptime(Duration::from_secs(3_725)), "1h 2m 5s");
        assert_eq!(format_uptime(Duration::from_secs(90_061)), "1d 1h 1m 1s");
    }

    #[tokio::test]
    async fn status_aggregates_counts() {
        let manager = mock_manager(MockExporter::instant);
        let id = manager
            .submit(JobDefinition {
                vm_path: "/dc/vm/A".to_string(),
                output_path: "/tmp/A".to_string(),
                ..JobDefinition::default()
            })
            .unwrap();
        wait_for_status(&manager, &id, JobStatus::Completed).await;

        let status = manager.status();
        assert_eq!(status.total_jobs, 1);
        assert_eq!(status.completed, 1);
        assert!(!status.version.is_empty());
        assert!(status.uptime.ends_with('s'));
    }

    // Guard against double webhook wiring racing many workers.
    #[tokio::test]
    async fn webhook_sink_set_once() {
        #[derive(Default)]
        struct CountingSink(AtomicUsize);
        impl crate::webhook::WebhookSink for CountingSink {
            fn job_created(&self, _job: &Job) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
            fn job_started(&self, _job: &Job) {}
            fn job_completed(&self, _job: &Job) {}
            fn job_failed(&self, _job: &Job) {}
            fn job_cancelled(&self, _job: &Job) {}
            fn job_progress(&self, _job: &Job) {}
        }

        let manager = mock_manager(MockExporter::instant);
        let first = Arc::new(CountingSink::default());
        manager.set_webhook_sink(first.clone());
        manager.set_webhook_sink(Arc::new(CountingSink::default()));

        manager
            .submit(JobDefinition {
                vm_path: "/dc/vm/A".to_string(),
                output_path: "/tmp/A".to_string(),
                ..JobDefinition::default()
            })
            .unwrap();
        assert_eq!(first.0.load(Ordering::SeqCst), 1);
    }
}
