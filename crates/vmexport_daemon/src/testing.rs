//! Test support: stub exporters and prebuilt managers.
//!
//! Used by the crate's own unit tests and the integration suite; kept
//! out of the public API surface of the daemon binary.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use vmexport_protocol::{
    BackendCapability, CapabilityTable, ExportError, ExportMethod, ExportPhase, ExportResult,
    Job, JobDefinition, JobProgress, JobStatus,
};

use crate::exporter::{vm_name_from_path, Exporter, ExporterRegistry};
use crate::manager::JobManager;
use crate::progress::ProgressSink;
use crate::webhook::WebhookSink;

/// Exporter stub with scriptable behavior.
pub struct MockExporter {
    pub method: ExportMethod,
    pub delay: Duration,
    pub fail_with: Option<String>,
    pub panic: bool,
}

impl MockExporter {
    /// Succeeds immediately.
    pub fn instant() -> Self {
        Self {
            method: ExportMethod::Ovftool,
            delay: Duration::ZERO,
            fail_with: None,
            panic: false,
        }
    }

    /// Sleeps on a cancellable primitive before succeeding.
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::instant()
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            fail_with: Some(message.to_string()),
            ..Self::instant()
        }
    }

    pub fn panicking() -> Self {
        Self {
            panic: true,
            ..Self::instant()
        }
    }
}

#[async_trait]
impl Exporter for MockExporter {
    fn method(&self) -> ExportMethod {
        self.method
    }

    fn validate(&self, def: &JobDefinition) -> Result<(), ExportError> {
        if def.vm_path.is_empty() {
            return Err(ExportError::InvalidDefinition("vm_path is required".into()));
        }
        if def.output_path.is_empty() {
            return Err(ExportError::InvalidDefinition(
                "output_path is required".into(),
            ));
        }
        Ok(())
    }

    async fn export(
        &self,
        ctx: CancellationToken,
        def: &JobDefinition,
        sink: &dyn ProgressSink,
    ) -> Result<ExportResult, ExportError> {
        sink.report(
            JobProgress::new(ExportPhase::Exporting)
                .with_step("transferring disks")
                .with_percent(25.0),
        );
        tokio::select! {
            _ = ctx.cancelled() => return Err(ExportError::Cancelled),
            _ = tokio::time::sleep(self.delay) => {}
        }
        if self.panic {
            panic!("mock exporter blew up");
        }
        if let Some(message) = &self.fail_with {
            return Err(ExportError::ExportFailed(message.clone()));
        }

        let vm_name = vm_name_from_path(&def.vm_path);
        sink.report(
            JobProgress::new(ExportPhase::Finalizing)
                .with_step("collecting artifacts")
                .with_files(3, Some(3))
                .with_percent(100.0),
        );
        Ok(ExportResult {
            vm_name: vm_name.clone(),
            output_path: def.output_path.clone(),
            ovf_path: format!("{}.ovf", vm_name),
            files: vec![
                format!("{}.ovf", vm_name),
                format!("{}.mf", vm_name),
                "disk1.vmdk".to_string(),
            ],
            total_bytes: 42 * 1024 * 1024,
            duration_secs: self.delay.as_secs_f64(),
        })
    }
}

/// Capability table with the given methods marked available.
pub fn available_table(methods: &[(ExportMethod, i32)]) -> CapabilityTable {
    CapabilityTable::new(
        methods
            .iter()
            .map(|(method, priority)| BackendCapability {
                method: *method,
                available: true,
                priority: *priority,
                note: None,
            })
            .collect(),
    )
}

/// Registry with a single available backend served by `make`.
pub fn mock_registry(
    method: ExportMethod,
    make: impl Fn() -> MockExporter + Send + Sync + 'static,
) -> ExporterRegistry {
    let mut registry = ExporterRegistry::new(available_table(&[(method, 20)]));
    registry.register(method, Box::new(move || Arc::new(make())));
    registry
}

/// Manager backed by a single mock ovftool backend.
pub fn mock_manager(make: impl Fn() -> MockExporter + Send + Sync + 'static) -> JobManager {
    JobManager::new(mock_registry(ExportMethod::Ovftool, make))
}

/// Poll until the job reaches `status` or a short deadline expires.
pub async fn wait_for_status(manager: &JobManager, id: &str, status: JobStatus) -> Job {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let job = manager.get_job(id).expect("job exists");
        if job.status == status {
            return job;
        }
        assert!(
            !(job.status.is_terminal() && status != job.status),
            "job {} settled at {} while waiting for {}",
            id,
            job.status,
            status
        );
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for job {} to reach {}",
            id,
            status
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Webhook sink that records event names in order.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<String>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn record(&self, event: &str, job: &Job) {
        // Redaction is part of the sink contract.
        if let Some(creds) = &job.definition.credentials {
            assert!(
                creds.password.is_empty() || creds.password == vmexport_protocol::REDACTED,
                "webhook saw an unredacted password"
            );
        }
        self.events.lock().unwrap().push(event.to_string());
    }
}

impl WebhookSink for RecordingSink {
    fn job_created(&self, job: &Job) {
        self.record("job.created", job);
    }
    fn job_started(&self, job: &Job) {
        self.record("job.started", job);
    }
    fn job_completed(&self, job: &Job) {
        self.record("job.completed", job);
    }
    fn job_failed(&self, job: &Job) {
        self.record("job.failed", job);
    }
    fn job_cancelled(&self, job: &Job) {
        self.record("job.cancelled", job);
    }
    fn job_progress(&self, job: &Job) {
        self.record("job.progress", job);
    }
}
