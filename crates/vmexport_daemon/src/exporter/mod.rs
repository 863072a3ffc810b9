//! Exporter backends.
//!
//! An [`Exporter`] knows how to pull one VM out of the hypervisor and
//! write OVF/VMDK artifacts to disk. The daemon addresses backends
//! through this narrow trait so the transfer machinery can be swapped
//! per host capability (and mocked in tests). Backends must honor the
//! cancellation token, report through the progress sink, and either
//! return a complete result or fail cleanly.

mod govc;
mod ovftool;
mod vddk;

pub use govc::GovcExporter;
pub use ovftool::OvftoolExporter;
pub use vddk::VddkExporter;

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use walkdir::WalkDir;

use vmexport_protocol::{
    defaults, CapabilityTable, ExportError, ExportMethod, ExportResult, JobDefinition,
    VsphereCredentials,
};

use crate::progress::ProgressSink;

#[async_trait]
pub trait Exporter: Send + Sync {
    fn method(&self) -> ExportMethod;

    /// Static checks before launch: fields this backend requires and
    /// value ranges. Must not touch the network.
    fn validate(&self, def: &JobDefinition) -> Result<(), ExportError>;

    /// Perform the transfer. Must honor cancellation on `ctx`, report
    /// progress through `sink` at its own cadence, and either produce
    /// a complete result or fail without leaving undocumented partial
    /// state behind.
    async fn export(
        &self,
        ctx: CancellationToken,
        def: &JobDefinition,
        sink: &dyn ProgressSink,
    ) -> Result<ExportResult, ExportError>;
}

pub type ExporterFactory = Box<dyn Fn() -> Arc<dyn Exporter> + Send + Sync>;

/// Maps backend identifiers to factories, gated by the capability
/// table the detector produced at startup.
pub struct ExporterRegistry {
    capabilities: CapabilityTable,
    factories: HashMap<ExportMethod, ExporterFactory>,
}

impl ExporterRegistry {
    pub fn new(capabilities: CapabilityTable) -> Self {
        let mut registry = Self {
            capabilities,
            factories: HashMap::new(),
        };
        registry.register(ExportMethod::Vddk, Box::new(|| Arc::new(VddkExporter::new())));
        registry.register(
            ExportMethod::Ovftool,
            Box::new(|| Arc::new(OvftoolExporter::new())),
        );
        registry.register(ExportMethod::Govc, Box::new(|| Arc::new(GovcExporter::new())));
        registry
    }

    /// Replace the factory for a backend. Tests use this to install
    /// stub exporters behind real capability entries.
    pub fn register(&mut self, method: ExportMethod, factory: ExporterFactory) {
        self.factories.insert(method, factory);
    }

    pub fn capabilities(&self) -> &CapabilityTable {
        &self.capabilities
    }

    pub fn is_available(&self, method: ExportMethod) -> bool {
        self.capabilities.is_available(method) && self.factories.contains_key(&method)
    }

    /// Highest-priority available backend.
    pub fn default_method(&self) -> Option<ExportMethod> {
        self.capabilities
            .default_method()
            .filter(|m| self.factories.contains_key(m))
    }

    pub fn create(&self, method: ExportMethod) -> Result<Arc<dyn Exporter>, ExportError> {
        if !self.is_available(method) {
            return Err(ExportError::BackendUnavailable(method));
        }
        let factory = self
            .factories
            .get(&method)
            .ok_or(ExportError::BackendUnavailable(method))?;
        Ok(factory())
    }
}

// ============================================================================
// Shared backend plumbing
// ============================================================================

/// Checks every backend performs before launch.
pub(crate) fn validate_common(def: &JobDefinition) -> Result<(), ExportError> {
    if def.vm_path.is_empty() {
        return Err(ExportError::InvalidDefinition("vm_path is required".into()));
    }
    if def.output_path.is_empty() {
        return Err(ExportError::InvalidDefinition(
            "output_path is required".into(),
        ));
    }
    let parallel = def.options.parallel_downloads;
    if parallel == 0 || parallel > defaults::MAX_PARALLEL_DOWNLOADS {
        return Err(ExportError::InvalidDefinition(format!(
            "parallel_downloads must be between 1 and {}",
            defaults::MAX_PARALLEL_DOWNLOADS
        )));
    }
    match def.format.as_str() {
        "" | "ovf" | "ova" => Ok(()),
        other => Err(ExportError::InvalidDefinition(format!(
            "unsupported format: {}",
            other
        ))),
    }
}

pub(crate) fn require_credentials(
    def: &JobDefinition,
) -> Result<&VsphereCredentials, ExportError> {
    let creds = def
        .credentials
        .as_ref()
        .ok_or_else(|| ExportError::InvalidDefinition("credentials are required".into()))?;
    if creds.username.is_empty() {
        return Err(ExportError::InvalidDefinition(
            "credentials.username is required".into(),
        ));
    }
    Ok(creds)
}

/// Name the artifacts get labelled with when the hypervisor does not
/// hand one back: the last segment of the inventory path.
pub(crate) fn vm_name_from_path(vm_path: &str) -> String {
    vm_path
        .rsplit('/')
        .find(|s| !s.is_empty())
        .unwrap_or(vm_path)
        .to_string()
}

/// Spawn a child process, stream its output into the per-job log file
/// and `on_line`, and wait for exit. Kills the child and returns
/// `Cancelled` when the token fires. Never logs the argv (it can
/// embed credentials).
pub(crate) async fn run_child(
    mut cmd: Command,
    program: &str,
    ctx: &CancellationToken,
    job_id: &str,
    mut on_line: impl FnMut(&str) + Send,
) -> Result<(), ExportError> {
    let mut child = cmd
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ExportError::ExportFailed(format!("failed to spawn {}: {}", program, e)))?;

    let mut stdout = BufReader::new(child.stdout.take().expect("stdout piped")).lines();
    let mut stderr = BufReader::new(child.stderr.take().expect("stderr piped")).lines();
    let mut log = open_job_log(job_id).await;

    let mut stdout_open = true;
    let mut stderr_open = true;
    while stdout_open || stderr_open {
        let line = tokio::select! {
            _ = ctx.cancelled() => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(ExportError::Cancelled);
            }
            line = stdout.next_line(), if stdout_open => match line {
                Ok(Some(line)) => Some(line),
                _ => {
                    stdout_open = false;
                    None
                }
            },
            line = stderr.next_line(), if stderr_open => match line {
                Ok(Some(line)) => Some(line),
                _ => {
                    stderr_open = false;
                    None
                }
            },
        };
        if let Some(line) = line {
            if let Some(log) = log.as_mut() {
                let _ = log.write_all(line.as_bytes()).await;
                let _ = log.write_all(b"\n").await;
            }
            on_line(&line);
        }
    }
    if let Some(log) = log.as_mut() {
        let _ = log.flush().await;
    }

    let status = tokio::select! {
        _ = ctx.cancelled() => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(ExportError::Cancelled);
        }
        status = child.wait() => status
            .map_err(|e| ExportError::ExportFailed(format!("{} did not exit: {}", program, e)))?,
    };
    if !status.success() {
        return Err(ExportError::ExportFailed(format!(
            "{} exited with {}",
            program, status
        )));
    }
    Ok(())
}

async fn open_job_log(job_id: &str) -> Option<tokio::fs::File> {
    if vmexport_logging::ensure_logs_dir().is_err() {
        return None;
    }
    let path = vmexport_logging::job_log_path(job_id);
    match tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
    {
        Ok(file) => Some(file),
        Err(e) => {
            debug!(job_id, error = %e, "could not open job log file");
            None
        }
    }
}

/// Walk the output directory and assemble the result record. The
/// primary `.ovf` leads the file list.
pub(crate) fn collect_artifacts(
    def: &JobDefinition,
    started: Instant,
) -> Result<ExportResult, ExportError> {
    let root = Path::new(&def.output_path);
    let mut files = Vec::new();
    let mut total_bytes = 0u64;
    let mut ovf_path = None;

    for entry in WalkDir::new(root).follow_links(false) {
        let entry =
            entry.map_err(|e| ExportError::ExportFailed(format!("scanning output: {}", e)))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .into_owned();
        if let Ok(meta) = entry.metadata() {
            total_bytes += meta.len();
        }
        if rel.ends_with(".ovf") && ovf_path.is_none() {
            ovf_path = Some(rel.clone());
        }
        files.push(rel);
    }

    if files.is_empty() {
        return Err(ExportError::ExportFailed(format!(
            "no artifacts produced in {}",
            def.output_path
        )));
    }

    files.sort();
    let ovf_path = ovf_path.unwrap_or_else(|| files[0].clone());
    if let Some(pos) = files.iter().position(|f| *f == ovf_path) {
        let primary = files.remove(pos);
        files.insert(0, primary);
    }

    let vm_name = Path::new(&ovf_path)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| vm_name_from_path(&def.vm_path));

    Ok(ExportResult {
        vm_name,
        output_path: def.output_path.clone(),
        ovf_path,
        files,
        total_bytes,
        duration_secs: started.elapsed().as_secs_f64(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmexport_protocol::{BackendCapability, ExportOptions};

    fn definition(output: &str) -> JobDefinition {
        JobDefinition {
            id: "j1".to_string(),
            vm_path: "/dc/vm/web-01".to_string(),
            output_path: output.to_string(),
            format: "ovf".to_string(),
            ..JobDefinition::default()
        }
    }

    #[test]
    fn validate_common_checks_ranges() {
        let mut def = definition("/tmp/out");
        assert!(validate_common(&def).is_ok());

        def.options = ExportOptions {
            parallel_downloads: 0,
            ..ExportOptions::default()
        };
        assert!(matches!(
            validate_common(&def),
            Err(ExportError::InvalidDefinition(_))
        ));

        def.options = ExportOptions::default();
        def.format = "qcow2".to_string();
        assert!(matches!(
            validate_common(&def),
            Err(ExportError::InvalidDefinition(msg)) if msg.contains("qcow2")
        ));
    }

    #[test]
    fn vm_name_uses_last_path_segment() {
        assert_eq!(vm_name_from_path("/dc/vm/web-01"), "web-01");
        assert_eq!(vm_name_from_path("web-01"), "web-01");
        assert_eq!(vm_name_from_path("/dc/vm/web-01/"), "web-01");
    }

    #[test]
    fn collect_artifacts_orders_ovf_first() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("disk1.vmdk"), b"disk-bytes").unwrap();
        std::fs::write(tmp.path().join("web-01.ovf"), b"<Envelope/>").unwrap();
        std::fs::write(tmp.path().join("web-01.mf"), b"SHA256(...)").unwrap();

        let def = definition(tmp.path().to_str().unwrap());
        let result = collect_artifacts(&def, Instant::now()).unwrap();

        assert_eq!(result.files[0], "web-01.ovf");
        assert_eq!(result.files.len(), 3);
        assert_eq!(result.ovf_path, "web-01.ovf");
        assert_eq!(result.vm_name, "web-01");
        assert!(result.total_bytes > 0);
    }

    #[test]
    fn collect_artifacts_fails_on_empty_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let def = definition(tmp.path().to_str().unwrap());
        assert!(matches!(
            collect_artifacts(&def, Instant::now()),
            Err(ExportError::ExportFailed(_))
        ));
    }

    #[test]
    fn registry_gates_on_capability() {
        let table = CapabilityTable::new(vec![
            BackendCapability {
                method: ExportMethod::Ovftool,
                available: true,
                priority: 20,
                note: None,
            },
            BackendCapability {
                method: ExportMethod::Govc,
                available: false,
                priority: 10,
                note: None,
            },
        ]);
        let registry = ExporterRegistry::new(table);

        assert!(registry.is_available(ExportMethod::Ovftool));
        assert!(!registry.is_available(ExportMethod::Govc));
        assert_eq!(registry.default_method(), Some(ExportMethod::Ovftool));
        assert!(registry.create(ExportMethod::Ovftool).is_ok());
        assert!(matches!(
            registry.create(ExportMethod::Govc),
            Err(ExportError::BackendUnavailable(ExportMethod::Govc))
        ));
    }
}
