//! Core data model shared by the daemon and its clients.
//!
//! The `Job` record is the single source of truth for one export
//! request. Everything here is plain owned data so that `Clone`
//! produces a fully independent snapshot; the registry relies on that
//! to hand out copies that cannot race with worker updates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::defaults;

/// Placeholder substituted for secrets in redacted views.
pub const REDACTED: &str = "*****";

// ============================================================================
// Status & method enums
// ============================================================================

/// Lifecycle status of a job.
///
/// Transitions follow a directed graph: `Pending -> Running ->
/// {Completed, Failed, Cancelled}`, plus `Pending -> Cancelled` for
/// jobs cancelled before a worker picked them up. Terminal states are
/// never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Check if the status is terminal (completed, failed, or cancelled).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether the lifecycle graph permits moving to `next` from here.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, JobStatus::Running)
                | (Self::Pending, JobStatus::Cancelled)
                | (Self::Running, JobStatus::Completed)
                | (Self::Running, JobStatus::Failed)
                | (Self::Running, JobStatus::Cancelled)
        )
    }

    pub fn all() -> [JobStatus; 5] {
        [
            Self::Pending,
            Self::Running,
            Self::Completed,
            Self::Failed,
            Self::Cancelled,
        ]
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Export backend identifier.
///
/// The set is closed; declaration order is the stable registration
/// order used to break priority ties when picking a default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportMethod {
    /// VDDK-based disk transfer (fastest when the library is present)
    Vddk,
    /// VMware OVF Tool driven as an external process
    Ovftool,
    /// vSphere web API via the govc CLI
    Govc,
}

impl ExportMethod {
    pub const ALL: [ExportMethod; 3] = [Self::Vddk, Self::Ovftool, Self::Govc];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vddk => "vddk",
            Self::Ovftool => "ovftool",
            Self::Govc => "govc",
        }
    }
}

impl fmt::Display for ExportMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExportMethod {
    type Err = UnknownMethod;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "vddk" => Ok(Self::Vddk),
            "ovftool" => Ok(Self::Ovftool),
            "govc" | "api" => Ok(Self::Govc),
            other => Err(UnknownMethod(other.to_string())),
        }
    }
}

/// Error for an unrecognized backend name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown export method: {0}")]
pub struct UnknownMethod(pub String);

// ============================================================================
// Credentials
// ============================================================================

/// Connection credentials for the hypervisor.
///
/// `Debug` masks the password; use [`VsphereCredentials::redacted`]
/// before letting the struct cross any untrusted boundary.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VsphereCredentials {
    /// vCenter / ESXi host, with or without scheme
    #[serde(default)]
    pub server: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Skip TLS certificate verification
    #[serde(default)]
    pub insecure: bool,
}

impl VsphereCredentials {
    /// Copy with the password replaced by a placeholder.
    pub fn redacted(&self) -> Self {
        Self {
            server: self.server.clone(),
            username: self.username.clone(),
            password: if self.password.is_empty() {
                String::new()
            } else {
                REDACTED.to_string()
            },
            insecure: self.insecure,
        }
    }
}

impl fmt::Debug for VsphereCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VsphereCredentials")
            .field("server", &self.server)
            .field("username", &self.username)
            .field("password", &REDACTED)
            .field("insecure", &self.insecure)
            .finish()
    }
}

// ============================================================================
// Job definition (client supplied)
// ============================================================================

/// Per-job tuning knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportOptions {
    /// Concurrent disk downloads the backend may use
    #[serde(default = "default_parallel_downloads")]
    pub parallel_downloads: usize,
    /// Eject CD-ROM / removable media before exporting
    #[serde(default)]
    pub remove_media: bool,
    /// Emit a progress update per transferred file
    #[serde(default)]
    pub file_progress: bool,
}

fn default_parallel_downloads() -> usize {
    defaults::DEFAULT_PARALLEL_DOWNLOADS
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            parallel_downloads: defaults::DEFAULT_PARALLEL_DOWNLOADS,
            remove_media: false,
            file_progress: false,
        }
    }
}

/// Client-supplied description of what to export.
///
/// Accepts both the nested credential form and the flat legacy fields
/// older clients send; [`JobDefinition::normalize`] folds the legacy
/// fields into the nested form before a worker launches.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    /// Assigned at submit when empty
    #[serde(default)]
    pub id: String,
    /// Optional human-readable name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Inventory path of the VM, e.g. `/dc/vm/web-01`
    #[serde(default)]
    pub vm_path: String,
    /// Directory the artifacts are written to
    #[serde(default)]
    pub output_path: String,
    /// Target artifact format (`ovf` when empty)
    #[serde(default)]
    pub format: String,
    /// Explicit backend request; free-form so unknown names downgrade
    /// to the default instead of failing deserialization
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub export_method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<VsphereCredentials>,
    #[serde(default)]
    pub options: ExportOptions,
    /// Stamped at submit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,

    // Flat legacy fields, still accepted on the wire. Cleared by
    // normalize() once folded into the nested structures.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub vcenter_url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub insecure: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output_dir: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub method: String,
}

impl Default for JobDefinition {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            vm_path: String::new(),
            output_path: String::new(),
            format: String::new(),
            export_method: String::new(),
            credentials: None,
            options: ExportOptions::default(),
            created_at: None,
            vcenter_url: String::new(),
            username: String::new(),
            password: String::new(),
            insecure: false,
            output_dir: String::new(),
            method: String::new(),
        }
    }
}

impl JobDefinition {
    /// Fold legacy flat fields into the nested form and fill defaults.
    ///
    /// Idempotent: running it twice yields the same definition. The
    /// nested credential struct wins over the flat fields when both
    /// are present.
    pub fn normalize(&mut self) {
        if self.credentials.is_none()
            && (!self.vcenter_url.is_empty()
                || !self.username.is_empty()
                || !self.password.is_empty()
                || self.insecure)
        {
            self.credentials = Some(VsphereCredentials {
                server: self.vcenter_url.clone(),
                username: self.username.clone(),
                password: self.password.clone(),
                insecure: self.insecure,
            });
        }
        if let Some(creds) = self.credentials.as_mut() {
            if creds.server.is_empty() {
                creds.server = defaults::FALLBACK_VCENTER_SERVER.to_string();
            }
        }
        // Flat secrets are dropped once the nested struct exists.
        self.vcenter_url.clear();
        self.username.clear();
        self.password.clear();
        self.insecure = false;

        if self.output_path.is_empty() && !self.output_dir.is_empty() {
            self.output_path = std::mem::take(&mut self.output_dir);
        }
        self.output_dir.clear();
        if self.export_method.is_empty() && !self.method.is_empty() {
            self.export_method = std::mem::take(&mut self.method);
        }
        self.method.clear();
        if self.format.is_empty() {
            self.format = defaults::DEFAULT_FORMAT.to_string();
        }
    }

    /// The explicitly requested backend, if the name parses.
    pub fn requested_method(&self) -> Option<ExportMethod> {
        if self.export_method.is_empty() {
            None
        } else {
            self.export_method.parse().ok()
        }
    }

    /// Copy safe to serialize across untrusted boundaries.
    pub fn redacted(&self) -> Self {
        let mut def = self.clone();
        def.credentials = def.credentials.as_ref().map(VsphereCredentials::redacted);
        if !def.password.is_empty() {
            def.password = REDACTED.to_string();
        }
        def
    }
}

impl fmt::Debug for JobDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Render the redacted view so a stray debug log cannot leak
        // the flat legacy password.
        f.debug_struct("JobDefinition")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("vm_path", &self.vm_path)
            .field("output_path", &self.output_path)
            .field("format", &self.format)
            .field("export_method", &self.export_method)
            .field("credentials", &self.credentials)
            .field("options", &self.options)
            .field(
                "password",
                &if self.password.is_empty() { "" } else { REDACTED },
            )
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Progress & result
// ============================================================================

/// Coarse phase of a running export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportPhase {
    Connecting,
    Preparing,
    Exporting,
    Finalizing,
}

impl ExportPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Preparing => "preparing",
            Self::Exporting => "exporting",
            Self::Finalizing => "finalizing",
        }
    }
}

impl fmt::Display for ExportPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Incremental status reported by a backend.
///
/// Later updates supersede earlier ones; only the most recent snapshot
/// is guaranteed to be observable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    pub phase: ExportPhase,
    /// Human-readable description of the current step
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub step: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_file: Option<String>,
    #[serde(default)]
    pub files_done: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files_total: Option<u64>,
    #[serde(default)]
    pub bytes_done: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes_total: Option<u64>,
    /// Percent complete, 0.0..=100.0
    #[serde(default)]
    pub percent: f64,
    /// Backend actually chosen for the job
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<ExportMethod>,
}

impl JobProgress {
    pub fn new(phase: ExportPhase) -> Self {
        Self {
            phase,
            step: String::new(),
            current_file: None,
            files_done: 0,
            files_total: None,
            bytes_done: 0,
            bytes_total: None,
            percent: 0.0,
            method: None,
        }
    }

    pub fn with_step(mut self, step: impl Into<String>) -> Self {
        self.step = step.into();
        self
    }

    pub fn with_file(mut self, file: impl Into<String>) -> Self {
        self.current_file = Some(file.into());
        self
    }

    pub fn with_files(mut self, done: u64, total: Option<u64>) -> Self {
        self.files_done = done;
        self.files_total = total;
        self
    }

    pub fn with_bytes(mut self, done: u64, total: Option<u64>) -> Self {
        self.bytes_done = done;
        self.bytes_total = total;
        self
    }

    pub fn with_percent(mut self, percent: f64) -> Self {
        self.percent = percent.clamp(0.0, 100.0);
        self
    }
}

/// Artifacts produced by a completed export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportResult {
    /// VM name as resolved at the hypervisor
    pub vm_name: String,
    /// Output directory actually used
    pub output_path: String,
    /// Primary OVF/manifest path
    pub ovf_path: String,
    /// All produced files
    pub files: Vec<String>,
    pub total_bytes: u64,
    pub duration_secs: f64,
}

// ============================================================================
// Job (server owned)
// ============================================================================

/// Server-side record of one export request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub definition: JobDefinition,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<JobProgress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ExportResult>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a pending job from a definition. The definition must
    /// already carry its id and created_at stamps.
    pub fn new(definition: JobDefinition) -> Self {
        let created_at = definition.created_at.unwrap_or_else(Utc::now);
        Self {
            definition,
            status: JobStatus::Pending,
            error: None,
            progress: None,
            result: None,
            created_at,
            started_at: None,
            completed_at: None,
            updated_at: created_at,
        }
    }

    pub fn id(&self) -> &str {
        &self.definition.id
    }

    /// Transition pending -> running. Returns false if the graph
    /// forbids the move (e.g. the job was cancelled first).
    pub fn start(&mut self) -> bool {
        if !self.status.can_transition_to(JobStatus::Running) {
            return false;
        }
        self.status = JobStatus::Running;
        let now = Utc::now();
        self.started_at = Some(now);
        self.updated_at = now;
        true
    }

    /// Transition running -> completed, storing the result.
    pub fn complete(&mut self, result: ExportResult) -> bool {
        if !self.status.can_transition_to(JobStatus::Completed) {
            return false;
        }
        self.status = JobStatus::Completed;
        self.result = Some(result);
        let now = Utc::now();
        self.completed_at = Some(now);
        self.updated_at = now;
        true
    }

    /// Transition to failed, recording the error message.
    pub fn fail(&mut self, error: impl Into<String>) -> bool {
        if !self.status.can_transition_to(JobStatus::Failed) {
            return false;
        }
        self.status = JobStatus::Failed;
        self.error = Some(error.into());
        let now = Utc::now();
        self.completed_at = Some(now);
        self.updated_at = now;
        true
    }

    /// Transition to cancelled. Pending jobs keep `started_at == None`.
    pub fn cancel(&mut self) -> bool {
        if !self.status.can_transition_to(JobStatus::Cancelled) {
            return false;
        }
        self.status = JobStatus::Cancelled;
        let now = Utc::now();
        self.completed_at = Some(now);
        self.updated_at = now;
        true
    }

    /// Replace the current progress snapshot.
    pub fn set_progress(&mut self, progress: JobProgress) {
        self.progress = Some(progress);
        self.updated_at = Utc::now();
    }

    /// Snapshot with the definition's secrets masked; the only form
    /// that may cross a wire or log boundary.
    pub fn redacted(&self) -> Job {
        let mut job = self.clone();
        job.definition = job.definition.redacted();
        job
    }
}

// ============================================================================
// Backend capabilities
// ============================================================================

/// Whether one backend is usable on this host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendCapability {
    pub method: ExportMethod,
    pub available: bool,
    /// Higher wins when picking the default backend
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Frozen table produced by the capability detector at startup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilityTable {
    entries: Vec<BackendCapability>,
}

impl CapabilityTable {
    /// Entry order is preserved and breaks priority ties.
    pub fn new(entries: Vec<BackendCapability>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[BackendCapability] {
        &self.entries
    }

    pub fn get(&self, method: ExportMethod) -> Option<&BackendCapability> {
        self.entries.iter().find(|c| c.method == method)
    }

    pub fn is_available(&self, method: ExportMethod) -> bool {
        self.get(method).map(|c| c.available).unwrap_or(false)
    }

    /// Highest-priority available backend; ties broken by entry order.
    pub fn default_method(&self) -> Option<ExportMethod> {
        self.entries
            .iter()
            .filter(|c| c.available)
            .max_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    // max_by keeps the later element on Equal; invert
                    // the tie so the earlier entry wins.
                    .then(std::cmp::Ordering::Greater)
            })
            .map(|c| c.method)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn legacy_definition() -> JobDefinition {
        JobDefinition {
            vm_path: "/dc/vm/web-01".to_string(),
            output_path: "/exports/web-01".to_string(),
            vcenter_url: "vcenter.example.com".to_string(),
            username: "admin".to_string(),
            password: "hunter2".to_string(),
            insecure: true,
            ..JobDefinition::default()
        }
    }

    #[test]
    fn lifecycle_graph() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Cancelled));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Failed));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Cancelled));
        for terminal in [JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled] {
            assert!(terminal.is_terminal());
            for next in JobStatus::all() {
                assert!(!terminal.can_transition_to(next));
            }
        }
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Completed));
    }

    #[test]
    fn normalize_folds_legacy_credentials() {
        let mut def = legacy_definition();
        def.normalize();

        let creds = def.credentials.as_ref().expect("nested credentials");
        assert_eq!(creds.server, "vcenter.example.com");
        assert_eq!(creds.username, "admin");
        assert_eq!(creds.password, "hunter2");
        assert!(creds.insecure);
        assert_eq!(def.format, "ovf");
        assert!(def.vcenter_url.is_empty());
        assert!(def.password.is_empty());
    }

    #[test]
    fn normalize_is_idempotent() {
        let mut def = legacy_definition();
        def.normalize();
        let once = def.clone();
        def.normalize();
        assert_eq!(def, once);
    }

    #[test]
    fn normalize_nested_wins_over_legacy() {
        let mut def = legacy_definition();
        def.credentials = Some(VsphereCredentials {
            server: "primary.example.com".to_string(),
            username: "svc".to_string(),
            password: "secret".to_string(),
            insecure: false,
        });
        def.normalize();

        let creds = def.credentials.as_ref().unwrap();
        assert_eq!(creds.server, "primary.example.com");
        assert_eq!(creds.username, "svc");
    }

    #[test]
    fn normalize_applies_server_fallback() {
        let mut def = JobDefinition {
            username: "admin".to_string(),
            password: "pw".to_string(),
            ..JobDefinition::default()
        };
        def.normalize();
        assert_eq!(
            def.credentials.as_ref().unwrap().server,
            defaults::FALLBACK_VCENTER_SERVER
        );
    }

    #[test]
    fn normalize_copies_legacy_output_and_method() {
        let mut def = JobDefinition {
            vm_path: "/dc/vm/a".to_string(),
            output_dir: "/exports/a".to_string(),
            method: "govc".to_string(),
            ..JobDefinition::default()
        };
        def.normalize();
        assert_eq!(def.output_path, "/exports/a");
        assert_eq!(def.export_method, "govc");

        // New slots win when both are populated.
        let mut def = JobDefinition {
            output_path: "/new".to_string(),
            output_dir: "/old".to_string(),
            ..JobDefinition::default()
        };
        def.normalize();
        assert_eq!(def.output_path, "/new");
    }

    #[test]
    fn redaction_masks_password_everywhere() {
        let mut def = legacy_definition();
        def.normalize();
        let job = Job::new(def);

        let wire = serde_json::to_string(&job.redacted()).unwrap();
        assert!(!wire.contains("hunter2"));
        assert!(wire.contains(REDACTED));

        let debug = format!("{:?}", job);
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn terminal_states_reject_further_writes() {
        let mut job = Job::new(JobDefinition {
            id: "j1".to_string(),
            ..JobDefinition::default()
        });
        assert!(job.start());
        assert!(job.cancel());
        assert!(!job.fail("late error"));
        assert!(!job.complete(ExportResult {
            vm_name: "a".to_string(),
            output_path: "/o".to_string(),
            ovf_path: "/o/a.ovf".to_string(),
            files: vec![],
            total_bytes: 0,
            duration_secs: 0.0,
        }));
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.result.is_none());
    }

    #[test]
    fn pending_cancel_keeps_started_at_unset() {
        let mut job = Job::new(JobDefinition::default());
        assert!(job.cancel());
        assert!(job.started_at.is_none());
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn default_method_prefers_priority_then_order() {
        let table = CapabilityTable::new(vec![
            BackendCapability {
                method: ExportMethod::Vddk,
                available: false,
                priority: 30,
                note: None,
            },
            BackendCapability {
                method: ExportMethod::Ovftool,
                available: true,
                priority: 20,
                note: None,
            },
            BackendCapability {
                method: ExportMethod::Govc,
                available: true,
                priority: 20,
                note: None,
            },
        ]);
        // Equal priorities: the earlier entry wins.
        assert_eq!(table.default_method(), Some(ExportMethod::Ovftool));
        assert!(!table.is_available(ExportMethod::Vddk));
    }
}
