//! Wire types for the daemon HTTP API.
//!
//! Used by the daemon's handlers and by clients (CLI, wizards,
//! dashboards). JSON with snake_case enum tagging throughout; job
//! echoes always carry the redacted definition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::types::{Job, JobDefinition, JobStatus};

// ============================================================================
// Liveness & status
// ============================================================================

/// Minimal liveness payload for `GET /health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

impl HealthResponse {
    pub fn ok(version: impl Into<String>) -> Self {
        Self {
            status: "ok".to_string(),
            version: version.into(),
        }
    }
}

/// Aggregate daemon state for `GET /status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub version: String,
    /// Human-readable, e.g. "2h 15m 3s"
    pub uptime: String,
    pub total_jobs: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub timestamp: DateTime<Utc>,
}

/// Per-status job counts, as tracked by the registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

// ============================================================================
// Submit
// ============================================================================

/// Body of `POST /jobs/submit`: one definition or a batch.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SubmitRequest {
    Batch { jobs: Vec<JobDefinition> },
    Single(Box<JobDefinition>),
}

impl SubmitRequest {
    pub fn into_definitions(self) -> Vec<JobDefinition> {
        match self {
            Self::Batch { jobs } => jobs,
            Self::Single(def) => vec![*def],
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub accepted: usize,
    pub rejected: usize,
    pub job_ids: Vec<String>,
    pub errors: Vec<String>,
}

// ============================================================================
// Query & cancel
// ============================================================================

/// Body of `POST /jobs/query`. Empty filters mean "any".
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueryRequest {
    #[serde(default)]
    pub all: bool,
    #[serde(default)]
    pub job_ids: Option<Vec<String>>,
    #[serde(default)]
    pub status: Option<Vec<JobStatus>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub jobs: Vec<Job>,
    pub total: usize,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CancelRequest {
    pub job_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CancelResponse {
    pub cancelled: Vec<String>,
    pub failed: Vec<String>,
    pub errors: HashMap<String, String>,
}

// ============================================================================
// Errors
// ============================================================================

/// Uniform error body for non-2xx responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Machine-readable kind, e.g. "not_found"
    pub error: String,
    pub message: String,
}

// ============================================================================
// VM operations (hypervisor collaborator)
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct VmRequest {
    pub vm_path: String,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmSummary {
    pub name: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power_state: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmListResponse {
    pub vms: Vec<VmSummary>,
    pub total: usize,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmInfo {
    pub name: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest_os: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_cpu: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmOpResponse {
    pub vm_path: String,
    pub operation: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_request_accepts_single_and_batch() {
        let single: SubmitRequest =
            serde_json::from_str(r#"{"vm_path": "/dc/vm/a", "output_path": "/tmp/a"}"#).unwrap();
        let defs = single.into_definitions();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].vm_path, "/dc/vm/a");

        let batch: SubmitRequest = serde_json::from_str(
            r#"{"jobs": [{"vm_path": "/dc/vm/a", "output_path": "/tmp/a"},
                         {"vm_path": "/dc/vm/b", "output_path": "/tmp/b"}]}"#,
        )
        .unwrap();
        assert_eq!(batch.into_definitions().len(), 2);
    }

    #[test]
    fn query_request_defaults_are_empty_filters() {
        let req: QueryRequest = serde_json::from_str("{}").unwrap();
        assert!(!req.all);
        assert!(req.job_ids.is_none());
        assert!(req.status.is_none());

        let req: QueryRequest =
            serde_json::from_str(r#"{"status": ["running", "pending"]}"#).unwrap();
        assert_eq!(
            req.status.unwrap(),
            vec![JobStatus::Running, JobStatus::Pending]
        );
    }
}
