//! Shared protocol for the vmexport daemon.
//!
//! Defines the job data model, the HTTP wire types, the error
//! taxonomy, and the canonical defaults. The daemon crate depends on
//! this for everything that crosses a boundary; clients can depend on
//! it alone to speak to the daemon.

pub mod defaults;
pub mod error;
pub mod http_types;
pub mod types;

pub use error::ExportError;

pub use types::{
    BackendCapability,
    CapabilityTable,
    ExportMethod,
    ExportOptions,
    ExportPhase,
    ExportResult,
    Job,
    JobDefinition,
    JobProgress,
    JobStatus,
    UnknownMethod,
    VsphereCredentials,
    REDACTED,
};

pub use http_types::{
    CancelRequest,
    CancelResponse,
    DaemonStatus,
    ErrorResponse,
    HealthResponse,
    JobCounts,
    QueryRequest,
    QueryResponse,
    SubmitRequest,
    SubmitResponse,
    VmInfo,
    VmListResponse,
    VmOpResponse,
    VmRequest,
    VmSummary,
};
