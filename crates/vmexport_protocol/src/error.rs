//! Error taxonomy for the export daemon.
//!
//! Every error the core surfaces maps onto one of these kinds; the
//! HTTP layer renders them with [`ExportError::http_status`]. Messages
//! must never embed credentials.

use thiserror::Error;

use crate::types::{ExportMethod, JobStatus};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExportError {
    #[error("job not found: {0}")]
    NotFound(String),

    #[error("job id already exists: {0}")]
    DuplicateId(String),

    #[error("invalid job definition: {0}")]
    InvalidDefinition(String),

    #[error("export backend unavailable: {0}")]
    BackendUnavailable(ExportMethod),

    #[error("job cannot be cancelled (status: {0})")]
    NotCancellable(JobStatus),

    /// Backend failure mid-export. Recorded on the job, never raised
    /// to the submitter.
    #[error("export failed: {0}")]
    ExportFailed(String),

    #[error("export cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl ExportError {
    /// HTTP status code used when the error crosses the wire.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::NotFound(_) => 404,
            Self::DuplicateId(_) | Self::NotCancellable(_) => 409,
            Self::InvalidDefinition(_) | Self::BackendUnavailable(_) => 400,
            Self::ExportFailed(_) | Self::Cancelled | Self::Internal(_) => 500,
        }
    }

    /// Machine-readable kind tag for response bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::DuplicateId(_) => "duplicate_id",
            Self::InvalidDefinition(_) => "invalid_definition",
            Self::BackendUnavailable(_) => "backend_unavailable",
            Self::NotCancellable(_) => "not_cancellable",
            Self::ExportFailed(_) => "export_failed",
            Self::Cancelled => "cancelled",
            Self::Internal(_) => "internal_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_mapping() {
        assert_eq!(ExportError::NotFound("x".into()).http_status(), 404);
        assert_eq!(ExportError::DuplicateId("x".into()).http_status(), 409);
        assert_eq!(
            ExportError::InvalidDefinition("missing vm_path".into()).http_status(),
            400
        );
        assert_eq!(
            ExportError::BackendUnavailable(ExportMethod::Vddk).http_status(),
            400
        );
        assert_eq!(
            ExportError::NotCancellable(JobStatus::Completed).http_status(),
            409
        );
        assert_eq!(ExportError::Internal("boom".into()).http_status(), 500);
    }

    #[test]
    fn not_cancellable_names_the_status() {
        let err = ExportError::NotCancellable(JobStatus::Completed);
        assert_eq!(
            err.to_string(),
            "job cannot be cancelled (status: completed)"
        );
    }
}
