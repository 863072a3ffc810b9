//! Progress reporting contract between backends and the manager.

use vmexport_protocol::JobProgress;

/// Callback a backend uses to report incremental status.
///
/// Implementations must be safe under concurrent invocation and must
/// not block the caller beyond a brief guarded assignment; each call
/// replaces the previous snapshot, so only the most recent update is
/// guaranteed to be observable.
pub trait ProgressSink: Send + Sync {
    fn report(&self, progress: JobProgress);
}

/// Sink that discards every update.
pub struct NullSink;

impl ProgressSink for NullSink {
    fn report(&self, _progress: JobProgress) {}
}
