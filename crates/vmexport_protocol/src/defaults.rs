//! Canonical default values shared across the daemon and its clients.

/// Artifact format used when the definition leaves it empty.
pub const DEFAULT_FORMAT: &str = "ovf";

/// Server substituted when legacy credentials omit one.
pub const FALLBACK_VCENTER_SERVER: &str = "localhost";

pub const DEFAULT_HTTP_BIND: &str = "127.0.0.1:8080";

pub const DEFAULT_PARALLEL_DOWNLOADS: usize = 4;
pub const MAX_PARALLEL_DOWNLOADS: usize = 16;

/// Bounded wait for outstanding workers at shutdown.
pub const DRAIN_TIMEOUT_SECS: u64 = 30;

/// Per-call timeout for hypervisor VM operations.
pub const VM_OP_TIMEOUT_SECS: u64 = 30;
/// Inventory listing walks the whole tree and gets a longer budget.
pub const VM_LIST_TIMEOUT_SECS: u64 = 120;

pub const CANCELLED_BY_USER_MESSAGE: &str = "cancelled by user";
