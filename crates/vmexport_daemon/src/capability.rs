//! Capability detection for export backends.
//!
//! Runs once at startup and produces a frozen [`CapabilityTable`].
//! Probes never error: a failed probe records the backend as
//! unavailable with a note. Detection is idempotent and cheap enough
//! to run before the listener binds.

use std::path::Path;

use tracing::debug;
use vmexport_protocol::{BackendCapability, CapabilityTable, ExportMethod};

/// Helper binary the VDDK backend drives.
pub const VDDK_HELPER_BINARY: &str = "vmexport-vddk-helper";

/// Well-known VDDK install locations checked when `VDDK_HOME` is unset.
const VDDK_LIB_DIRS: [&str; 2] = [
    "/usr/lib/vmware-vix-disklib/lib64",
    "/opt/vmware-vix-disklib-distrib/lib64",
];

/// Probe the environment for every known backend.
pub fn detect_capabilities() -> CapabilityTable {
    let entries = vec![
        probe_vddk(),
        probe_binary(ExportMethod::Ovftool, "ovftool", 20),
        probe_binary(ExportMethod::Govc, "govc", 10),
    ];
    for cap in &entries {
        debug!(
            method = %cap.method,
            available = cap.available,
            priority = cap.priority,
            note = cap.note.as_deref().unwrap_or(""),
            "backend probe"
        );
    }
    CapabilityTable::new(entries)
}

fn probe_binary(method: ExportMethod, name: &str, priority: i32) -> BackendCapability {
    match which::which(name) {
        Ok(path) => BackendCapability {
            method,
            available: true,
            priority,
            note: Some(path.display().to_string()),
        },
        Err(_) => BackendCapability {
            method,
            available: false,
            priority,
            note: Some(format!("{} not found on PATH", name)),
        },
    }
}

/// VDDK needs both the helper binary and the disk library install.
fn probe_vddk() -> BackendCapability {
    let priority = 30;
    let helper = match which::which(VDDK_HELPER_BINARY) {
        Ok(path) => path,
        Err(_) => {
            return BackendCapability {
                method: ExportMethod::Vddk,
                available: false,
                priority,
                note: Some(format!("{} not found on PATH", VDDK_HELPER_BINARY)),
            }
        }
    };
    match vddk_lib_dir() {
        Some(lib) => BackendCapability {
            method: ExportMethod::Vddk,
            available: true,
            priority,
            note: Some(format!("{} ({})", helper.display(), lib)),
        },
        None => BackendCapability {
            method: ExportMethod::Vddk,
            available: false,
            priority,
            note: Some("VDDK library not found (set VDDK_HOME)".to_string()),
        },
    }
}

fn vddk_lib_dir() -> Option<String> {
    if let Ok(home) = std::env::var("VDDK_HOME") {
        if Path::new(&home).is_dir() {
            return Some(home);
        }
        return None;
    }
    VDDK_LIB_DIRS
        .iter()
        .find(|dir| Path::new(dir).is_dir())
        .map(|dir| dir.to_string())
}
