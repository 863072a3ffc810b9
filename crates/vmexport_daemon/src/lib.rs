//! vmexport daemon library
//!
//! Job-orchestrating daemon that accepts VM-export requests over HTTP
//! and runs them against a vSphere environment through pluggable
//! exporter backends, leaving OVF/VMDK artifact directories behind.
//!
//! Exposes the building blocks for testing and library usage; the
//! `vmexport-daemon` binary wires them together.

pub mod capability;
pub mod exporter;
pub mod http;
pub mod hypervisor;
pub mod manager;
pub mod progress;
pub mod registry;
pub mod shutdown;
pub mod testing;
pub mod webhook;

pub use capability::detect_capabilities;
pub use exporter::{Exporter, ExporterRegistry};
pub use http::{router, AppState};
pub use hypervisor::{GovcClient, HypervisorClient};
pub use manager::JobManager;
pub use progress::{NullSink, ProgressSink};
pub use registry::JobRegistry;
pub use webhook::{HttpWebhookSink, WebhookSink};
