//! vmexport daemon
//!
//! Accepts VM-export jobs over HTTP and runs them against a vSphere
//! environment through the best available exporter backend.
//!
//! Usage:
//!     vmexport-daemon --bind 127.0.0.1:8080 [--webhook-url URL]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};

use vmexport_daemon::{
    detect_capabilities, router, shutdown, AppState, ExporterRegistry, GovcClient,
    HttpWebhookSink, HypervisorClient, JobManager,
};
use vmexport_logging::{init_logging, LogConfig};
use vmexport_protocol::defaults;

#[derive(Parser, Debug)]
#[command(name = "vmexport-daemon", about = "VM export daemon for vSphere")]
struct Args {
    /// HTTP listen address
    #[arg(long, default_value = defaults::DEFAULT_HTTP_BIND)]
    bind: String,

    /// URL to POST job lifecycle events to
    #[arg(long, env = "VMEXPORT_WEBHOOK_URL")]
    webhook_url: Option<String>,

    /// Mirror the full log filter to stderr
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(LogConfig {
        app_name: "vmexport-daemon",
        verbose: args.verbose,
    })?;

    info!(version = env!("CARGO_PKG_VERSION"), "starting vmexport daemon");

    let capabilities = detect_capabilities();
    for cap in capabilities.entries() {
        info!(
            method = %cap.method,
            available = cap.available,
            priority = cap.priority,
            note = cap.note.as_deref().unwrap_or(""),
            "export backend"
        );
    }
    let exporters = ExporterRegistry::new(capabilities);
    match exporters.default_method() {
        Some(method) => info!(%method, "default export backend"),
        None => warn!("no export backend available; submissions will fail at launch"),
    }

    let manager = Arc::new(JobManager::new(exporters));
    if let Some(url) = &args.webhook_url {
        info!(url = %url, "webhook notifications enabled");
        manager.set_webhook_sink(Arc::new(HttpWebhookSink::new(url.clone())));
    }
    let hypervisor: Arc<dyn HypervisorClient> = Arc::new(GovcClient::new());

    let app = router(AppState {
        manager: Arc::clone(&manager),
        hypervisor,
    });
    let listener = tokio::net::TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("binding {}", args.bind))?;
    info!(bind = %args.bind, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown::shutdown_signal())
        .await
        .context("http server error")?;

    // Listener is closed; cancel outstanding workers and drain.
    let clean = manager
        .shutdown(Duration::from_secs(defaults::DRAIN_TIMEOUT_SECS))
        .await;
    if !clean {
        error!("drain timed out, exiting dirty");
        std::process::exit(1);
    }
    info!("shutdown complete");
    Ok(())
}
