//! VDDK-based export backend.
//!
//! Drives the out-of-tree `vmexport-vddk-helper` binary, which links
//! against VMware's proprietary disk library. The helper prints
//! `PROGRESS <percent> <file>` lines on stdout; everything else is
//! diagnostics. Password reaches the helper through its environment,
//! never argv.

use std::time::Instant;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use vmexport_protocol::{
    ExportError, ExportMethod, ExportPhase, ExportResult, JobDefinition, JobProgress,
};

use super::{collect_artifacts, require_credentials, run_child, validate_common, Exporter};
use crate::capability::VDDK_HELPER_BINARY;
use crate::progress::ProgressSink;

pub struct VddkExporter {
    helper: String,
}

impl VddkExporter {
    pub fn new() -> Self {
        Self {
            helper: VDDK_HELPER_BINARY.to_string(),
        }
    }
}

impl Default for VddkExporter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Exporter for VddkExporter {
    fn method(&self) -> ExportMethod {
        ExportMethod::Vddk
    }

    fn validate(&self, def: &JobDefinition) -> Result<(), ExportError> {
        validate_common(def)?;
        require_credentials(def)?;
        if def.format == "ova" {
            return Err(ExportError::InvalidDefinition(
                "vddk backend only produces ovf output".into(),
            ));
        }
        if which::which(&self.helper).is_err() {
            return Err(ExportError::BackendUnavailable(ExportMethod::Vddk));
        }
        Ok(())
    }

    async fn export(
        &self,
        ctx: CancellationToken,
        def: &JobDefinition,
        sink: &dyn ProgressSink,
    ) -> Result<ExportResult, ExportError> {
        let started = Instant::now();
        let creds = require_credentials(def)?;

        tokio::fs::create_dir_all(&def.output_path)
            .await
            .map_err(|e| {
                ExportError::ExportFailed(format!(
                    "creating output directory {}: {}",
                    def.output_path, e
                ))
            })?;

        let mut cmd = tokio::process::Command::new(&self.helper);
        cmd.arg("--server")
            .arg(&creds.server)
            .arg("--username")
            .arg(&creds.username)
            .arg("--vm-path")
            .arg(&def.vm_path)
            .arg("--output")
            .arg(&def.output_path)
            .arg("--threads")
            .arg(def.options.parallel_downloads.to_string())
            .env("VMEXPORT_VDDK_PASSWORD", &creds.password);
        if creds.insecure {
            cmd.arg("--insecure");
        }
        if def.options.remove_media {
            cmd.arg("--eject-media");
        }

        sink.report(JobProgress::new(ExportPhase::Exporting).with_step("reading disks via vddk"));
        run_child(cmd, &self.helper, &ctx, &def.id, |line| {
            if let Some((percent, file)) = parse_helper_line(line) {
                let mut progress = JobProgress::new(ExportPhase::Exporting)
                    .with_step("reading disks via vddk")
                    .with_percent(percent);
                if let Some(file) = file {
                    progress = progress.with_file(file);
                }
                sink.report(progress);
            } else {
                debug!(job_id = %def.id, line, "vddk-helper");
            }
        })
        .await?;

        sink.report(
            JobProgress::new(ExportPhase::Finalizing)
                .with_step("collecting artifacts")
                .with_percent(100.0),
        );
        collect_artifacts(def, started)
    }
}

fn parse_helper_line(line: &str) -> Option<(f64, Option<String>)> {
    let rest = line.strip_prefix("PROGRESS ")?;
    let mut parts = rest.splitn(2, ' ');
    let percent: f64 = parts.next()?.parse().ok()?;
    let file = parts.next().map(|s| s.trim().to_string());
    Some((percent, file))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn helper_lines_parse() {
        assert_eq!(
            parse_helper_line("PROGRESS 42.5 disk-0.vmdk"),
            Some((42.5, Some("disk-0.vmdk".to_string())))
        );
        assert_eq!(parse_helper_line("PROGRESS 10"), Some((10.0, None)));
        assert_eq!(parse_helper_line("opening connection"), None);
    }
}
