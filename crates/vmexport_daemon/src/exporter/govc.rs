//! Export backend using the vSphere web API through the govc CLI.

use std::time::Instant;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use vmexport_protocol::{
    ExportError, ExportMethod, ExportPhase, ExportResult, JobDefinition, JobProgress,
    VsphereCredentials,
};

use super::{collect_artifacts, require_credentials, run_child, validate_common, Exporter};
use crate::progress::ProgressSink;

pub struct GovcExporter {
    binary: String,
}

impl GovcExporter {
    pub fn new() -> Self {
        Self {
            binary: "govc".to_string(),
        }
    }

    fn command(&self, creds: &VsphereCredentials) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.binary);
        // Job credentials override whatever GOVC_* the daemon process
        // inherited.
        cmd.env("GOVC_URL", &creds.server)
            .env("GOVC_USERNAME", &creds.username)
            .env("GOVC_PASSWORD", &creds.password)
            .env("GOVC_INSECURE", if creds.insecure { "true" } else { "false" });
        cmd
    }
}

impl Default for GovcExporter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Exporter for GovcExporter {
    fn method(&self) -> ExportMethod {
        ExportMethod::Govc
    }

    fn validate(&self, def: &JobDefinition) -> Result<(), ExportError> {
        validate_common(def)?;
        require_credentials(def)?;
        if def.format == "ova" {
            return Err(ExportError::InvalidDefinition(
                "govc backend only produces ovf output".into(),
            ));
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

        if def.options.remove_media {
            sink.report(
                JobProgress::new(ExportPhase::Preparing).with_step("ejecting removable media"),
            );
            let mut eject = self.command(creds);
            eject.arg("device.cdrom.eject").arg("-vm.ipath").arg(&def.vm_path);
            // The VM may simply have no media attached.
            if let Err(e) = run_child(eject, &self.binary, &ctx, &def.id, |_| {}).await {
                if matches!(e, ExportError::Cancelled) {
                    return Err(e);
                }
                warn!(job_id = %def.id, error = %e, "cdrom eject failed, continuing");
            }
        }

        sink.report(JobProgress::new(ExportPhase::Exporting).with_step("downloading disks"));
        let mut cmd = self.command(creds);
        cmd.arg("export.ovf")
            .arg("-vm.ipath")
            .arg(&def.vm_path)
            .arg(&def.output_path);

        let mut files_done = 0u64;
        let file_progress = def.options.file_progress;
        run_child(cmd, &self.binary, &ctx, &def.id, |line| {
            if let Some(file) = parse_download_line(line) {
                files_done += 1;
                let mut progress = JobProgress::new(ExportPhase::Exporting)
                    .with_step("downloading disks")
                    .with_files(files_done, None);
                if file_progress {
                    progress = progress.with_file(file);
                }
                sink.report(progress);
            } else {
                debug!(job_id = %def.id, line, "govc");
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

/// govc prints `Downloading web-01-disk-0.vmdk... OK` per file.
fn parse_download_line(line: &str) -> Option<String> {
    let rest = line.trim().strip_prefix("Downloading ")?;
    Some(rest.trim_end_matches("... OK").trim_end_matches("...").to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn download_lines_parse() {
        assert_eq!(
            parse_download_line("Downloading web-01-disk-0.vmdk... OK"),
            Some("web-01-disk-0.vmdk".to_string())
        );
        assert_eq!(parse_download_line("[01-01-70] exporting"), None);
    }

    #[test]
    fn validate_rejects_ova() {
        let exporter = GovcExporter::new();
        let def = JobDefinition {
            vm_path: "/dc/vm/a".to_string(),
            output_path: "/out".to_string(),
            format: "ova".to_string(),
            credentials: Some(VsphereCredentials {
                server: "vcenter.example.com".to_string(),
                username: "admin".to_string(),
                password: "pw".to_string(),
                insecure: false,
            }),
            ..JobDefinition::default()
        };
        assert!(matches!(
            exporter.validate(&def),
            Err(ExportError::InvalidDefinition(msg)) if msg.contains("ovf")
        ));
    }
}
