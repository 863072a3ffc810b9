//! Export backend driving VMware OVF Tool as a child process.

use std::time::Instant;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use vmexport_protocol::{
    ExportError, ExportMethod, ExportPhase, ExportResult, JobDefinition, JobProgress,
    VsphereCredentials,
};

use super::{collect_artifacts, require_credentials, run_child, validate_common, Exporter};
use crate::progress::ProgressSink;

pub struct OvftoolExporter {
    binary: String,
}

impl OvftoolExporter {
    pub fn new() -> Self {
        Self {
            binary: "ovftool".to_string(),
        }
    }
}

impl Default for OvftoolExporter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Exporter for OvftoolExporter {
    fn method(&self) -> ExportMethod {
        ExportMethod::Ovftool
    }

    fn validate(&self, def: &JobDefinition) -> Result<(), ExportError> {
        validate_common(def)?;
        require_credentials(def)?;
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

        sink.report(
            JobProgress::new(ExportPhase::Preparing).with_step("building source locator"),
        );
        tokio::fs::create_dir_all(&def.output_path)
            .await
            .map_err(|e| {
                ExportError::ExportFailed(format!(
                    "creating output directory {}: {}",
                    def.output_path, e
                ))
            })?;
        let source = vi_locator(creds, &def.vm_path)?;

        let mut cmd = tokio::process::Command::new(&self.binary);
        cmd.arg("--acceptAllEulas")
            .arg(format!(
                "--parallelThreads={}",
                def.options.parallel_downloads
            ))
            .arg(if def.format == "ova" {
                "--targetType=OVA"
            } else {
                "--targetType=OVF"
            });
        if creds.insecure {
            cmd.arg("--noSSLVerify");
        }
        if def.options.remove_media {
            // ovftool has no eject primitive; the govc backend covers it.
            warn!(job_id = %def.id, "remove_media not supported by ovftool, skipping");
        }
        cmd.arg(&source).arg(&def.output_path);

        sink.report(JobProgress::new(ExportPhase::Exporting).with_step("transferring disks"));
        let file_progress = def.options.file_progress;
        run_child(cmd, &self.binary, &ctx, &def.id, |line| {
            if let Some(percent) = parse_progress_line(line) {
                sink.report(
                    JobProgress::new(ExportPhase::Exporting)
                        .with_step("transferring disks")
                        .with_percent(percent),
                );
            } else if file_progress {
                if let Some(file) = parse_target_file(line) {
                    sink.report(
                        JobProgress::new(ExportPhase::Exporting)
                            .with_step("writing file")
                            .with_file(file),
                    );
                }
            } else {
                debug!(job_id = %def.id, line, "ovftool");
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

/// Build a `vi://user:pass@host/inventory/path` locator. Never log the
/// returned string.
fn vi_locator(creds: &VsphereCredentials, vm_path: &str) -> Result<String, ExportError> {
    let host = creds
        .server
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches('/')
        .trim_end_matches("/sdk");
    let mut url = Url::parse(&format!("vi://{}/", host))
        .map_err(|e| ExportError::InvalidDefinition(format!("invalid server: {}", e)))?;
    url.set_username(&creds.username)
        .map_err(|_| ExportError::InvalidDefinition("invalid username for locator".into()))?;
    if !creds.password.is_empty() {
        url.set_password(Some(&creds.password))
            .map_err(|_| ExportError::InvalidDefinition("invalid password for locator".into()))?;
    }
    url.set_path(vm_path);
    Ok(url.to_string())
}

/// ovftool writes lines like `Disk progress: 42%` and
/// `Transfer progress: 87%`.
fn parse_progress_line(line: &str) -> Option<f64> {
    let rest = line
        .strip_prefix("Disk progress: ")
        .or_else(|| line.strip_prefix("Transfer progress: "))?;
    rest.trim().trim_end_matches('%').parse().ok()
}

/// `Writing OVF package: /out/web-01/web-01.ovf` style lines.
fn parse_target_file(line: &str) -> Option<String> {
    line.strip_prefix("Writing OVF package: ")
        .or_else(|| line.strip_prefix("Target: "))
        .map(|s| s.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> VsphereCredentials {
        VsphereCredentials {
            server: "https://vcenter.example.com/sdk".to_string(),
            username: "administrator@vsphere.local".to_string(),
            password: "p@ss:word/".to_string(),
            insecure: true,
        }
    }

    #[test]
    fn locator_encodes_credentials() {
        let locator = vi_locator(&creds(), "/dc/vm/web-01").unwrap();
        assert!(locator.starts_with("vi://"));
        assert!(locator.contains("vcenter.example.com"));
        assert!(locator.ends_with("/dc/vm/web-01"));
        // Reserved characters must be escaped, not embedded raw.
        assert!(!locator.contains("p@ss:word/"));
    }

    #[test]
    fn progress_lines_parse() {
        assert_eq!(parse_progress_line("Disk progress: 42%"), Some(42.0));
        assert_eq!(parse_progress_line("Transfer progress: 100%"), Some(100.0));
        assert_eq!(parse_progress_line("Opening VI source"), None);
    }

    #[test]
    fn validate_requires_credentials() {
        let exporter = OvftoolExporter::new();
        let def = JobDefinition {
            vm_path: "/dc/vm/a".to_string(),
            output_path: "/out".to_string(),
            ..JobDefinition::default()
        };
        assert!(matches!(
            exporter.validate(&def),
            Err(ExportError::InvalidDefinition(msg)) if msg.contains("credentials")
        ));
    }
}
