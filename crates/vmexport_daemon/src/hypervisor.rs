//! Hypervisor client collaborator.
//!
//! VM discovery and power operations live behind a trait so the HTTP
//! surface only dispatches; the stock implementation shells out to
//! govc. Connection settings (`GOVC_URL`, `GOVC_USERNAME`,
//! `GOVC_PASSWORD`, `GOVC_INSECURE`, `GOVC_DATACENTER`) pass through
//! from the daemon environment to the child process untouched.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use vmexport_protocol::{ExportError, VmInfo, VmOpResponse, VmSummary};

#[async_trait]
pub trait HypervisorClient: Send + Sync {
    async fn list_vms(&self, timeout: Duration) -> Result<Vec<VmSummary>, ExportError>;
    async fn vm_info(&self, vm_path: &str, timeout: Duration) -> Result<VmInfo, ExportError>;
    async fn shutdown_vm(
        &self,
        vm_path: &str,
        timeout: Duration,
    ) -> Result<VmOpResponse, ExportError>;
    async fn poweroff_vm(
        &self,
        vm_path: &str,
        timeout: Duration,
    ) -> Result<VmOpResponse, ExportError>;
    async fn remove_cdrom(
        &self,
        vm_path: &str,
        timeout: Duration,
    ) -> Result<VmOpResponse, ExportError>;
}

/// govc-backed hypervisor client.
pub struct GovcClient {
    binary: String,
}

impl GovcClient {
    pub fn new() -> Self {
        Self {
            binary: "govc".to_string(),
        }
    }

    async fn run(&self, args: &[&str], timeout: Duration) -> Result<String, ExportError> {
        debug!(subcommand = args.first().unwrap_or(&""), "running govc");
        let output = tokio::time::timeout(
            timeout,
            tokio::process::Command::new(&self.binary).args(args).output(),
        )
        .await
        .map_err(|_| {
            ExportError::Internal(format!(
                "govc {} timed out after {:?}",
                args.first().unwrap_or(&""),
                timeout
            ))
        })?
        .map_err(|e| ExportError::Internal(format!("failed to run govc: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ExportError::Internal(format!(
                "govc {} failed: {}",
                args.first().unwrap_or(&""),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn op_response(vm_path: &str, operation: &str) -> VmOpResponse {
        VmOpResponse {
            vm_path: vm_path.to_string(),
            operation: operation.to_string(),
            success: true,
            message: String::new(),
        }
    }
}

impl Default for GovcClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HypervisorClient for GovcClient {
    async fn list_vms(&self, timeout: Duration) -> Result<Vec<VmSummary>, ExportError> {
        let stdout = self.run(&["find", "-type", "m"], timeout).await?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|path| VmSummary {
                name: path.rsplit('/').next().unwrap_or(path).to_string(),
                path: path.to_string(),
                power_state: None,
            })
            .collect())
    }

    async fn vm_info(&self, vm_path: &str, timeout: Duration) -> Result<VmInfo, ExportError> {
        let stdout = self.run(&["vm.info", "-json", vm_path], timeout).await?;
        let value: serde_json::Value = serde_json::from_str(&stdout)
            .map_err(|e| ExportError::Internal(format!("unparseable vm.info output: {}", e)))?;
        parse_vm_info(&value, vm_path)
    }

    async fn shutdown_vm(
        &self,
        vm_path: &str,
        timeout: Duration,
    ) -> Result<VmOpResponse, ExportError> {
        self.run(&["vm.power", "-s", vm_path], timeout).await?;
        Ok(Self::op_response(vm_path, "shutdown"))
    }

    async fn poweroff_vm(
        &self,
        vm_path: &str,
        timeout: Duration,
    ) -> Result<VmOpResponse, ExportError> {
        self.run(&["vm.power", "-off", vm_path], timeout).await?;
        Ok(Self::op_response(vm_path, "poweroff"))
    }

    async fn remove_cdrom(
        &self,
        vm_path: &str,
        timeout: Duration,
    ) -> Result<VmOpResponse, ExportError> {
        self.run(&["device.cdrom.eject", "-vm", vm_path], timeout)
            .await?;
        Ok(Self::op_response(vm_path, "remove-cdrom"))
    }
}

/// govc changed its JSON key casing across releases; accept both.
fn field<'a>(value: &'a serde_json::Value, upper: &str, lower: &str) -> &'a serde_json::Value {
    let by_upper = &value[upper];
    if by_upper.is_null() {
        &value[lower]
    } else {
        by_upper
    }
}

fn parse_vm_info(value: &serde_json::Value, vm_path: &str) -> Result<VmInfo, ExportError> {
    let machines = field(value, "VirtualMachines", "virtualMachines");
    let vm = machines
        .get(0)
        .ok_or_else(|| ExportError::NotFound(vm_path.to_string()))?;

    let config = field(vm, "Config", "config");
    let runtime = field(vm, "Runtime", "runtime");
    let guest = field(vm, "Guest", "guest");
    let hardware = field(config, "Hardware", "hardware");

    Ok(VmInfo {
        name: field(vm, "Name", "name")
            .as_str()
            .unwrap_or_else(|| vm_path.rsplit('/').next().unwrap_or(vm_path))
            .to_string(),
        path: vm_path.to_string(),
        power_state: field(runtime, "PowerState", "powerState")
            .as_str()
            .map(String::from),
        guest_os: field(config, "GuestFullName", "guestFullName")
            .as_str()
            .map(String::from),
        num_cpu: field(hardware, "NumCPU", "numCPU").as_u64().map(|n| n as u32),
        memory_mb: field(hardware, "MemoryMB", "memoryMB").as_u64(),
        ip_address: field(guest, "IpAddress", "ipAddress")
            .as_str()
            .filter(|s| !s.is_empty())
            .map(String::from),
    })
}
