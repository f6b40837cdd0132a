//! [`GpuControl`] implementation on top of NVIDIA gpu-admin-tools.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::GpuControl;
use super::GpuDevice;
use super::GpuError;

const NVIDIA_VENDOR_ID: &str = "0x10de";
/// PCI base class of display controllers.
const DISPLAY_CLASS_PREFIX: &str = "0x03";
const CC_MODE_MARKER: &str = "CC mode is ";

#[derive(Debug, Clone)]
pub struct AdminToolsConfig {
    /// Path of the `nvidia_gpu_tools.py` executable.
    pub tool_path: PathBuf,
    /// Directory holding one entry per PCI device.
    pub sysfs_pci_root: PathBuf,
    pub boot_timeout: Duration,
    pub boot_poll_interval: Duration,
}

impl Default for AdminToolsConfig {
    fn default() -> Self {
        Self {
            tool_path: PathBuf::from("/usr/local/gpu-admin-tools/nvidia_gpu_tools.py"),
            sysfs_pci_root: PathBuf::from("/sys/bus/pci/devices"),
            boot_timeout: Duration::from_secs(120),
            boot_poll_interval: Duration::from_secs(1),
        }
    }
}

pub struct AdminTools {
    config: Arc<AdminToolsConfig>,
}

impl AdminTools {
    pub fn new(config: AdminToolsConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

#[async_trait]
impl GpuControl for AdminTools {
    type Device = AdminToolsDevice;

    async fn discover(&self) -> Result<Vec<AdminToolsDevice>, Report<GpuError>> {
        let bdfs = find_nvidia_gpus(&self.config.sysfs_pci_root).await?;
        let mut devices = Vec::with_capacity(bdfs.len());
        for bdf in bdfs {
            let mut device = AdminToolsDevice {
                bdf,
                cc_capable: false,
                config: self.config.clone(),
            };
            match device.query_mode().await {
                Ok(mode) => {
                    info!(bdf = %device.bdf, mode = %mode, "Found CC-capable GPU");
                    device.cc_capable = true;
                }
                Err(e) => warn!(bdf = %device.bdf, "GPU does not support CC mode query: {e:?}"),
            }
            devices.push(device);
        }
        Ok(devices)
    }
}

/// BDFs of NVIDIA display controllers under `pci_root`, sorted.
async fn find_nvidia_gpus(pci_root: &Path) -> Result<Vec<String>, Report<GpuError>> {
    let discovery_failed = || GpuError::Discovery {
        message: format!("cannot read {}", pci_root.display()),
    };
    let mut entries = tokio::fs::read_dir(pci_root)
        .await
        .change_context_lazy(discovery_failed)?;

    let mut bdfs = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .change_context_lazy(discovery_failed)?
    {
        let path = entry.path();
        let (Some(vendor), Some(class)) = (
            read_attribute(&path, "vendor").await,
            read_attribute(&path, "class").await,
        ) else {
            continue;
        };
        if vendor == NVIDIA_VENDOR_ID && class.starts_with(DISPLAY_CLASS_PREFIX) {
            bdfs.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    bdfs.sort();
    debug!(count = bdfs.len(), "Discovered NVIDIA GPUs");
    Ok(bdfs)
}

async fn read_attribute(device_dir: &Path, name: &str) -> Option<String> {
    tokio::fs::read_to_string(device_dir.join(name))
        .await
        .ok()
        .map(|value| value.trim().to_lowercase())
}

/// The mode token following the last `CC mode is ` in tool output.
fn parse_cc_mode(output: &str) -> Option<String> {
    let start = output.rfind(CC_MODE_MARKER)? + CC_MODE_MARKER.len();
    let token = output[start..]
        .split_whitespace()
        .next()?
        .trim_end_matches(|c: char| !c.is_ascii_alphanumeric());
    (!token.is_empty()).then(|| token.to_string())
}

pub struct AdminToolsDevice {
    bdf: String,
    cc_capable: bool,
    config: Arc<AdminToolsConfig>,
}

impl AdminToolsDevice {
    async fn run_tool(&self, args: &[&str]) -> Result<String, Report<GpuError>> {
        debug!(bdf = %self.bdf, ?args, "Running gpu-admin-tools");
        let output = Command::new(&self.config.tool_path)
            .arg(format!("--gpu-bdf={}", self.bdf))
            .args(args)
            .output()
            .await
            .change_context_lazy(|| GpuError::ToolInvocation {
                bdf: self.bdf.clone(),
            })
            .attach_printable_lazy(|| format!("tool: {}", self.config.tool_path.display()))?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));

        if !output.status.success() {
            return Err(Report::new(GpuError::ToolFailed {
                bdf: self.bdf.clone(),
                status: output.status.to_string(),
            })
            .attach_printable(text));
        }
        Ok(text)
    }

    fn device_dir(&self) -> PathBuf {
        self.config.sysfs_pci_root.join(&self.bdf)
    }
}

#[async_trait]
impl GpuDevice for AdminToolsDevice {
    fn bdf(&self) -> &str {
        &self.bdf
    }

    fn is_cc_capable(&self) -> bool {
        self.cc_capable
    }

    async fn query_mode(&self) -> Result<String, Report<GpuError>> {
        let output = self.run_tool(&["--query-cc-mode"]).await?;
        parse_cc_mode(&output).ok_or_else(|| {
            Report::new(GpuError::ModeUnavailable {
                bdf: self.bdf.clone(),
            })
            .attach_printable(output)
        })
    }

    async fn set_mode(&self, mode: &str) -> Result<(), Report<GpuError>> {
        let arg = format!("--set-cc-mode={mode}");
        self.run_tool(&[arg.as_str()]).await?;
        Ok(())
    }

    async fn reset(&self) -> Result<(), Report<GpuError>> {
        self.run_tool(&["--reset-with-os"]).await?;
        Ok(())
    }

    async fn wait_for_boot(&self) -> Result<(), Report<GpuError>> {
        let deadline = Instant::now() + self.config.boot_timeout;
        loop {
            let present = tokio::fs::try_exists(self.device_dir())
                .await
                .unwrap_or(false);
            if present && self.query_mode().await.is_ok() {
                debug!(bdf = %self.bdf, "GPU is back after reset");
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Report::new(GpuError::BootTimeout {
                    bdf: self.bdf.clone(),
                    seconds: self.config.boot_timeout.as_secs(),
                }));
            }
            tokio::time::sleep(self.config.boot_poll_interval).await;
        }
    }
}
