//! GPU discovery and CC mode control.
//!
//! The reconciler only talks to the [`GpuControl`] and [`GpuDevice`]
//! traits. Production uses [`admin_tools::AdminTools`], which drives the
//! NVIDIA gpu-admin-tools script per device.

use core::error::Error;

use async_trait::async_trait;
use error_stack::Report;

pub mod admin_tools;
#[cfg(test)]
pub(crate) mod mock;

pub use admin_tools::AdminTools;
pub use admin_tools::AdminToolsConfig;

#[derive(Debug, derive_more::Display)]
pub enum GpuError {
    #[display("Failed to discover GPUs: {message}")]
    Discovery { message: String },
    #[display("Failed to run gpu-admin-tools for GPU {bdf}")]
    ToolInvocation { bdf: String },
    #[display("gpu-admin-tools failed for GPU {bdf} ({status})")]
    ToolFailed { bdf: String, status: String },
    #[display("GPU {bdf} did not report a CC mode")]
    ModeUnavailable { bdf: String },
    #[display("GPU {bdf} did not come back within {seconds}s after reset")]
    BootTimeout { bdf: String, seconds: u64 },
}

impl Error for GpuError {}

/// One CC-switchable GPU, addressed by its PCI bus/device/function.
#[async_trait]
pub trait GpuDevice: Send + Sync {
    fn bdf(&self) -> &str;

    /// Whether the device supports confidential computing at all.
    fn is_cc_capable(&self) -> bool;

    /// Current CC mode as reported by the device.
    async fn query_mode(&self) -> Result<String, Report<GpuError>>;

    /// Stage `mode`; it takes effect after [`reset`](Self::reset).
    async fn set_mode(&self, mode: &str) -> Result<(), Report<GpuError>>;

    async fn reset(&self) -> Result<(), Report<GpuError>>;

    /// Block until the device is usable again after a reset.
    async fn wait_for_boot(&self) -> Result<(), Report<GpuError>>;
}

#[async_trait]
pub trait GpuControl: Send + Sync {
    type Device: GpuDevice + 'static;

    /// All NVIDIA GPUs on the host, in a stable order.
    async fn discover(&self) -> Result<Vec<Self::Device>, Report<GpuError>>;
}
