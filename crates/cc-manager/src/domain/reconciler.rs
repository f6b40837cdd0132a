//! Drives every GPU on the node to the desired CC mode.

use core::error::Error;
use std::sync::Arc;

use error_stack::Report;
use error_stack::ResultExt;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::domain::eviction::EvictionConfig;
use crate::domain::eviction::EvictionCoordinator;
use crate::domain::labels::CC_MODE_FAILED;
use crate::domain::reporter::StateReporter;
use crate::infrastructure::gpu::GpuControl;
use crate::infrastructure::gpu::GpuDevice;
use crate::infrastructure::k8s::node_store::NodeStore;

/// Mode that never requires CC support.
pub const CC_MODE_OFF: &str = "off";

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Mode applied when the node label is empty; may itself be empty.
    pub default_mode: String,
    /// Pause GPU operator components around a mode change.
    pub evict_operator_components: bool,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            default_mode: "on".to_string(),
            evict_operator_components: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Neither the label nor the default names a mode.
    NoMode,
    NoDevices,
    /// All GPUs were already in the desired mode.
    AlreadyApplied,
    Applied,
}

#[derive(Debug, derive_more::Display)]
pub enum ReconcileError {
    #[display("Failed to discover GPUs")]
    Discovery,
    #[display("GPUs without CC support cannot be set to '{mode}': {}", devices.join(", "))]
    NotCcCapable { mode: String, devices: Vec<String> },
    #[display("Failed to evict GPU operator components")]
    Eviction,
    #[display("Failed to set CC mode '{mode}' on GPU {bdf}")]
    Apply { bdf: String, mode: String },
    #[display("CC mode verification failed on GPU {bdf}: expected '{expected}', got '{actual}'")]
    VerificationMismatch {
        bdf: String,
        expected: String,
        actual: String,
    },
    #[display("Failed to reschedule GPU operator components")]
    Reschedule,
}

impl Error for ReconcileError {}

pub struct ModeReconciler<S, G> {
    gpu: Arc<G>,
    eviction: EvictionCoordinator<S>,
    reporter: StateReporter<S>,
    config: ReconcilerConfig,
}

impl<S: NodeStore, G: GpuControl> ModeReconciler<S, G> {
    pub fn new(
        store: Arc<S>,
        gpu: Arc<G>,
        eviction_config: EvictionConfig,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            gpu,
            eviction: EvictionCoordinator::new(store.clone(), eviction_config),
            reporter: StateReporter::new(store),
            config,
        }
    }

    /// The mode to apply for a label value.
    pub fn resolve_mode<'a>(&'a self, label_value: &'a str) -> &'a str {
        if label_value.is_empty() {
            &self.config.default_mode
        } else {
            label_value
        }
    }

    /// Bring all GPUs to the mode named by `label_value`.
    ///
    /// # Errors
    ///
    /// - [`ReconcileError::NotCcCapable`] if a GPU cannot enter the mode;
    ///   nothing is changed in that case
    /// - [`ReconcileError::Eviction`] if operator components could not be
    ///   paused; no GPU is touched
    /// - [`ReconcileError::Apply`] or [`ReconcileError::VerificationMismatch`]
    ///   for the first GPU that failed; later GPUs are left alone and the
    ///   state label reads `failed`
    /// - [`ReconcileError::Reschedule`] if GPUs were switched but operator
    ///   components could not be restored
    #[tracing::instrument(skip(self))]
    pub async fn reconcile(
        &self,
        label_value: &str,
    ) -> Result<ReconcileOutcome, Report<ReconcileError>> {
        let mode = self.resolve_mode(label_value);
        if mode.is_empty() {
            info!("No CC mode requested and no default configured, skipping");
            return Ok(ReconcileOutcome::NoMode);
        }

        let devices = self
            .gpu
            .discover()
            .await
            .change_context(ReconcileError::Discovery)?;

        if mode != CC_MODE_OFF {
            let incapable: Vec<String> = devices
                .iter()
                .filter(|device| !device.is_cc_capable())
                .map(|device| device.bdf().to_string())
                .collect();
            if !incapable.is_empty() {
                return Err(Report::new(ReconcileError::NotCcCapable {
                    mode: mode.to_string(),
                    devices: incapable,
                }));
            }
        }

        if devices.is_empty() {
            warn!("No GPUs to configure");
            return Ok(ReconcileOutcome::NoDevices);
        }

        if self.mode_is_set(&devices, mode).await {
            info!(mode, "All GPUs already in requested CC mode");
            self.reporter.report(mode).await;
            return Ok(ReconcileOutcome::AlreadyApplied);
        }

        if self.config.evict_operator_components {
            self.apply_with_eviction(&devices, mode).await
        } else {
            self.apply_all(&devices, mode).await
        }
    }

    async fn mode_is_set(&self, devices: &[G::Device], mode: &str) -> bool {
        for device in devices {
            match device.query_mode().await {
                Ok(current) if current == mode => {}
                Ok(_) => return false,
                Err(e) => {
                    error!(bdf = device.bdf(), "Failed to query CC mode: {e:?}");
                    return false;
                }
            }
        }
        true
    }

    async fn apply_with_eviction(
        &self,
        devices: &[G::Device],
        mode: &str,
    ) -> Result<ReconcileOutcome, Report<ReconcileError>> {
        let original = self
            .eviction
            .fetch_component_labels()
            .await
            .change_context(ReconcileError::Eviction)?;
        self.eviction
            .evict(&original)
            .await
            .change_context(ReconcileError::Eviction)?;

        let result = self.apply_all(devices, mode).await;

        if let Err(e) = self.eviction.reschedule(&original).await {
            error!("Failed to reschedule GPU operator components: {e:?}");
            if result.is_ok() {
                return Err(e.change_context(ReconcileError::Reschedule));
            }
        }
        result
    }

    async fn apply_all(
        &self,
        devices: &[G::Device],
        mode: &str,
    ) -> Result<ReconcileOutcome, Report<ReconcileError>> {
        info!(mode, count = devices.len(), "Setting CC mode");
        for device in devices {
            if let Err(e) = self.apply_device(device, mode).await {
                error!(bdf = device.bdf(), "{e:?}");
                self.reporter.report(CC_MODE_FAILED).await;
                return Err(e);
            }
        }
        info!(mode, "CC mode set on all GPUs");
        self.reporter.report(mode).await;
        Ok(ReconcileOutcome::Applied)
    }

    #[tracing::instrument(skip_all, fields(bdf = %device.bdf(), mode = %mode))]
    async fn apply_device(
        &self,
        device: &G::Device,
        mode: &str,
    ) -> Result<(), Report<ReconcileError>> {
        let bdf = device.bdf();
        let failed = || ReconcileError::Apply {
            bdf: bdf.to_string(),
            mode: mode.to_string(),
        };

        let current = device.query_mode().await.change_context_lazy(failed)?;
        if current == mode {
            info!(bdf, mode, "GPU already in requested CC mode, skipping");
            return Ok(());
        }

        info!(bdf, from = %current, to = mode, "Switching CC mode");
        device.set_mode(mode).await.change_context_lazy(failed)?;
        device.reset().await.change_context_lazy(failed)?;
        device.wait_for_boot().await.change_context_lazy(failed)?;

        let actual = device.query_mode().await.change_context_lazy(failed)?;
        if actual != mode {
            return Err(Report::new(ReconcileError::VerificationMismatch {
                bdf: bdf.to_string(),
                expected: mode.to_string(),
                actual,
            }));
        }
        info!(bdf, mode, "CC mode set");
        Ok(())
    }
}
