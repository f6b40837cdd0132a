//! Scriptable GPUs for reconciler tests.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use async_trait::async_trait;
use error_stack::Report;

use super::GpuControl;
use super::GpuDevice;
use super::GpuError;

/// Operations performed on mock devices, shared across all of them.
pub(crate) type OpLog = Arc<Mutex<Vec<String>>>;

#[derive(Debug, Default)]
pub(crate) struct MockDeviceState {
    pub mode: String,
    pub staged: Option<String>,
    /// Operation name (`query`, `set`, `reset`, `boot`) that fails.
    pub fail_on: Option<&'static str>,
    /// Mode the device comes back with after reset, regardless of what was staged.
    pub mode_after_reset: Option<String>,
}

#[derive(Clone)]
pub(crate) struct MockDevice {
    bdf: String,
    cc_capable: bool,
    state: Arc<Mutex<MockDeviceState>>,
    log: OpLog,
}

impl MockDevice {
    pub(crate) fn state(&self) -> MutexGuard<'_, MockDeviceState> {
        self.state.lock().expect("device lock")
    }

    pub(crate) fn mode(&self) -> String {
        self.state().mode.clone()
    }

    fn record(&self, op: &str) -> Result<(), Report<GpuError>> {
        self.log
            .lock()
            .expect("log lock")
            .push(format!("{} {op}", self.bdf));
        if self.state().fail_on == Some(op) {
            return Err(Report::new(GpuError::ToolFailed {
                bdf: self.bdf.clone(),
                status: "exit status: 1".to_string(),
            }));
        }
        Ok(())
    }
}

#[async_trait]
impl GpuDevice for MockDevice {
    fn bdf(&self) -> &str {
        &self.bdf
    }

    fn is_cc_capable(&self) -> bool {
        self.cc_capable
    }

    async fn query_mode(&self) -> Result<String, Report<GpuError>> {
        self.record("query")?;
        Ok(self.mode())
    }

    async fn set_mode(&self, mode: &str) -> Result<(), Report<GpuError>> {
        self.record("set")?;
        self.state().staged = Some(mode.to_string());
        Ok(())
    }

    async fn reset(&self) -> Result<(), Report<GpuError>> {
        self.record("reset")?;
        let mut state = self.state();
        let next = state.mode_after_reset.take().or_else(|| state.staged.take());
        if let Some(mode) = next {
            state.mode = mode;
        }
        Ok(())
    }

    async fn wait_for_boot(&self) -> Result<(), Report<GpuError>> {
        self.record("boot")
    }
}

#[derive(Default)]
pub(crate) struct MockGpu {
    devices: Vec<MockDevice>,
    log: OpLog,
    pub fail_discovery: bool,
}

impl MockGpu {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Add a device and return a handle sharing its state.
    pub(crate) fn add_device(&mut self, bdf: &str, mode: &str, cc_capable: bool) -> MockDevice {
        let device = MockDevice {
            bdf: bdf.to_string(),
            cc_capable,
            state: Arc::new(Mutex::new(MockDeviceState {
                mode: mode.to_string(),
                ..Default::default()
            })),
            log: self.log.clone(),
        };
        self.devices.push(device.clone());
        device
    }

    pub(crate) fn log(&self) -> Vec<String> {
        self.log.lock().expect("log lock").clone()
    }

    /// Logged operations other than queries.
    pub(crate) fn mutations(&self) -> Vec<String> {
        self.log()
            .into_iter()
            .filter(|entry| !entry.ends_with(" query"))
            .collect()
    }
}

#[async_trait]
impl GpuControl for MockGpu {
    type Device = MockDevice;

    async fn discover(&self) -> Result<Vec<MockDevice>, Report<GpuError>> {
        if self.fail_discovery {
            return Err(Report::new(GpuError::Discovery {
                message: "mock discovery failure".to_string(),
            }));
        }
        Ok(self.devices.clone())
    }
}
