//! Command line configuration and its conversion into component configs.

pub mod cli;

use std::path::PathBuf;
use std::time::Duration;

pub use cli::Cli;

use crate::domain::eviction::EvictionConfig;
use crate::domain::labels::CC_MODE_LABEL;
use crate::domain::reconciler::ReconcilerConfig;
use crate::infrastructure::gpu::AdminToolsConfig;
use crate::infrastructure::k8s::WatchConfig;

/// Everything [`Application`](crate::app::Application) needs besides its backends.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub watch: WatchConfig,
    pub eviction: EvictionConfig,
    pub reconciler: ReconcilerConfig,
    pub readiness_file: PathBuf,
}

impl From<&Cli> for AppConfig {
    fn from(cli: &Cli) -> Self {
        Self {
            watch: cli.into(),
            eviction: cli.into(),
            reconciler: cli.into(),
            readiness_file: cli.readiness_file.clone(),
        }
    }
}

impl From<&Cli> for WatchConfig {
    fn from(cli: &Cli) -> Self {
        Self {
            label_key: CC_MODE_LABEL.to_string(),
            timeout: Duration::from_secs(cli.watch_timeout_secs),
            reconnect_delay: Duration::from_secs(cli.reconnect_delay_secs),
            max_consecutive_failures: cli.max_watch_failures,
        }
    }
}

impl From<&Cli> for EvictionConfig {
    fn from(cli: &Cli) -> Self {
        Self {
            operator_namespace: cli.operator_namespace.clone(),
            component_timeout: Duration::from_secs(cli.eviction_timeout_secs),
            poll_interval: Duration::from_secs(cli.pod_poll_interval_secs),
        }
    }
}

impl From<&Cli> for ReconcilerConfig {
    fn from(cli: &Cli) -> Self {
        Self {
            default_mode: cli.default_cc_mode.trim().to_string(),
            evict_operator_components: cli.evict_operator_components,
        }
    }
}

impl From<&Cli> for AdminToolsConfig {
    fn from(cli: &Cli) -> Self {
        Self {
            tool_path: cli.gpu_admin_tools.clone(),
            sysfs_pci_root: cli.sysfs_pci_root.clone(),
            boot_timeout: Duration::from_secs(cli.boot_timeout_secs),
            ..Default::default()
        }
    }
}
