use std::convert::Infallible;
use std::path::PathBuf;

use clap::Parser;
use utils::version;

/// `true` in any letter case enables the flag; every other value disables it.
fn parse_enabled(value: &str) -> Result<bool, Infallible> {
    Ok(value.trim().eq_ignore_ascii_case("true"))
}

#[derive(Parser, Debug, Clone)]
#[command(about, long_about = None, version = &**version::VERSION)]
pub struct Cli {
    #[arg(
        long,
        env = "NODE_NAME",
        value_parser = clap::builder::NonEmptyStringValueParser::new(),
        help = "Name of the Kubernetes node this manager runs on"
    )]
    pub node_name: String,

    #[arg(
        short = 'm',
        long,
        env = "DEFAULT_CC_MODE",
        default_value = "on",
        help = "CC mode applied when the nvidia.com/cc.mode label is empty; empty disables the fallback"
    )]
    pub default_cc_mode: String,

    #[arg(
        long,
        env = "OPERATOR_NAMESPACE",
        default_value = "gpu-operator",
        help = "Namespace the GPU operator deploys its components in"
    )]
    pub operator_namespace: String,

    #[arg(
        long,
        env = "EVICT_OPERATOR_COMPONENTS",
        default_value = "true",
        value_parser = parse_enabled,
        action = clap::ArgAction::Set,
        help = "Pause GPU operator components while switching CC mode"
    )]
    pub evict_operator_components: bool,

    #[arg(
        long,
        env = "CC_READINESS_FILE",
        value_hint = clap::ValueHint::FilePath,
        default_value = "/run/nvidia/validations/.cc-manager-ctr-ready",
        help = "File created once the first reconciliation has finished"
    )]
    pub readiness_file: PathBuf,

    #[arg(
        long,
        env = "KUBECONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to kubeconfig file (defaults to cluster config or ~/.kube/config)"
    )]
    pub kubeconfig: Option<PathBuf>,

    #[arg(long, help = "Enable debug logging")]
    pub debug: bool,

    #[arg(
        long,
        env = "CC_MANAGER_LOG_PATH",
        value_hint = clap::ValueHint::DirPath,
        help = "Directory for a daily-rolled log file in addition to stderr"
    )]
    pub log_path: Option<PathBuf>,

    #[arg(
        long,
        env = "GPU_ADMIN_TOOLS",
        value_hint = clap::ValueHint::FilePath,
        default_value = "/usr/local/gpu-admin-tools/nvidia_gpu_tools.py",
        help = "gpu-admin-tools executable used to query and switch CC mode"
    )]
    pub gpu_admin_tools: PathBuf,

    #[arg(
        long,
        env = "SYSFS_PCI_ROOT",
        value_hint = clap::ValueHint::DirPath,
        default_value = "/sys/bus/pci/devices",
        help = "Directory listing PCI devices"
    )]
    pub sysfs_pci_root: PathBuf,

    #[arg(
        long,
        env = "CC_WATCH_TIMEOUT_SECS",
        default_value_t = 290,
        value_parser = clap::value_parser!(u64).range(1..295),
        help = "Server-side timeout of one node watch connection"
    )]
    pub watch_timeout_secs: u64,

    #[arg(
        long,
        env = "CC_RECONNECT_DELAY_SECS",
        default_value_t = 5,
        help = "Delay before reconnecting after a failed watch"
    )]
    pub reconnect_delay_secs: u64,

    #[arg(
        long,
        env = "CC_MAX_WATCH_FAILURES",
        default_value_t = 10,
        value_parser = clap::value_parser!(u32).range(1..),
        help = "Consecutive watch failures before giving up"
    )]
    pub max_watch_failures: u32,

    #[arg(
        long,
        env = "CC_EVICTION_TIMEOUT_SECS",
        default_value_t = 300,
        help = "How long to wait for one operator component's pods to terminate"
    )]
    pub eviction_timeout_secs: u64,

    #[arg(
        long,
        env = "CC_POD_POLL_INTERVAL_SECS",
        default_value_t = 2,
        value_parser = clap::value_parser!(u64).range(1..),
        help = "Interval between pod listings while waiting for eviction"
    )]
    pub pod_poll_interval_secs: u64,

    #[arg(
        long,
        env = "CC_BOOT_TIMEOUT_SECS",
        default_value_t = 120,
        help = "How long to wait for a GPU to come back after reset"
    )]
    pub boot_timeout_secs: u64,
}
