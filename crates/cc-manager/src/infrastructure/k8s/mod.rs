//! Kubernetes integration.
//!
//! - [`NodeStore`]: reads and patches the managed node and counts its pods
//! - [`NodeLabelWatcher`]: follows the desired-mode label across reconnects
//! - [`KubernetesError`]: failures of either

pub mod label_watcher;
#[cfg(test)]
pub(crate) mod mock;
pub mod node_store;
pub mod types;

pub use label_watcher::NodeLabelWatcher;
pub use label_watcher::WatchConfig;
pub use label_watcher::WatchCursor;
pub use node_store::KubeNodeStore;
pub use node_store::NodeStore;
pub use types::KubernetesError;
pub use types::NodeSnapshot;
pub use types::NodeWatchEvent;
