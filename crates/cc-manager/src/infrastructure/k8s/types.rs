use core::error::Error;
use std::collections::BTreeMap;

use error_stack::Report;
use futures::stream::BoxStream;
use k8s_openapi::api::core::v1::Node;

/// Labels and resource version of the managed node at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeSnapshot {
    pub labels: BTreeMap<String, String>,
    pub resource_version: String,
}

impl NodeSnapshot {
    /// Value of `key`, with an absent label reading as the empty string.
    pub fn label(&self, key: &str) -> &str {
        self.labels.get(key).map(String::as_str).unwrap_or_default()
    }
}

impl From<Node> for NodeSnapshot {
    fn from(node: Node) -> Self {
        Self {
            labels: node.metadata.labels.unwrap_or_default(),
            resource_version: node.metadata.resource_version.unwrap_or_default(),
        }
    }
}

/// A single event observed on the node watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeWatchEvent {
    /// The node was added or modified.
    Applied(NodeSnapshot),
    /// The node was deleted; only the resource version is of interest.
    Deleted { resource_version: String },
    /// Progress notification from the API server.
    Bookmark { resource_version: String },
}

pub type NodeEventStream = BoxStream<'static, Result<NodeWatchEvent, Report<KubernetesError>>>;

/// Errors that can occur during Kubernetes operations.
#[derive(Debug, derive_more::Display)]
pub enum KubernetesError {
    #[display("Failed to connect to Kubernetes API: {message}")]
    ConnectionFailed { message: String },
    #[display("Failed to read node {node}")]
    NodeReadFailed { node: String },
    #[display("Failed to patch labels on node {node}")]
    PatchFailed { node: String },
    #[display("Node {node} was modified concurrently")]
    Conflict { node: String },
    #[display("Failed to list pods with app={app} in namespace {namespace}")]
    PodListFailed { namespace: String, app: String },
    #[display("Failed to watch node: {message}")]
    WatchFailed { message: String },
    #[display("Resource version {resource_version} is too old")]
    ResourceVersionExpired { resource_version: String },
    #[display("Watch failed {failures} times consecutively")]
    WatchFailureThreshold { failures: u32 },
}

impl KubernetesError {
    /// The watch cursor expired and a full re-read is required.
    pub fn is_gone(&self) -> bool {
        matches!(self, Self::ResourceVersionExpired { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

impl Error for KubernetesError {}
