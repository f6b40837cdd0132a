use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::api::Patch;
use kube::api::PatchParams;
use kube::api::WatchEvent;
use kube::api::WatchParams;
use kube::Api;
use kube::Client;
use serde_json::json;
use tracing::warn;

use crate::infrastructure::k8s::types::KubernetesError;
use crate::infrastructure::k8s::types::NodeEventStream;
use crate::infrastructure::k8s::types::NodeSnapshot;
use crate::infrastructure::k8s::types::NodeWatchEvent;

/// Attempts made by [`update_labels`] before a conflict is reported.
pub const LABEL_UPDATE_ATTEMPTS: u32 = 3;

/// Upper bound accepted by the API server for a watch request timeout.
const MAX_WATCH_TIMEOUT_SECS: u32 = 294;

/// Access to the one node this process manages, plus the pods scheduled on it.
#[async_trait]
pub trait NodeStore: Send + Sync {
    fn node_name(&self) -> &str;

    async fn get(&self) -> Result<NodeSnapshot, Report<KubernetesError>>;

    /// Merge `labels` into the node's labels.
    ///
    /// With a `resource_version` precondition the write is rejected with
    /// [`KubernetesError::Conflict`] if the node changed since that version.
    async fn patch_labels(
        &self,
        labels: &BTreeMap<String, String>,
        resource_version: Option<&str>,
    ) -> Result<NodeSnapshot, Report<KubernetesError>>;

    /// Number of pods on this node in `namespace` carrying `app=<app>`.
    async fn count_pods(&self, namespace: &str, app: &str)
        -> Result<usize, Report<KubernetesError>>;

    /// Open a watch on the node starting after `resource_version`.
    ///
    /// The server closes the stream after `timeout`. An expired resource
    /// version surfaces as [`KubernetesError::ResourceVersionExpired`].
    async fn watch(
        &self,
        resource_version: &str,
        timeout: Duration,
    ) -> Result<NodeEventStream, Report<KubernetesError>>;
}

/// Read-modify-write of node labels that retries when another writer wins.
pub async fn update_labels<S: NodeStore + ?Sized>(
    store: &S,
    labels: &BTreeMap<String, String>,
) -> Result<NodeSnapshot, Report<KubernetesError>> {
    let mut attempt = 1;
    loop {
        let current = store.get().await?;
        match store
            .patch_labels(labels, Some(&current.resource_version))
            .await
        {
            Ok(updated) => return Ok(updated),
            Err(e) if e.current_context().is_conflict() && attempt < LABEL_UPDATE_ATTEMPTS => {
                warn!(
                    attempt,
                    resource_version = %current.resource_version,
                    "Node changed while updating labels, retrying"
                );
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// [`NodeStore`] backed by the Kubernetes API.
pub struct KubeNodeStore {
    client: Client,
    nodes: Api<Node>,
    node_name: String,
}

impl KubeNodeStore {
    pub fn new(client: Client, node_name: impl Into<String>) -> Self {
        Self {
            nodes: Api::all(client.clone()),
            client,
            node_name: node_name.into(),
        }
    }

    fn read_failed(&self) -> KubernetesError {
        KubernetesError::NodeReadFailed {
            node: self.node_name.clone(),
        }
    }
}

#[async_trait]
impl NodeStore for KubeNodeStore {
    fn node_name(&self) -> &str {
        &self.node_name
    }

    async fn get(&self) -> Result<NodeSnapshot, Report<KubernetesError>> {
        let node = self
            .nodes
            .get(&self.node_name)
            .await
            .change_context_lazy(|| self.read_failed())?;
        Ok(node.into())
    }

    async fn patch_labels(
        &self,
        labels: &BTreeMap<String, String>,
        resource_version: Option<&str>,
    ) -> Result<NodeSnapshot, Report<KubernetesError>> {
        let mut metadata = json!({ "labels": labels });
        if let Some(resource_version) = resource_version {
            metadata["resourceVersion"] = json!(resource_version);
        }
        let patch = json!({ "metadata": metadata });

        match self
            .nodes
            .patch(&self.node_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(node) => Ok(node.into()),
            Err(kube::Error::Api(response)) if response.code == 409 => {
                Err(Report::new(KubernetesError::Conflict {
                    node: self.node_name.clone(),
                })
                .attach_printable(response.message))
            }
            Err(e) => Err(Report::new(e).change_context(KubernetesError::PatchFailed {
                node: self.node_name.clone(),
            })),
        }
    }

    async fn count_pods(
        &self,
        namespace: &str,
        app: &str,
    ) -> Result<usize, Report<KubernetesError>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default()
            .fields(&format!("spec.nodeName={}", self.node_name))
            .labels(&format!("app={app}"));

        let list = pods
            .list(&params)
            .await
            .change_context_lazy(|| KubernetesError::PodListFailed {
                namespace: namespace.to_string(),
                app: app.to_string(),
            })?;
        Ok(list.items.len())
    }

    async fn watch(
        &self,
        resource_version: &str,
        timeout: Duration,
    ) -> Result<NodeEventStream, Report<KubernetesError>> {
        let timeout_secs = u32::try_from(timeout.as_secs())
            .unwrap_or(MAX_WATCH_TIMEOUT_SECS)
            .min(MAX_WATCH_TIMEOUT_SECS);
        let params = WatchParams::default()
            .fields(&format!("metadata.name={}", self.node_name))
            .timeout(timeout_secs);

        let stream = match self.nodes.watch(&params, resource_version).await {
            Ok(stream) => stream,
            Err(kube::Error::Api(response)) if response.code == 410 => {
                return Err(Report::new(KubernetesError::ResourceVersionExpired {
                    resource_version: resource_version.to_string(),
                })
                .attach_printable(response.message));
            }
            Err(e) => {
                return Err(Report::new(e).change_context(KubernetesError::WatchFailed {
                    message: "failed to open node watch".to_string(),
                }));
            }
        };

        let requested_version = resource_version.to_string();
        let events = stream.map(move |event| match event {
            Ok(WatchEvent::Added(node)) | Ok(WatchEvent::Modified(node)) => {
                Ok(NodeWatchEvent::Applied(node.into()))
            }
            Ok(WatchEvent::Deleted(node)) => Ok(NodeWatchEvent::Deleted {
                resource_version: node.metadata.resource_version.unwrap_or_default(),
            }),
            Ok(WatchEvent::Bookmark(bookmark)) => Ok(NodeWatchEvent::Bookmark {
                resource_version: bookmark.metadata.resource_version,
            }),
            Ok(WatchEvent::Error(response)) if response.code == 410 => {
                Err(Report::new(KubernetesError::ResourceVersionExpired {
                    resource_version: requested_version.clone(),
                })
                .attach_printable(response.message))
            }
            Ok(WatchEvent::Error(response)) => Err(Report::new(KubernetesError::WatchFailed {
                message: format!("{} ({})", response.message, response.code),
            })),
            Err(e) => Err(Report::new(e).change_context(KubernetesError::WatchFailed {
                message: "watch stream error".to_string(),
            })),
        });

        Ok(events.boxed())
    }
}
