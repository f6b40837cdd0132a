//! Taking GPU operator components off the node and bringing them back.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use tokio::time::Instant;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::domain::labels;
use crate::domain::labels::ComponentLabel;
use crate::domain::labels::Deployment;
use crate::infrastructure::k8s::node_store::update_labels;
use crate::infrastructure::k8s::node_store::NodeStore;
use crate::infrastructure::k8s::types::KubernetesError;
use crate::infrastructure::k8s::types::NodeSnapshot;

/// A GPU operator component that holds the GPUs while running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperatorComponent {
    /// Node label controlling whether the component is deployed.
    pub deploy_label: &'static str,
    /// Value of the `app` label on the component's pods.
    pub app: &'static str,
}

pub const OPERATOR_COMPONENTS: [OperatorComponent; 5] = [
    OperatorComponent {
        deploy_label: "nvidia.com/gpu.deploy.vfio-manager",
        app: "nvidia-vfio-manager",
    },
    OperatorComponent {
        deploy_label: "nvidia.com/gpu.deploy.vgpu-manager",
        app: "nvidia-vgpu-manager",
    },
    OperatorComponent {
        deploy_label: "nvidia.com/gpu.deploy.sandbox-validator",
        app: "nvidia-sandbox-validator",
    },
    OperatorComponent {
        deploy_label: "nvidia.com/gpu.deploy.sandbox-device-plugin",
        app: "nvidia-sandbox-device-plugin-daemonset",
    },
    OperatorComponent {
        deploy_label: "nvidia.com/gpu.deploy.vgpu-device-manager",
        app: "nvidia-vgpu-device-manager",
    },
];

/// Deploy label values of every operator component, absent ones as `""`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentLabels {
    values: Vec<(OperatorComponent, String)>,
}

impl ComponentLabels {
    pub fn from_snapshot(snapshot: &NodeSnapshot) -> Self {
        let values = OPERATOR_COMPONENTS
            .iter()
            .map(|component| {
                (
                    *component,
                    snapshot.label(component.deploy_label).to_string(),
                )
            })
            .collect();
        Self { values }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&OperatorComponent, &str)> {
        self.values
            .iter()
            .map(|(component, value)| (component, value.as_str()))
    }

    #[cfg(test)]
    pub fn get(&self, component: &OperatorComponent) -> Option<&str> {
        self.iter()
            .find(|(c, _)| *c == component)
            .map(|(_, value)| value)
    }

    fn rewritten(&self, rewrite: fn(&str) -> String) -> BTreeMap<String, String> {
        self.iter()
            .map(|(component, value)| (component.deploy_label.to_string(), rewrite(value)))
            .collect()
    }

    /// Labels that keep every component off the node.
    pub fn paused(&self) -> BTreeMap<String, String> {
        self.rewritten(labels::pause)
    }

    /// Labels that let every component run again.
    pub fn unpaused(&self) -> BTreeMap<String, String> {
        self.rewritten(labels::unpause)
    }
}

#[derive(Debug, Clone)]
pub struct EvictionConfig {
    /// Namespace the GPU operator runs its components in.
    pub operator_namespace: String,
    /// How long to wait for one component's pods to disappear.
    pub component_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            operator_namespace: "gpu-operator".to_string(),
            component_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(2),
        }
    }
}

pub struct EvictionCoordinator<S> {
    store: Arc<S>,
    config: EvictionConfig,
}

impl<S: NodeStore> EvictionCoordinator<S> {
    pub fn new(store: Arc<S>, config: EvictionConfig) -> Self {
        Self { store, config }
    }

    /// Current deploy labels of all operator components.
    pub async fn fetch_component_labels(&self) -> Result<ComponentLabels, Report<KubernetesError>> {
        let snapshot = self.store.get().await?;
        Ok(ComponentLabels::from_snapshot(&snapshot))
    }

    /// Pause every component and wait for the pods of each component that
    /// had a label value to terminate.
    ///
    /// A component whose pods outlive the timeout is logged and skipped.
    ///
    /// # Errors
    ///
    /// - [`KubernetesError`] if the paused labels cannot be written
    #[tracing::instrument(skip_all, fields(node = %self.store.node_name()))]
    pub async fn evict(&self, original: &ComponentLabels) -> Result<(), Report<KubernetesError>> {
        info!("Pausing GPU operator components on node {}", self.store.node_name());
        update_labels(self.store.as_ref(), &original.paused()).await?;

        let mut timed_out = Vec::new();
        for (component, value) in original.iter() {
            if ComponentLabel::decode(value).deployment() == &Deployment::Unset {
                debug!(app = component.app, "Component label unset, not waiting");
                continue;
            }
            if !self.wait_for_pods_deleted(component).await {
                timed_out.push(component.app);
            }
        }
        if timed_out.is_empty() {
            info!("GPU operator components paused");
        } else {
            warn!(?timed_out, "GPU operator components paused, some pods are still running");
        }
        Ok(())
    }

    /// Restore deploy labels to their unpaused values.
    ///
    /// # Errors
    ///
    /// - [`KubernetesError`] if the labels cannot be written
    pub async fn reschedule(&self, original: &ComponentLabels) -> Result<(), Report<KubernetesError>> {
        info!("Rescheduling GPU operator components on node {}", self.store.node_name());
        update_labels(self.store.as_ref(), &original.unpaused()).await?;
        Ok(())
    }

    /// Poll until no pods of `component` are left on the node. Returns
    /// `false` on timeout.
    async fn wait_for_pods_deleted(&self, component: &OperatorComponent) -> bool {
        let deadline = Instant::now() + self.config.component_timeout;
        info!(app = component.app, "Waiting for pods to be deleted");

        while Instant::now() < deadline {
            match self
                .store
                .count_pods(&self.config.operator_namespace, component.app)
                .await
            {
                Ok(0) => {
                    info!(app = component.app, "All pods deleted");
                    return true;
                }
                Ok(remaining) => debug!(app = component.app, remaining, "Pods still running"),
                Err(e) => warn!(app = component.app, "Failed to list pods: {e:?}"),
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }

        warn!(
            app = component.app,
            timeout = ?self.config.component_timeout,
            "Timed out waiting for pods to be deleted"
        );
        false
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::infrastructure::k8s::mock::MockNodeStore;

    const VFIO: &str = "nvidia.com/gpu.deploy.vfio-manager";
    const VGPU: &str = "nvidia.com/gpu.deploy.vgpu-manager";
    const VALIDATOR: &str = "nvidia.com/gpu.deploy.sandbox-validator";
    const DEVICE_PLUGIN: &str = "nvidia.com/gpu.deploy.sandbox-device-plugin";
    const DEVICE_MANAGER: &str = "nvidia.com/gpu.deploy.vgpu-device-manager";

    fn coordinator(store: Arc<MockNodeStore>) -> EvictionCoordinator<MockNodeStore> {
        EvictionCoordinator::new(
            store,
            EvictionConfig {
                component_timeout: Duration::from_secs(10),
                ..Default::default()
            },
        )
    }

    #[test(tokio::test)]
    async fn fetch_reads_absent_labels_as_empty() {
        let store = Arc::new(MockNodeStore::new("gpu-node-1").with_labels([(VFIO, "true")]));

        let labels = coordinator(store)
            .fetch_component_labels()
            .await
            .expect("fetch");

        assert_eq!(labels.get(&OPERATOR_COMPONENTS[0]), Some("true"));
        assert_eq!(labels.get(&OPERATOR_COMPONENTS[1]), Some(""));
        assert_eq!(labels.iter().count(), OPERATOR_COMPONENTS.len());
    }

    #[test(tokio::test(start_paused = true))]
    async fn evict_pauses_labels_and_skips_unset_components() {
        let store = Arc::new(
            MockNodeStore::new("gpu-node-1")
                .with_labels([
                    (VFIO, "true"),
                    (VGPU, "false"),
                    (VALIDATOR, "custom"),
                    (DEVICE_PLUGIN, "true"),
                ])
                .with_pod_counts("nvidia-vfio-manager", &[1, 1, 0])
                .with_pod_counts("nvidia-sandbox-validator", &[0]),
        );
        let coordinator = coordinator(store.clone());
        let original = coordinator.fetch_component_labels().await.expect("fetch");

        coordinator.evict(&original).await.expect("evict");

        let state = store.state();
        assert_eq!(state.labels[VFIO].as_str(), "paused-for-cc-mode-change");
        assert_eq!(state.labels[VGPU].as_str(), "false");
        assert_eq!(state.labels[VALIDATOR].as_str(), "custom_paused-for-cc-mode-change");
        assert_eq!(state.labels[DEVICE_PLUGIN].as_str(), "paused-for-cc-mode-change");
        assert_eq!(state.labels[DEVICE_MANAGER].as_str(), "");
        assert_eq!(
            state.pod_queries.iter().map(String::as_str).collect::<Vec<_>>(),
            vec![
                "nvidia-vfio-manager",
                "nvidia-vfio-manager",
                "nvidia-vfio-manager",
                "nvidia-vgpu-manager",
                "nvidia-sandbox-validator",
                "nvidia-sandbox-device-plugin-daemonset",
            ]
        );
    }

    #[test(tokio::test(start_paused = true))]
    async fn evict_gives_up_on_component_after_timeout() {
        let store = Arc::new(
            MockNodeStore::new("gpu-node-1")
                .with_labels([(VFIO, "true")])
                .with_pod_counts("nvidia-vfio-manager", &[1]),
        );
        let coordinator = coordinator(store.clone());
        let original = coordinator.fetch_component_labels().await.expect("fetch");

        coordinator
            .evict(&original)
            .await
            .expect("a timeout is not an error");

        let polls = store
            .state()
            .pod_queries
            .iter()
            .filter(|app| *app == "nvidia-vfio-manager")
            .count();
        assert_eq!(polls, 5);
    }

    #[test(tokio::test(start_paused = true))]
    async fn evict_keeps_waiting_through_pod_list_errors() {
        let store = Arc::new(MockNodeStore::new("gpu-node-1").with_labels([(VFIO, "true")]));
        store.state().fail_pod_lists = true;
        let coordinator = coordinator(store.clone());
        let original = coordinator.fetch_component_labels().await.expect("fetch");

        coordinator.evict(&original).await.expect("evict");
        assert_eq!(store.state().pod_queries.len(), 5);
    }

    #[test(tokio::test)]
    async fn evict_fails_when_labels_cannot_be_written() {
        let store = Arc::new(MockNodeStore::new("gpu-node-1").with_labels([(VFIO, "true")]));
        let coordinator = coordinator(store.clone());
        let original = coordinator.fetch_component_labels().await.expect("fetch");
        store.state().fail_patches = true;

        let err = coordinator.evict(&original).await.expect_err("patch fails");
        assert!(matches!(
            err.current_context(),
            KubernetesError::PatchFailed { .. }
        ));
        assert!(store.state().pod_queries.is_empty());
    }

    #[test(tokio::test(start_paused = true))]
    async fn reschedule_restores_original_values() {
        let store = Arc::new(MockNodeStore::new("gpu-node-1").with_labels([
            (VFIO, "true"),
            (VGPU, "false"),
            (VALIDATOR, "custom"),
        ]));
        let coordinator = coordinator(store.clone());
        let original = coordinator.fetch_component_labels().await.expect("fetch");
        let before = store.state().labels.clone();

        coordinator.evict(&original).await.expect("evict");
        coordinator.reschedule(&original).await.expect("reschedule");

        let state = store.state();
        for (key, value) in &before {
            assert_eq!(&state.labels[key], value);
        }
        assert_eq!(state.labels[DEVICE_MANAGER].as_str(), "");
    }

    #[test(tokio::test)]
    async fn reschedule_unpauses_values_left_paused_by_an_earlier_run() {
        let store = Arc::new(MockNodeStore::new("gpu-node-1").with_labels([
            (VFIO, "paused-for-cc-mode-change"),
            (VALIDATOR, "custom_paused-for-cc-mode-change"),
        ]));
        let coordinator = coordinator(store.clone());
        let original = coordinator.fetch_component_labels().await.expect("fetch");

        coordinator.reschedule(&original).await.expect("reschedule");

        let state = store.state();
        assert_eq!(state.labels[VFIO].as_str(), "true");
        assert_eq!(state.labels[VALIDATOR].as_str(), "custom");
    }
}
