use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::error;
use tracing::info;

use crate::domain::labels::CC_MODE_STATE_LABEL;
use crate::infrastructure::k8s::node_store::update_labels;
use crate::infrastructure::k8s::node_store::NodeStore;

/// Publishes the outcome of a reconciliation on the node.
pub struct StateReporter<S> {
    store: Arc<S>,
}

impl<S: NodeStore> StateReporter<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Best effort; failures are logged and reported as `false`.
    pub async fn report(&self, state: &str) -> bool {
        let labels = BTreeMap::from([(CC_MODE_STATE_LABEL.to_string(), state.to_string())]);
        match update_labels(self.store.as_ref(), &labels).await {
            Ok(_) => {
                info!(state, "Set {CC_MODE_STATE_LABEL}");
                true
            }
            Err(e) => {
                error!(state, "Failed to set {CC_MODE_STATE_LABEL}: {e:?}");
                false
            }
        }
    }
}
