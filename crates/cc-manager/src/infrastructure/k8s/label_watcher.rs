use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use futures::StreamExt;
use tokio::select;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::domain::labels::CC_MODE_LABEL;
use crate::infrastructure::k8s::node_store::NodeStore;
use crate::infrastructure::k8s::types::KubernetesError;
use crate::infrastructure::k8s::types::NodeWatchEvent;

#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Label whose value is delivered downstream.
    pub label_key: String,
    /// Server-side timeout of a single watch connection.
    pub timeout: Duration,
    /// Pause between a failed connection and the next attempt.
    pub reconnect_delay: Duration,
    /// Consecutive failures after which the watcher gives up.
    pub max_consecutive_failures: u32,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            label_key: CC_MODE_LABEL.to_string(),
            timeout: Duration::from_secs(290),
            reconnect_delay: Duration::from_secs(5),
            max_consecutive_failures: 10,
        }
    }
}

/// Position of the watcher: where to resume and what was last delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchCursor {
    pub resource_version: String,
    pub label_value: String,
}

enum Flow {
    Reconnect,
    Stop,
}

/// Watches a single label on the managed node and forwards changes.
///
/// Every value sent on the channel differs from the one before it; the
/// value returned by [`initial_read`](Self::initial_read) counts as the
/// first delivery.
pub struct NodeLabelWatcher<S> {
    store: Arc<S>,
    config: WatchConfig,
}

impl<S: NodeStore> NodeLabelWatcher<S> {
    pub fn new(store: Arc<S>, config: WatchConfig) -> Self {
        Self { store, config }
    }

    /// Read the current label value and the version to resume watching from.
    ///
    /// # Errors
    ///
    /// - [`KubernetesError::NodeReadFailed`] if the node cannot be read
    pub async fn initial_read(&self) -> Result<WatchCursor, Report<KubernetesError>> {
        let snapshot = self.store.get().await?;
        let label_value = snapshot.label(&self.config.label_key).to_string();
        info!(
            label = %self.config.label_key,
            value = %label_value,
            resource_version = %snapshot.resource_version,
            "Read initial label value"
        );
        Ok(WatchCursor {
            resource_version: snapshot.resource_version,
            label_value,
        })
    }

    /// Watch for label changes until cancelled.
    ///
    /// Connections are re-established when the server closes them. An
    /// expired cursor triggers a fresh read, which is delivered if it
    /// differs from the last value. Returns `Ok` on cancellation or once the
    /// receiving side is gone.
    ///
    /// # Errors
    ///
    /// - [`KubernetesError::WatchFailureThreshold`] after too many
    ///   consecutive connection failures
    #[tracing::instrument(skip_all, fields(node = %self.store.node_name(), label = %self.config.label_key))]
    pub async fn run(
        &self,
        mut cursor: WatchCursor,
        changes: mpsc::Sender<String>,
        cancellation_token: CancellationToken,
    ) -> Result<(), Report<KubernetesError>> {
        let mut failures = 0;
        loop {
            let outcome = select! {
                _ = cancellation_token.cancelled() => {
                    info!("Label watcher shutdown requested");
                    return Ok(());
                }
                outcome = self.watch_once(&mut cursor, &mut failures, &changes) => outcome,
            };

            let error = match outcome {
                Ok(Flow::Stop) => {
                    info!("Change receiver closed, stopping label watcher");
                    return Ok(());
                }
                Ok(Flow::Reconnect) => {
                    debug!("Watch connection closed, reconnecting");
                    continue;
                }
                Err(e) if e.current_context().is_gone() => {
                    warn!("Watch cursor expired, re-reading node: {e}");
                    match self.resync(&mut cursor, &changes).await {
                        Ok(Flow::Reconnect) => continue,
                        Ok(Flow::Stop) => return Ok(()),
                        Err(e) => e,
                    }
                }
                Err(e) => e,
            };

            failures += 1;
            error!(failures, "Label watch failed: {error:?}");
            if failures >= self.config.max_consecutive_failures {
                return Err(error.change_context(KubernetesError::WatchFailureThreshold { failures }));
            }

            select! {
                _ = cancellation_token.cancelled() => {
                    info!("Label watcher shutdown requested");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
            }
        }
    }

    async fn watch_once(
        &self,
        cursor: &mut WatchCursor,
        failures: &mut u32,
        changes: &mpsc::Sender<String>,
    ) -> Result<Flow, Report<KubernetesError>> {
        debug!(resource_version = %cursor.resource_version, "Opening node watch");
        let mut events = self
            .store
            .watch(&cursor.resource_version, self.config.timeout)
            .await?;

        while let Some(event) = events.next().await {
            let event = event?;
            *failures = 0;
            match event {
                NodeWatchEvent::Applied(snapshot) => {
                    if !snapshot.resource_version.is_empty() {
                        cursor.resource_version.clone_from(&snapshot.resource_version);
                    }
                    let value = snapshot.label(&self.config.label_key).to_string();
                    if !self.deliver(cursor, value, changes).await {
                        return Ok(Flow::Stop);
                    }
                }
                NodeWatchEvent::Deleted { resource_version }
                | NodeWatchEvent::Bookmark { resource_version } => {
                    if !resource_version.is_empty() {
                        cursor.resource_version = resource_version;
                    }
                }
            }
        }
        Ok(Flow::Reconnect)
    }

    async fn resync(
        &self,
        cursor: &mut WatchCursor,
        changes: &mpsc::Sender<String>,
    ) -> Result<Flow, Report<KubernetesError>> {
        let fresh = self.initial_read().await?;
        cursor.resource_version = fresh.resource_version;
        if self.deliver(cursor, fresh.label_value, changes).await {
            Ok(Flow::Reconnect)
        } else {
            Ok(Flow::Stop)
        }
    }

    /// Forward `value` if it differs from the last delivered one. Returns
    /// `false` once the receiver is gone.
    async fn deliver(
        &self,
        cursor: &mut WatchCursor,
        value: String,
        changes: &mpsc::Sender<String>,
    ) -> bool {
        if value == cursor.label_value {
            debug!(value = %value, "Label unchanged, ignoring event");
            return true;
        }
        info!(from = %cursor.label_value, to = %value, "Label changed");
        cursor.label_value.clone_from(&value);
        changes.send(value).await.is_ok()
    }
}
