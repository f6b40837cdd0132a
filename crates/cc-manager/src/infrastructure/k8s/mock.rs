//! In-memory [`NodeStore`] used by unit tests.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;

use async_trait::async_trait;
use error_stack::Report;
use futures::stream;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::domain::labels::CC_MODE_LABEL;
use crate::infrastructure::k8s::node_store::NodeStore;
use crate::infrastructure::k8s::types::KubernetesError;
use crate::infrastructure::k8s::types::NodeEventStream;
use crate::infrastructure::k8s::types::NodeSnapshot;
use crate::infrastructure::k8s::types::NodeWatchEvent;

/// One scripted watch connection.
#[derive(Debug)]
pub(crate) enum ScriptedWatch {
    /// Opening the watch fails.
    ConnectError(KubernetesError),
    /// The watch yields these events and then closes.
    Events(Vec<ScriptedEvent>),
}

#[derive(Debug, Clone)]
pub(crate) enum ScriptedEvent {
    /// Set the CC mode label and emit a MODIFIED event.
    Label(&'static str),
    /// Bump the resource version without touching labels.
    Touch,
    Bookmark,
    /// The cursor expired.
    Gone,
    /// A generic watch error.
    Error(&'static str),
    /// Set the CC mode label without the watch seeing it.
    SilentLabel(&'static str),
}

#[derive(Debug, Default)]
pub(crate) struct MockNodeState {
    pub labels: BTreeMap<String, String>,
    pub resource_version: u64,
    /// Successful label patches in order.
    pub patches: Vec<BTreeMap<String, String>>,
    /// Pod counts returned per app, one entry per poll; the last entry repeats.
    pub pod_counts: HashMap<String, VecDeque<usize>>,
    /// Apps queried by `count_pods`, in order.
    pub pod_queries: Vec<String>,
    /// Resource versions passed to `watch`, in order.
    pub watch_requests: Vec<String>,
    pub reads: u32,
    pub fail_reads: bool,
    pub fail_patches: bool,
    pub fail_pod_lists: bool,
    /// Number of upcoming conditional patches rejected as conflicts.
    pub conflicts: u32,
}

impl MockNodeState {
    fn snapshot(&self) -> NodeSnapshot {
        NodeSnapshot {
            labels: self.labels.clone(),
            resource_version: self.resource_version.to_string(),
        }
    }

    fn set_label(&mut self, key: &str, value: &str) {
        self.labels.insert(key.to_string(), value.to_string());
        self.resource_version += 1;
    }
}

pub(crate) struct MockNodeStore {
    node_name: String,
    state: Mutex<MockNodeState>,
    watches: Mutex<VecDeque<ScriptedWatch>>,
    exhausted: CancellationToken,
}

impl MockNodeStore {
    pub(crate) fn new(node_name: &str) -> Self {
        Self {
            node_name: node_name.to_string(),
            state: Mutex::new(MockNodeState {
                resource_version: 1,
                ..Default::default()
            }),
            watches: Mutex::new(VecDeque::new()),
            exhausted: CancellationToken::new(),
        }
    }

    pub(crate) fn with_labels<'a>(self, labels: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        {
            let mut state = self.state();
            for (key, value) in labels {
                state.labels.insert(key.to_string(), value.to_string());
            }
        }
        self
    }

    pub(crate) fn with_watch(self, watch: ScriptedWatch) -> Self {
        self.watches.lock().expect("watch lock").push_back(watch);
        self
    }

    pub(crate) fn with_pod_counts(self, app: &str, counts: &[usize]) -> Self {
        self.state()
            .pod_counts
            .insert(app.to_string(), counts.iter().copied().collect());
        self
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, MockNodeState> {
        self.state.lock().expect("state lock")
    }

    /// Cancelled once a watch is requested after the script ran out.
    pub(crate) fn exhausted(&self) -> CancellationToken {
        self.exhausted.clone()
    }

    pub(crate) fn label(&self, key: &str) -> String {
        self.state().snapshot().label(key).to_string()
    }

    fn play(&self, events: Vec<ScriptedEvent>) -> Vec<Result<NodeWatchEvent, Report<KubernetesError>>> {
        let mut state = self.state();
        events
            .into_iter()
            .filter_map(|event| match event {
                ScriptedEvent::Label(value) => {
                    state.set_label(CC_MODE_LABEL, value);
                    Some(Ok(NodeWatchEvent::Applied(state.snapshot())))
                }
                ScriptedEvent::Touch => {
                    state.resource_version += 1;
                    Some(Ok(NodeWatchEvent::Applied(state.snapshot())))
                }
                ScriptedEvent::Bookmark => Some(Ok(NodeWatchEvent::Bookmark {
                    resource_version: state.resource_version.to_string(),
                })),
                ScriptedEvent::Gone => Some(Err(Report::new(
                    KubernetesError::ResourceVersionExpired {
                        resource_version: state.resource_version.to_string(),
                    },
                ))),
                ScriptedEvent::Error(message) => Some(Err(Report::new(
                    KubernetesError::WatchFailed {
                        message: message.to_string(),
                    },
                ))),
                ScriptedEvent::SilentLabel(value) => {
                    state.set_label(CC_MODE_LABEL, value);
                    None
                }
            })
            .collect()
    }
}

#[async_trait]
impl NodeStore for MockNodeStore {
    fn node_name(&self) -> &str {
        &self.node_name
    }

    async fn get(&self) -> Result<NodeSnapshot, Report<KubernetesError>> {
        let mut state = self.state();
        state.reads += 1;
        if state.fail_reads {
            return Err(Report::new(KubernetesError::NodeReadFailed {
                node: self.node_name.clone(),
            }));
        }
        Ok(state.snapshot())
    }

    async fn patch_labels(
        &self,
        labels: &BTreeMap<String, String>,
        resource_version: Option<&str>,
    ) -> Result<NodeSnapshot, Report<KubernetesError>> {
        let mut state = self.state();
        if state.fail_patches {
            return Err(Report::new(KubernetesError::PatchFailed {
                node: self.node_name.clone(),
            }));
        }
        if let Some(expected) = resource_version {
            if state.conflicts > 0 {
                state.conflicts -= 1;
                state.resource_version += 1;
            }
            if expected != state.resource_version.to_string() {
                return Err(Report::new(KubernetesError::Conflict {
                    node: self.node_name.clone(),
                }));
            }
        }
        state
            .labels
            .extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        state.resource_version += 1;
        state.patches.push(labels.clone());
        Ok(state.snapshot())
    }

    async fn count_pods(
        &self,
        namespace: &str,
        app: &str,
    ) -> Result<usize, Report<KubernetesError>> {
        let mut state = self.state();
        state.pod_queries.push(app.to_string());
        if state.fail_pod_lists {
            return Err(Report::new(KubernetesError::PodListFailed {
                namespace: namespace.to_string(),
                app: app.to_string(),
            }));
        }
        let count = match state.pod_counts.get_mut(app) {
            Some(counts) if counts.len() > 1 => counts.pop_front().unwrap_or_default(),
            Some(counts) => counts.front().copied().unwrap_or_default(),
            None => 0,
        };
        Ok(count)
    }

    async fn watch(
        &self,
        resource_version: &str,
        _timeout: Duration,
    ) -> Result<NodeEventStream, Report<KubernetesError>> {
        self.state().watch_requests.push(resource_version.to_string());
        let next = self.watches.lock().expect("watch lock").pop_front();
        match next {
            Some(ScriptedWatch::ConnectError(error)) => Err(Report::new(error)),
            Some(ScriptedWatch::Events(events)) => Ok(stream::iter(self.play(events)).boxed()),
            None => {
                self.exhausted.cancel();
                Ok(stream::pending().boxed())
            }
        }
    }
}
