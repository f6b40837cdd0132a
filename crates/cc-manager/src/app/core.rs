use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::app::tasks::reconcile_once;
use crate::app::tasks::Tasks;
use crate::config::AppConfig;
use crate::config::Cli;
use crate::domain::ModeReconciler;
use crate::infrastructure::gpu::AdminTools;
use crate::infrastructure::gpu::AdminToolsConfig;
use crate::infrastructure::gpu::GpuControl;
use crate::infrastructure::k8s::KubeNodeStore;
use crate::infrastructure::k8s::NodeLabelWatcher;
use crate::infrastructure::k8s::NodeStore;
use crate::infrastructure::kube_client;
use crate::infrastructure::readiness;

/// Application core structure with explicit dependencies
pub struct Application<S, G> {
    store: Arc<S>,
    watcher: Arc<NodeLabelWatcher<S>>,
    reconciler: Arc<ModeReconciler<S, G>>,
    readiness_file: PathBuf,
}

impl Application<KubeNodeStore, AdminTools> {
    /// Connect to the cluster and the host's GPUs as configured on the command line.
    pub async fn from_cli(cli: &Cli) -> Result<Self> {
        let client = kube_client::init_kube_client(cli.kubeconfig.as_deref())
            .await
            .map_err(|e| anyhow::anyhow!("Failed to initialize Kubernetes client: {e:?}"))?;
        let store = Arc::new(KubeNodeStore::new(client, cli.node_name.clone()));
        let gpu = Arc::new(AdminTools::new(AdminToolsConfig::from(cli)));
        Ok(Self::new(store, gpu, AppConfig::from(cli)))
    }
}

impl<S, G> Application<S, G>
where
    S: NodeStore + 'static,
    G: GpuControl + 'static,
{
    pub fn new(store: Arc<S>, gpu: Arc<G>, config: AppConfig) -> Self {
        tracing::info!(
            node = store.node_name(),
            default_mode = %config.reconciler.default_mode,
            evict_operator_components = config.reconciler.evict_operator_components,
            "Initialized CC manager"
        );
        Self {
            watcher: Arc::new(NodeLabelWatcher::new(store.clone(), config.watch)),
            reconciler: Arc::new(ModeReconciler::new(
                store.clone(),
                gpu,
                config.eviction,
                config.reconciler,
            )),
            store,
            readiness_file: config.readiness_file,
        }
    }

    pub fn watcher(&self) -> &Arc<NodeLabelWatcher<S>> {
        &self.watcher
    }

    pub fn reconciler(&self) -> &Arc<ModeReconciler<S, G>> {
        &self.reconciler
    }

    /// Reconcile the current label, then follow label changes until
    /// `shutdown` is cancelled or the watch gives up.
    ///
    /// # Errors
    ///
    /// Fails if the node cannot be read at startup or the label watch
    /// exceeds its failure threshold.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let cursor = self.watcher.initial_read().await.map_err(|e| {
            anyhow::anyhow!(
                "Failed to read labels of node {}: {e:?}",
                self.store.node_name()
            )
        })?;

        // The watch opens only after this, so every change it delivers is
        // reconciled on its own.
        reconcile_once(&self.reconciler, &cursor.label_value).await;
        if let Err(e) = readiness::create_readiness_file(&self.readiness_file).await {
            tracing::warn!("{e:?}");
        }

        tracing::info!("Starting all application tasks...");
        let mut tasks = Tasks::new(shutdown);
        tasks.spawn_all_tasks(self, cursor);

        if let Err(e) = tasks.wait_for_completion().await {
            tracing::error!("Error during task execution: {e:?}");
            return Err(e);
        }

        tracing::info!("Application run completed");
        Ok(())
    }
}
