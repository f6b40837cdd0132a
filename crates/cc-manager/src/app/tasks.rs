use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::app::core::Application;
use crate::domain::ModeReconciler;
use crate::infrastructure::gpu::GpuControl;
use crate::infrastructure::k8s::NodeStore;
use crate::infrastructure::k8s::WatchCursor;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Task manager, responsible for starting and managing all background tasks
pub struct Tasks {
    tasks: Vec<JoinHandle<Result<()>>>,
    cancellation_token: CancellationToken,
}

impl Tasks {
    pub fn new(cancellation_token: CancellationToken) -> Self {
        Self {
            tasks: Vec::new(),
            cancellation_token,
        }
    }

    /// Start the label watcher and the reconciliation loop.
    ///
    /// The label value in `cursor` must already be reconciled; the watcher
    /// only forwards values that differ from it.
    pub fn spawn_all_tasks<S, G>(&mut self, app: &Application<S, G>, cursor: WatchCursor)
    where
        S: NodeStore + 'static,
        G: GpuControl + 'static,
    {
        let (change_sender, change_receiver) = mpsc::channel::<String>(32);

        let watcher_task = self.spawn_watcher_task(app, cursor, change_sender);
        self.tasks.push(watcher_task);

        let reconcile_task = self.spawn_reconcile_task(app, change_receiver);
        self.tasks.push(reconcile_task);
    }

    /// wait for shutdown or for any task to finish
    pub async fn wait_for_completion(&mut self) -> Result<()> {
        tokio::select! {
            _ = self.cancellation_token.cancelled() => {
                tracing::info!("Shutdown requested, waiting for tasks");
                self.wait_for_tasks_with_timeout(SHUTDOWN_TIMEOUT).await;
                Ok(())
            }
            (result, index) = futures::future::select_all(&mut self.tasks)
                .map(|(result, index, _remaining)| (result, index)) => {
                self.tasks.remove(index);
                self.cancellation_token.cancel();
                self.wait_for_tasks_with_timeout(SHUTDOWN_TIMEOUT).await;
                match result {
                    Ok(Ok(())) => {
                        tracing::warn!("Task completed unexpectedly");
                        Ok(())
                    }
                    Ok(Err(e)) => Err(e),
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    async fn wait_for_tasks_with_timeout(&mut self, timeout: Duration) {
        tokio::time::timeout(timeout, async {
            for task in &mut self.tasks {
                match task.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::error!("Task failed during shutdown: {e:?}"),
                    Err(e) => tracing::error!("Task panicked during shutdown: {e}"),
                }
            }
        })
        .await
        .unwrap_or_else(|_| {
            tracing::warn!("Task shutdown timed out after {:?}", timeout);
        });
    }

    fn spawn_watcher_task<S, G>(
        &self,
        app: &Application<S, G>,
        cursor: WatchCursor,
        change_sender: mpsc::Sender<String>,
    ) -> JoinHandle<Result<()>>
    where
        S: NodeStore + 'static,
        G: GpuControl + 'static,
    {
        let watcher = app.watcher().clone();
        let token = self.cancellation_token.clone();
        tokio::spawn(async move {
            tracing::info!("Starting label watcher task");
            watcher
                .run(cursor, change_sender, token)
                .await
                .map_err(|e| anyhow::anyhow!("Label watcher stopped: {e:?}"))?;
            tracing::info!("Label watcher task completed");
            Ok(())
        })
    }

    fn spawn_reconcile_task<S, G>(
        &self,
        app: &Application<S, G>,
        change_receiver: mpsc::Receiver<String>,
    ) -> JoinHandle<Result<()>>
    where
        S: NodeStore + 'static,
        G: GpuControl + 'static,
    {
        let reconciler = app.reconciler().clone();
        let token = self.cancellation_token.clone();
        tokio::spawn(async move {
            tracing::info!("Starting reconciliation task");
            reconcile_changes(reconciler, change_receiver, token).await;
            tracing::info!("Reconciliation task completed");
            Ok(())
        })
    }
}

/// Reconcile each label change in the order the watcher delivered it.
async fn reconcile_changes<S, G>(
    reconciler: Arc<ModeReconciler<S, G>>,
    mut changes: mpsc::Receiver<String>,
    cancellation_token: CancellationToken,
) where
    S: NodeStore,
    G: GpuControl,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = cancellation_token.cancelled() => return,
            next = changes.recv() => next,
        };
        let Some(label_value) = next else {
            return;
        };
        reconcile_once(&reconciler, &label_value).await;
    }
}

pub(crate) async fn reconcile_once<S, G>(reconciler: &ModeReconciler<S, G>, label_value: &str)
where
    S: NodeStore,
    G: GpuControl,
{
    match reconciler.reconcile(label_value).await {
        Ok(outcome) => tracing::info!(?outcome, "Reconciliation finished"),
        Err(e) => tracing::error!("Reconciliation failed: {e:?}"),
    }
}

/// Cancel `cancellation_token` on SIGTERM or SIGINT.
pub fn shutdown_on_signal(cancellation_token: CancellationToken) -> Result<JoinHandle<()>> {
    use tokio::signal::unix::signal;
    use tokio::signal::unix::SignalKind;

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    Ok(tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, initiating graceful shutdown");
            }
            _ = cancellation_token.cancelled() => return,
        }
        cancellation_token.cancel();
    }))
}
