use std::path::Path;

use error_stack::Report;
use error_stack::ResultExt;
use kube::config::KubeConfigOptions;
use kube::config::Kubeconfig;
use kube::Client;
use kube::Config;

use crate::infrastructure::k8s::KubernetesError;

/// Build a client from `kubeconfig`, or from the in-cluster service account
/// and `~/.kube/config` when no path is given.
pub async fn init_kube_client(kubeconfig: Option<&Path>) -> Result<Client, Report<KubernetesError>> {
    let Some(kubeconfig_path) = kubeconfig else {
        return Client::try_default()
            .await
            .change_context(KubernetesError::ConnectionFailed {
                message: "Failed to create Kubernetes client".to_string(),
            });
    };

    let kubeconfig = Kubeconfig::read_from(kubeconfig_path).change_context_lazy(|| {
        KubernetesError::ConnectionFailed {
            message: format!(
                "Failed to read kubeconfig file: {}",
                kubeconfig_path.display()
            ),
        }
    })?;

    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .change_context_lazy(|| KubernetesError::ConnectionFailed {
            message: format!(
                "Failed to create config from kubeconfig: {}",
                kubeconfig_path.display()
            ),
        })?;

    Client::try_from(config).change_context(KubernetesError::ConnectionFailed {
        message: "Failed to create Kubernetes client from custom kubeconfig".to_string(),
    })
}
