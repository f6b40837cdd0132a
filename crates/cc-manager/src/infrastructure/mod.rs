pub mod gpu;
pub mod k8s;
pub mod kube_client;
pub mod readiness;
