pub mod app;
pub mod config;
pub mod domain;
pub mod infrastructure;

// Re-export main modules
pub use domain::eviction;
pub use domain::labels;
pub use domain::reconciler;
pub use infrastructure::gpu;
pub use infrastructure::k8s;
pub use infrastructure::kube_client;
pub use infrastructure::readiness;
