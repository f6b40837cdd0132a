//! Confidential computing mode management for the GPUs of one node.

pub mod eviction;
pub mod labels;
pub mod reconciler;
pub mod reporter;

pub use eviction::EvictionConfig;
pub use eviction::EvictionCoordinator;
pub use reconciler::ModeReconciler;
pub use reconciler::ReconcileError;
pub use reconciler::ReconcileOutcome;
pub use reconciler::ReconcilerConfig;
pub use reporter::StateReporter;
