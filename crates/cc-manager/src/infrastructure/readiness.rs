use std::path::Path;
use std::path::PathBuf;

use error_stack::Report;
use error_stack::ResultExt;

#[derive(Debug, derive_more::Display)]
#[display("Failed to create readiness file {}", path.display())]
pub struct ReadinessError {
    path: PathBuf,
}

impl core::error::Error for ReadinessError {}

/// Touch the marker file that tells the node's validation tooling the
/// manager has finished its first reconciliation.
pub async fn create_readiness_file(path: &Path) -> Result<(), Report<ReadinessError>> {
    let failed = || ReadinessError {
        path: path.to_path_buf(),
    };
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .change_context_lazy(failed)?;
    }
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .change_context_lazy(failed)?;
    tracing::info!("Created readiness file {}", path.display());
    Ok(())
}
