//! Shared helpers for the cc-manager binaries: logging setup and version metadata.

pub mod logging;
pub mod version;
