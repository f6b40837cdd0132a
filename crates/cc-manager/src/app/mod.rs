//! Application module
//!
//! Wires the node store, GPU backend, label watcher and reconciler together
//! and runs them as background tasks until shutdown.

pub mod core;
pub mod tasks;

pub use core::Application;
