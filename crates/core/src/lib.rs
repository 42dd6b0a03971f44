//! boxsync core - shared primitives for directory/branch synchronization
//!
//! This crate provides the pieces every other boxsync crate agrees on:
//! - The commit/checkout mutual-exclusion gate
//! - The change set accumulated between debounce fires
//! - The version-control collaborator trait
//! - Daemon configuration

pub mod changes;
pub mod config;
pub mod gate;
pub mod vcs;

// Re-export main types for convenience
pub use changes::ChangeSet;
pub use config::{ConfigError, IgnoreConfig, ServerConfig, SyncConfig};
pub use gate::{Gate, GateGuard};
pub use vcs::{is_revision_id, VersionControl};

/// Common result type used throughout boxsync-core
pub type Result<T> = anyhow::Result<T>;
