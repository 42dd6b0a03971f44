//! boxsync daemon
//!
//! Keeps a directory and a git branch in step: local edits are committed
//! after a quiet period, and pushes to the branch are checked out into the
//! directory through the update hook.

pub mod daemon;
pub mod locks;
pub mod logging;
pub mod sync;

pub use daemon::{resolve_config, Daemon, DaemonOptions};
pub use sync::Synchronizer;
