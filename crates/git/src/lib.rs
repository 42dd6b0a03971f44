//! Git integration for boxsync
//!
//! This crate provides:
//! - `GitRepository`, the version-control collaborator backed by the `git`
//!   command line
//! - Installation of the update hook that forwards pushes to the daemon

pub mod hook;
pub mod repo;

pub use hook::{install_update_hook, uninstall_update_hook, HookSettings, HOOK_MARKER};
pub use repo::GitRepository;

use std::path::PathBuf;
use std::process::Output;
use thiserror::Error;

/// Errors raised by git operations
#[derive(Debug, Error)]
pub enum GitError {
    #[error("not a git repository: {}", .0.display())]
    NotARepository(PathBuf),

    #[error("failed to run `{command}`")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with {status}: {stderr}")]
    Failed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("not a revision id: {0:?}")]
    InvalidRevision(String),

    #[error(
        "repository at {} already has an update hook; not overriding, delete it and try again",
        .0.display()
    )]
    ForeignHook(PathBuf),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl GitError {
    fn failed(command: &str, output: &Output) -> Self {
        GitError::Failed {
            command: command.to_string(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }
    }
}
