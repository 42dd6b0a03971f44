//! Version-control collaborator interface

use crate::changes::ChangeSet;
use anyhow::Result;

/// Operations the synchronizer delegates to the version-control tool
///
/// Implementations are called synchronously and may block for as long as
/// the underlying tool takes. Callers hold the [`Gate`](crate::Gate) around
/// every call, so implementations may move `HEAD` or rewrite the index.
pub trait VersionControl: Send + Sync {
    /// Stage the given changes and commit them on the synchronized branch
    ///
    /// Returns the new revision, or `None` if there was nothing to commit.
    fn check_in(&self, changes: &ChangeSet) -> Result<Option<String>>;

    /// Overwrite the working directory with the tree of `revision`
    fn check_out(&self, revision: &str) -> Result<()>;

    /// Whether the working directory differs from `revision`
    fn has_changes(&self, revision: &str) -> Result<bool>;
}

/// Whether `revision` looks like a full or abbreviated hex object id
///
/// Revisions arriving from the update hook must pass this before they are
/// handed to the tool's command line.
pub fn is_revision_id(revision: &str) -> bool {
    (4..=64).contains(&revision.len()) && revision.bytes().all(|b| b.is_ascii_hexdigit())
}
