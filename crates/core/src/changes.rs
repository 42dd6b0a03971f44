//! Set of paths changed since the last commit

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Paths touched during one debounce window
///
/// `All` absorbs everything: once a window is marked as "every path is
/// dirty", individual paths no longer matter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeSet {
    /// These distinct paths changed
    Paths(BTreeSet<PathBuf>),
    /// Treat every path as dirty
    All,
}

impl Default for ChangeSet {
    fn default() -> Self {
        ChangeSet::Paths(BTreeSet::new())
    }
}

impl ChangeSet {
    /// Create an empty change set
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a changed path
    pub fn insert(&mut self, path: impl Into<PathBuf>) {
        if let ChangeSet::Paths(paths) = self {
            paths.insert(path.into());
        }
    }

    /// Mark every path as dirty
    pub fn mark_all(&mut self) {
        *self = ChangeSet::All;
    }

    /// Whether every path is considered dirty
    pub fn is_all(&self) -> bool {
        matches!(self, ChangeSet::All)
    }

    /// Whether nothing was recorded
    pub fn is_empty(&self) -> bool {
        match self {
            ChangeSet::Paths(paths) => paths.is_empty(),
            ChangeSet::All => false,
        }
    }

    /// Number of recorded paths (zero for `All`)
    pub fn len(&self) -> usize {
        match self {
            ChangeSet::Paths(paths) => paths.len(),
            ChangeSet::All => 0,
        }
    }

    /// Whether the given path was recorded (always true for `All`)
    pub fn contains(&self, path: &Path) -> bool {
        match self {
            ChangeSet::Paths(paths) => paths.contains(path),
            ChangeSet::All => true,
        }
    }

    /// Iterate the recorded paths in sorted order (nothing for `All`)
    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        let paths = match self {
            ChangeSet::Paths(paths) => Some(paths.iter().map(PathBuf::as_path)),
            ChangeSet::All => None,
        };
        paths.into_iter().flatten()
    }
}

impl<P: Into<PathBuf>> FromIterator<P> for ChangeSet {
    fn from_iter<I: IntoIterator<Item = P>>(iter: I) -> Self {
        ChangeSet::Paths(iter.into_iter().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_deduplicates() {
        let mut changes = ChangeSet::new();
        assert!(changes.is_empty());

        changes.insert("/w/a.txt");
        changes.insert("/w/b.txt");
        changes.insert("/w/a.txt");

        assert_eq!(changes.len(), 2);
        assert!(changes.contains(Path::new("/w/a.txt")));
        let paths: Vec<_> = changes.paths().collect();
        assert_eq!(paths, vec![Path::new("/w/a.txt"), Path::new("/w/b.txt")]);
    }

    #[test]
    fn test_all_absorbs_paths() {
        let mut changes: ChangeSet = ["/w/a.txt"].into_iter().collect();
        changes.mark_all();
        changes.insert("/w/c.txt");

        assert!(changes.is_all());
        assert!(!changes.is_empty());
        assert!(changes.contains(Path::new("/anything")));
        assert_eq!(changes.paths().count(), 0);
    }
}
