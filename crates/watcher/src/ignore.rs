//! Ignore rules for directory events
//!
//! Sources, checked in order:
//! 1. Built-in patterns (the git directory, editor temp files - always active)
//! 2. .gitignore at the root of the watched directory (optional)
//! 3. Config-based patterns (gitignore syntax)

use anyhow::Result;
use boxsync_core::IgnoreConfig;
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use std::path::{Path, PathBuf};

/// Ignore rule manager for one watched directory
pub struct IgnoreRules {
    /// Watched directory
    root: PathBuf,

    /// Git directory; may live inside `root`
    git_dir: Option<PathBuf>,

    /// Root .gitignore patterns (optional)
    gitignore: Option<Gitignore>,

    /// Patterns from configuration
    additional: Option<Gitignore>,

    config: IgnoreConfig,
}

impl IgnoreRules {
    /// Load ignore rules for the watched directory
    pub fn load(root: &Path, git_dir: Option<&Path>, config: IgnoreConfig) -> Result<Self> {
        let mut rules = Self {
            root: root.to_path_buf(),
            git_dir: git_dir.map(Path::to_path_buf),
            gitignore: None,
            additional: None,
            config,
        };

        rules.reload()?;
        Ok(rules)
    }

    /// Rebuild patterns from disk and configuration
    pub fn reload(&mut self) -> Result<()> {
        self.gitignore = None;
        if self.config.use_gitignore {
            let gitignore_path = self.root.join(".gitignore");
            if gitignore_path.exists() {
                let mut builder = GitignoreBuilder::new(&self.root);
                if let Some(err) = builder.add(&gitignore_path) {
                    return Err(err.into());
                }
                self.gitignore = Some(builder.build()?);
            }
        }

        self.additional = None;
        if !self.config.additional_patterns.is_empty() {
            let mut builder = GitignoreBuilder::new(&self.root);
            for pattern in &self.config.additional_patterns {
                builder.add_line(None, pattern)?;
            }
            self.additional = Some(builder.build()?);
        }

        Ok(())
    }

    /// Check if an event for `path` should be dropped
    ///
    /// Accepts absolute paths under the watched directory or paths relative
    /// to it. Paths outside the directory are always ignored.
    pub fn should_ignore(&self, path: &Path) -> bool {
        if let Some(git_dir) = &self.git_dir {
            if path.starts_with(git_dir) {
                return true;
            }
        }

        let relative = if path.is_absolute() {
            match path.strip_prefix(&self.root) {
                Ok(relative) => relative,
                Err(_) => return true,
            }
        } else {
            path
        };

        if is_builtin_ignored(relative) {
            return true;
        }

        let is_dir = self.root.join(relative).is_dir();
        for rules in [&self.gitignore, &self.additional].into_iter().flatten() {
            if rules
                .matched_path_or_any_parents(relative, is_dir)
                .is_ignore()
            {
                return true;
            }
        }

        false
    }

    /// Watched directory
    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Git metadata and editor scratch files
fn is_builtin_ignored(relative: &Path) -> bool {
    if relative
        .components()
        .any(|c| c.as_os_str() == ".git")
    {
        return true;
    }

    let filename = relative
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("");

    // Vim swap files
    if filename.ends_with(".swp") || filename.ends_with(".swo") || filename.ends_with(".swx") {
        return true;
    }

    // Emacs lock and auto-save files
    if filename.starts_with(".#") || (filename.starts_with('#') && filename.ends_with('#')) {
        return true;
    }

    // Backup files
    if filename.ends_with('~') {
        return true;
    }

    // OS metadata
    matches!(filename, ".DS_Store" | "Thumbs.db" | "desktop.ini")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn no_gitignore() -> IgnoreConfig {
        IgnoreConfig {
            use_gitignore: false,
            additional_patterns: vec![],
        }
    }

    #[test]
    fn test_builtin_patterns_always_enforced() {
        let temp_dir = TempDir::new().unwrap();
        let rules = IgnoreRules::load(temp_dir.path(), None, no_gitignore()).unwrap();

        assert!(rules.should_ignore(Path::new(".git/objects/ab/cd")));
        assert!(rules.should_ignore(Path::new("sub/.git/config")));
        assert!(rules.should_ignore(Path::new("notes.txt.swp")));
        assert!(rules.should_ignore(Path::new("docs/.#draft.md")));
        assert!(rules.should_ignore(Path::new("report.doc~")));
        assert!(rules.should_ignore(Path::new(".DS_Store")));

        assert!(!rules.should_ignore(Path::new("src/main.rs")));
        assert!(!rules.should_ignore(Path::new(".gitignore")));
    }

    #[test]
    fn test_git_dir_inside_watched_directory() {
        let temp_dir = TempDir::new().unwrap();
        let git_dir = temp_dir.path().join("repo.git");
        let rules = IgnoreRules::load(temp_dir.path(), Some(&git_dir), no_gitignore()).unwrap();

        assert!(rules.should_ignore(&git_dir.join("refs/heads/master")));
        assert!(!rules.should_ignore(&temp_dir.path().join("repo.txt")));
    }

    #[test]
    fn test_paths_outside_root_ignored() {
        let temp_dir = TempDir::new().unwrap();
        let rules = IgnoreRules::load(temp_dir.path(), None, no_gitignore()).unwrap();

        assert!(rules.should_ignore(Path::new("/somewhere/else.txt")));
        assert!(!rules.should_ignore(&temp_dir.path().join("inside.txt")));
    }

    #[test]
    fn test_gitignore_parsing() -> Result<()> {
        let temp_dir = TempDir::new()?;
        fs::write(temp_dir.path().join(".gitignore"), "*.log\nbuild/\n")?;
        fs::create_dir_all(temp_dir.path().join("build"))?;

        let rules = IgnoreRules::load(temp_dir.path(), None, IgnoreConfig::default())?;

        assert!(rules.should_ignore(Path::new("debug.log")));
        assert!(rules.should_ignore(Path::new("build")));
        assert!(rules.should_ignore(&temp_dir.path().join("build/out.bin")));
        assert!(!rules.should_ignore(Path::new("README.md")));

        Ok(())
    }

    #[test]
    fn test_gitignore_disabled() -> Result<()> {
        let temp_dir = TempDir::new()?;
        fs::write(temp_dir.path().join(".gitignore"), "*.log\n")?;

        let rules = IgnoreRules::load(temp_dir.path(), None, no_gitignore())?;
        assert!(!rules.should_ignore(Path::new("debug.log")));

        Ok(())
    }

    #[test]
    fn test_additional_patterns() {
        let temp_dir = TempDir::new().unwrap();
        let config = IgnoreConfig {
            use_gitignore: false,
            additional_patterns: vec!["*.tmp".to_string(), "cache/".to_string()],
        };
        fs::create_dir_all(temp_dir.path().join("cache")).unwrap();

        let rules = IgnoreRules::load(temp_dir.path(), None, config).unwrap();

        assert!(rules.should_ignore(Path::new("upload.tmp")));
        assert!(rules.should_ignore(Path::new("cache/entry")));
        assert!(!rules.should_ignore(Path::new("src/main.rs")));
    }

    #[test]
    fn test_reload_picks_up_new_gitignore() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let mut rules = IgnoreRules::load(temp_dir.path(), None, IgnoreConfig::default())?;
        assert!(!rules.should_ignore(Path::new("test.log")));

        fs::write(temp_dir.path().join(".gitignore"), "*.log\n")?;
        rules.reload()?;
        assert!(rules.should_ignore(Path::new("test.log")));

        Ok(())
    }
}
