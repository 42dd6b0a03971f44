//! Git repository driven through the `git` command line
//!
//! The repository's git directory and the synchronized working directory are
//! independent: every command runs as
//! `git --git-dir <git_dir> --work-tree <workdir> ...` from inside the
//! working directory.

use crate::GitError;
use boxsync_core::{is_revision_id, ChangeSet, VersionControl};
use std::collections::HashSet;
use std::ffi::{OsStr, OsString};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Paths passed to a single `git add`/`git rm` invocation
const PATHS_PER_COMMAND: usize = 256;

/// A git directory paired with the working directory it is synchronized to
#[derive(Debug, Clone)]
pub struct GitRepository {
    git_dir: PathBuf,
    workdir: PathBuf,
    branch: String,
    commit_message: String,
}

impl GitRepository {
    /// Open the repository at `git_dir` for synchronization with `workdir`
    ///
    /// Configures the repository to accept pushes to its checked-out branch.
    pub fn open(
        git_dir: &Path,
        workdir: &Path,
        branch: &str,
        commit_message: &str,
    ) -> Result<Self, GitError> {
        if !git_dir.join("objects").is_dir() || !git_dir.join("refs").is_dir() {
            return Err(GitError::NotARepository(git_dir.to_path_buf()));
        }

        let repo = Self {
            git_dir: absolute(git_dir)?,
            workdir: absolute(workdir)?,
            branch: branch.to_string(),
            commit_message: commit_message.to_string(),
        };

        repo.run(["config", "receive.denyCurrentBranch", "ignore"])?;
        Ok(repo)
    }

    /// The git directory
    pub fn git_dir(&self) -> &Path {
        &self.git_dir
    }

    /// The synchronized working directory
    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// The synchronized branch
    pub fn branch(&self) -> &str {
        &self.branch
    }

    /// Commit changes on the synchronized branch
    ///
    /// Stages `changes` (everything for [`ChangeSet::All`]) and commits.
    /// Returns the new revision, or `None` if there was nothing to commit.
    pub fn check_in(&self, changes: &ChangeSet) -> Result<Option<String>, GitError> {
        self.attach_head()?;

        if changes.is_all() {
            self.run(["add", "--all", "."])?;
        } else if let Err(e) = self.stage_paths(changes) {
            warn!("Staging changed paths failed, staging everything: {}", e);
            self.run(["add", "--all", "."])?;
        }

        let output = self.output(["commit", "-m", self.commit_message.as_str()])?;
        match output.status.code() {
            Some(0) => {
                let revision = self.stdout(["rev-parse", "HEAD"])?;
                info!("Created revision {}", revision);
                Ok(Some(revision))
            }
            // `git commit` exits 1 when the index matches HEAD
            Some(1) => {
                info!("No revision created");
                Ok(None)
            }
            _ => Err(GitError::failed("commit", &output)),
        }
    }

    /// Overwrite the working directory with the tree of `revision`
    ///
    /// Files that do not exist in the revision are removed, directories
    /// emptied by that removal are pruned, then the revision's files are
    /// written over the working directory.
    pub fn check_out(&self, revision: &str) -> Result<(), GitError> {
        check_revision(revision)?;
        self.attach_head()?;

        let archive = tempfile::Builder::new()
            .prefix("boxsync-")
            .suffix(".tar")
            .tempfile()
            .map_err(GitError::Io)?;
        let archive_path = archive.path().to_path_buf();

        let mut args: Vec<OsString> = vec!["archive".into(), "--format=tar".into(), "-o".into()];
        args.push(archive_path.clone().into_os_string());
        args.push(revision.into());
        self.run(&args)?;

        let members = archive_members(&archive_path)?;
        self.remove_stale_files(&members)?;

        let file = File::open(&archive_path).map_err(GitError::Io)?;
        let mut tar = tar::Archive::new(file);
        tar.unpack(&self.workdir).map_err(GitError::Io)?;

        info!("Checked out {} into {}", revision, self.workdir.display());
        Ok(())
    }

    /// Whether the working directory differs from `revision`
    ///
    /// Temporarily detaches `HEAD` at `revision` and stages the whole tree;
    /// the branch is reattached even if the comparison fails. This writes
    /// `HEAD` and the index, so it must not overlap [`check_in`](Self::check_in).
    pub fn has_changes(&self, revision: &str) -> Result<bool, GitError> {
        check_revision(revision)?;
        self.run(["update-ref", "--no-deref", "HEAD", revision])?;

        let status = self
            .run(["add", "--all", "."])
            .and_then(|()| self.stdout(["status", "--porcelain"]));
        let reattached = self.attach_head();

        let status = status?;
        reattached?;
        Ok(!status.trim().is_empty())
    }

    /// Point `HEAD` at the synchronized branch
    fn attach_head(&self) -> Result<(), GitError> {
        let head = format!("refs/heads/{}", self.branch);
        self.run(["symbolic-ref", "HEAD", head.as_str()])
    }

    /// Stage exactly the recorded paths
    fn stage_paths(&self, changes: &ChangeSet) -> Result<(), GitError> {
        let mut present = Vec::new();
        let mut missing = Vec::new();
        for path in changes.paths() {
            let relative = match self.relative(path) {
                Some(relative) => relative,
                None => {
                    debug!("Skipping {} (outside the working directory)", path.display());
                    continue;
                }
            };
            if self.workdir.join(&relative).symlink_metadata().is_ok() {
                present.push(relative);
            } else {
                missing.push(relative);
            }
        }

        for chunk in present.chunks(PATHS_PER_COMMAND) {
            let mut args: Vec<OsString> = vec!["add".into(), "--all".into(), "--".into()];
            args.extend(chunk.iter().map(|p| p.clone().into_os_string()));
            self.run(&args)?;
        }

        // Deleted paths: drop them from the index, tracked or not
        for chunk in missing.chunks(PATHS_PER_COMMAND) {
            let mut args: Vec<OsString> = vec![
                "rm".into(),
                "-r".into(),
                "--cached".into(),
                "--quiet".into(),
                "--ignore-unmatch".into(),
                "--".into(),
            ];
            args.extend(chunk.iter().map(|p| p.clone().into_os_string()));
            self.run(&args)?;
        }

        Ok(())
    }

    /// Path relative to the working directory, if inside it
    fn relative(&self, path: &Path) -> Option<PathBuf> {
        let relative = if path.is_absolute() {
            path.strip_prefix(&self.workdir).ok()?
        } else {
            path
        };
        if relative.as_os_str().is_empty() {
            return Some(PathBuf::from("."));
        }
        Some(relative.to_path_buf())
    }

    /// Remove working-directory files that are not in `members`
    fn remove_stale_files(&self, members: &HashSet<PathBuf>) -> Result<(), GitError> {
        let git_dir = self.git_dir.clone();
        let walker = WalkDir::new(&self.workdir)
            .min_depth(1)
            .contents_first(true)
            .follow_links(false)
            .into_iter()
            .filter_entry(move |e| e.path() != git_dir && e.file_name() != ".git");

        // Directories that lost an entry and may now be empty
        let mut pruned: HashSet<PathBuf> = HashSet::new();

        for entry in walker {
            let entry = entry.map_err(|e| GitError::Io(e.into()))?;
            let path = entry.path();
            let Ok(relative) = path.strip_prefix(&self.workdir) else {
                continue;
            };

            if entry.file_type().is_dir() {
                if pruned.contains(path) && is_empty_dir(path)? {
                    info!("Removing empty directory {}", path.display());
                    std::fs::remove_dir(path).map_err(GitError::Io)?;
                    if let Some(parent) = path.parent() {
                        pruned.insert(parent.to_path_buf());
                    }
                }
            } else if !members.contains(relative) {
                info!("Removing file {}", path.display());
                std::fs::remove_file(path).map_err(GitError::Io)?;
                if let Some(parent) = path.parent() {
                    pruned.insert(parent.to_path_buf());
                }
            }
        }

        Ok(())
    }

    /// Objects received by an in-progress push
    ///
    /// While an update hook runs, git keeps the pushed objects in
    /// `objects/incoming-*` and only exposes them to the hook's own
    /// environment. The daemon is a separate process, so it names those
    /// directories as alternates explicitly.
    fn quarantine_dirs(&self) -> Vec<PathBuf> {
        let Ok(entries) = std::fs::read_dir(self.git_dir.join("objects")) else {
            return Vec::new();
        };
        entries
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with("incoming-"))
            .map(|e| e.path())
            .collect()
    }

    fn command<I, S>(&self, args: I) -> (Command, String)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let args: Vec<OsString> = args.into_iter().map(|a| a.as_ref().to_os_string()).collect();
        let shown = format!(
            "git {}",
            args.iter()
                .map(|a| a.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" ")
        );

        let mut command = Command::new("git");
        command
            .arg("--git-dir")
            .arg(&self.git_dir)
            .arg("--work-tree")
            .arg(&self.workdir)
            .args(&args)
            .current_dir(&self.workdir);

        let quarantine = self.quarantine_dirs();
        if !quarantine.is_empty() {
            if let Ok(joined) = std::env::join_paths(&quarantine) {
                command.env("GIT_ALTERNATE_OBJECT_DIRECTORIES", joined);
            }
        }

        (command, shown)
    }

    /// Run a command and capture its output, whatever its exit status
    fn output<I, S>(&self, args: I) -> Result<Output, GitError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let (mut command, shown) = self.command(args);
        debug!("Running: {}", shown);
        command.output().map_err(|source| GitError::Spawn {
            command: shown,
            source,
        })
    }

    /// Run a command that must succeed
    fn run<I, S>(&self, args: I) -> Result<(), GitError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let (mut command, shown) = self.command(args);
        debug!("Running: {}", shown);
        let output = command.output().map_err(|source| GitError::Spawn {
            command: shown.clone(),
            source,
        })?;
        if output.status.success() {
            Ok(())
        } else {
            Err(GitError::failed(&shown, &output))
        }
    }

    /// Run a command that must succeed and return its trimmed stdout
    fn stdout<I, S>(&self, args: I) -> Result<String, GitError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let (mut command, shown) = self.command(args);
        debug!("Running: {}", shown);
        let output = command.output().map_err(|source| GitError::Spawn {
            command: shown.clone(),
            source,
        })?;
        if !output.status.success() {
            return Err(GitError::failed(&shown, &output));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl VersionControl for GitRepository {
    fn check_in(&self, changes: &ChangeSet) -> anyhow::Result<Option<String>> {
        Ok(GitRepository::check_in(self, changes)?)
    }

    fn check_out(&self, revision: &str) -> anyhow::Result<()> {
        Ok(GitRepository::check_out(self, revision)?)
    }

    fn has_changes(&self, revision: &str) -> anyhow::Result<bool> {
        Ok(GitRepository::has_changes(self, revision)?)
    }
}

/// Regular files and symlinks contained in a tar archive
fn archive_members(archive: &Path) -> Result<HashSet<PathBuf>, GitError> {
    let file = File::open(archive).map_err(GitError::Io)?;
    let mut tar = tar::Archive::new(file);
    let mut members = HashSet::new();

    for entry in tar.entries().map_err(GitError::Io)? {
        let entry = entry.map_err(GitError::Io)?;
        let kind = entry.header().entry_type();
        if kind.is_file() || kind.is_symlink() {
            let path = entry.path().map_err(GitError::Io)?;
            members.insert(path.into_owned());
        }
    }

    Ok(members)
}

fn check_revision(revision: &str) -> Result<(), GitError> {
    if is_revision_id(revision) {
        Ok(())
    } else {
        Err(GitError::InvalidRevision(revision.to_string()))
    }
}

fn is_empty_dir(path: &Path) -> Result<bool, GitError> {
    let mut entries = std::fs::read_dir(path).map_err(GitError::Io)?;
    Ok(entries.next().is_none())
}

fn absolute(path: &Path) -> Result<PathBuf, GitError> {
    path.canonicalize().map_err(GitError::Io)
}
