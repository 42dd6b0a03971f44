//! Per-repository daemon lock
//!
//! Only one daemon may synchronize a repository at a time: two of them
//! would race each other's commits and both install the update hook.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

pub const LOCK_FILE_NAME: &str = "boxsync.lock";

/// Held for the lifetime of the daemon; removed on drop
pub struct DaemonLock {
    path: PathBuf,
    _file: File,
}

/// Lock file content
#[derive(Debug, Serialize, Deserialize)]
struct LockContent {
    pid: u32,
    started_at: u64,
}

impl DaemonLock {
    /// Lock the repository at `repo_dir`
    ///
    /// Fails while another daemon holds the lock. A file left behind by a
    /// dead process carries no flock and is taken over.
    pub fn acquire(repo_dir: &Path) -> Result<Self> {
        let path = repo_dir.join(LOCK_FILE_NAME);

        for _ in 0..2 {
            let mut file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .open(&path)
                .with_context(|| format!("Failed to open {}", path.display()))?;

            if !try_flock_exclusive(&file)? {
                // The holder may not have written its pid yet
                match read_lock_content(&mut file) {
                    Ok(content) => bail!(
                        "Repository is already synchronized by process {} (lock {})",
                        content.pid,
                        path.display()
                    ),
                    Err(_) => bail!(
                        "Repository is already synchronized by another process (lock {})",
                        path.display()
                    ),
                }
            }

            // A releasing holder unlinks the file; a lock on the old inode is worthless
            if !is_same_file(&file, &path) {
                continue;
            }

            match read_lock_content(&mut file) {
                Ok(content) if content.pid == std::process::id() => {}
                Ok(content) if is_process_alive(content.pid) => warn!(
                    "Process {} left {} behind without holding it, taking over",
                    content.pid,
                    path.display()
                ),
                Ok(content) => warn!(
                    "Taking over stale lock {} of process {}",
                    path.display(),
                    content.pid
                ),
                Err(_) => {}
            }
            write_lock_content(&mut file)?;
            return Ok(Self { path, _file: file });
        }

        bail!("Could not acquire {}", path.display())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release the lock and remove the lock file
    pub fn release(self) -> Result<()> {
        std::fs::remove_file(&self.path)
            .with_context(|| format!("Failed to remove {}", self.path.display()))
    }
}

impl Drop for DaemonLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn write_lock_content(file: &mut File) -> Result<()> {
    let content = LockContent {
        pid: std::process::id(),
        started_at: current_timestamp_ms(),
    };
    let serialized = serde_json::to_string(&content).context("Failed to serialize lock content")?;

    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(serialized.as_bytes())?;
    file.sync_all()?;
    Ok(())
}

fn read_lock_content(file: &mut File) -> Result<LockContent> {
    file.seek(SeekFrom::Start(0))?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;
    serde_json::from_str(&contents).context("Failed to parse lock content")
}

/// Try to take an exclusive flock without blocking
#[cfg(unix)]
fn try_flock_exclusive(file: &File) -> Result<bool> {
    use nix::fcntl::{flock, FlockArg};
    use std::os::unix::io::AsRawFd;

    match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
        Ok(()) => Ok(true),
        Err(nix::errno::Errno::EWOULDBLOCK) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[cfg(not(unix))]
fn try_flock_exclusive(_file: &File) -> Result<bool> {
    Ok(true)
}

#[cfg(unix)]
fn is_same_file(file: &File, path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;

    match (file.metadata(), std::fs::metadata(path)) {
        (Ok(held), Ok(current)) => held.dev() == current.dev() && held.ino() == current.ino(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn is_same_file(_file: &File, path: &Path) -> bool {
    path.exists()
}

#[cfg(target_os = "linux")]
fn is_process_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{}", pid)).exists()
}

#[cfg(all(unix, not(target_os = "linux")))]
fn is_process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    // Null signal: existence check only
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::ESRCH) => false,
        Err(_) => true,
    }
}

#[cfg(not(unix))]
fn is_process_alive(_pid: u32) -> bool {
    true
}

fn current_timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}
