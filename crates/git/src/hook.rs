//! Update hook installation
//!
//! The hook runs inside `git receive-pack` when someone pushes to the
//! repository. For the synchronized branch it connects to the daemon, sends
//! the shared secret and the pushed revision, and accepts the push only if
//! the daemon answers `OK`.

use crate::GitError;
use std::fs;
use std::io::{BufRead, BufReader};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Second line of every hook we install; hooks without it are not ours
pub const HOOK_MARKER: &str = "# boxsync hook: do not edit!";

const TEMPLATE: &str = include_str!("../hooks/update");

/// Values substituted into the hook template
#[derive(Debug, Clone)]
pub struct HookSettings<'a> {
    pub host: IpAddr,
    pub port: u16,
    pub secret: &'a str,
    pub branch: &'a str,
}

impl HookSettings<'_> {
    /// Hook script with every placeholder replaced by a shell-quoted value
    pub fn render(&self) -> String {
        TEMPLATE
            .replace("{{PASSWORD}}", &shell_quote(self.secret))
            .replace("{{HOST}}", &shell_quote(&self.host.to_string()))
            .replace("{{PORT}}", &shell_quote(&self.port.to_string()))
            .replace("{{BRANCH}}", &shell_quote(self.branch))
    }
}

/// Write the update hook into `git_dir/hooks`
///
/// Replaces a hook previously installed by boxsync; refuses to touch any
/// other existing hook.
pub fn install_update_hook(git_dir: &Path, settings: &HookSettings<'_>) -> Result<PathBuf, GitError> {
    let hook_path = git_dir.join("hooks").join("update");

    if hook_path.exists() {
        if !is_boxsync_hook(&hook_path)? {
            return Err(GitError::ForeignHook(git_dir.to_path_buf()));
        }
        debug!("Replacing update hook");
    } else {
        debug!("Installing update hook");
        fs::create_dir_all(git_dir.join("hooks"))?;
    }

    fs::write(&hook_path, settings.render())?;
    make_executable(&hook_path)?;
    Ok(hook_path)
}

/// Remove the update hook if boxsync installed it
///
/// Returns whether a hook was removed.
pub fn uninstall_update_hook(git_dir: &Path) -> Result<bool, GitError> {
    let hook_path = git_dir.join("hooks").join("update");
    if !hook_path.exists() || !is_boxsync_hook(&hook_path)? {
        return Ok(false);
    }
    fs::remove_file(&hook_path)?;
    debug!("Removed update hook");
    Ok(true)
}

/// Whether the first line after the shebang is our marker
fn is_boxsync_hook(path: &Path) -> Result<bool, GitError> {
    let reader = BufReader::new(fs::File::open(path)?);
    let mut lines = reader.lines();

    let mut line = lines.next().transpose()?.unwrap_or_default();
    if line.starts_with("#!") {
        line = lines.next().transpose()?.unwrap_or_default();
    }
    Ok(line.trim_end() == HOOK_MARKER)
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<(), GitError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
    Ok(())
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<(), GitError> {
    Ok(())
}

/// Quote a value for a POSIX shell
///
/// Plain words are returned as-is; anything else is wrapped in double
/// quotes with `\`, `"`, `$` and `` ` `` escaped.
pub fn shell_quote(value: &str) -> String {
    const SPECIAL: &[char] = &[
        ' ', '\t', '\n', '\r', '\x0b', '\x0c', '*', '?', '[', '$', '\\', '"', '\'', '`', ';',
        '&', '|', '<', '>', '(', ')', '#', '~', '!',
    ];
    if !value.is_empty() && !value.contains(SPECIAL) {
        return value.to_string();
    }

    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        if matches!(c, '\\' | '"' | '$' | '`') {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}
