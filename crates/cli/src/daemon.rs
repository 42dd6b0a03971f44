//! Daemon lifecycle
//!
//! Startup: lock the repository, open it, bind the trigger server, install
//! the update hook, start watching the directory, schedule a full pass for
//! edits made while no daemon was running, then serve. Shutdown undoes the
//! same steps in reverse.

use crate::locks::DaemonLock;
use crate::sync::{Synchronizer, TRIGGER_LINES};
use anyhow::{anyhow, bail, Context, Result};
use boxsync_core::SyncConfig;
use git::{install_update_hook, uninstall_update_hook, GitRepository, HookSettings};
use hookserver::{ServerError, ServerOptions, ShutdownHandle, TriggerServer};
use rand::Rng;
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio::sync::oneshot;
use tracing::{info, warn};
use watcher::{DirectoryWatcher, IgnoreRules};

const SECRET_LEN: usize = 10;
const SECRET_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Random shared secret for this process's update hook
pub fn generate_secret() -> String {
    let mut rng = rand::thread_rng();
    (0..SECRET_LEN)
        .map(|_| SECRET_CHARS[rng.gen_range(0..SECRET_CHARS.len())] as char)
        .collect()
}

/// Load the configuration and apply command-line overrides
///
/// An explicit `config_file` must exist; otherwise `boxsync.toml` in the
/// repository is used if present.
pub fn resolve_config(
    config_file: Option<&Path>,
    repository: &Path,
    branch: Option<String>,
    timeout_secs: Option<u64>,
) -> Result<SyncConfig> {
    let mut config = match config_file {
        Some(path) => SyncConfig::load(path)?,
        None => SyncConfig::load_or_default(repository)?,
    };
    if let Some(branch) = branch {
        config.branch = branch;
    }
    if let Some(timeout_secs) = timeout_secs {
        config.debounce_secs = timeout_secs;
    }
    config.validate()?;
    Ok(config)
}

#[derive(Debug, Clone)]
pub struct DaemonOptions {
    /// Directory to watch
    pub folder: PathBuf,
    /// Git directory to synchronize with
    pub repository: PathBuf,
    pub config: SyncConfig,
}

/// A running synchronization daemon
pub struct Daemon {
    repo: Arc<GitRepository>,
    sync: Arc<Synchronizer<GitRepository>>,
    watcher: Option<DirectoryWatcher>,
    server: Option<JoinHandle<Result<(), ServerError>>>,
    stop_server: ShutdownHandle,
    stopped: oneshot::Receiver<()>,
    port: u16,
    lock: Option<DaemonLock>,
}

impl Daemon {
    pub fn start(options: DaemonOptions) -> Result<Self> {
        let DaemonOptions {
            folder,
            repository,
            config,
        } = options;

        if !folder.is_dir() {
            bail!("{} is not a directory", folder.display());
        }
        if !repository.is_dir() {
            bail!("{} is not a directory", repository.display());
        }
        let folder = folder.canonicalize()?;
        let repository = repository.canonicalize()?;

        let lock = DaemonLock::acquire(&repository)?;
        let repo = Arc::new(GitRepository::open(
            &repository,
            &folder,
            &config.branch,
            &config.commit_message,
        )?);

        let sync = Arc::new(Synchronizer::new(
            Arc::clone(&repo),
            config.debounce(),
            generate_secret(),
        )?);

        let server = TriggerServer::bind(ServerOptions::from_config(&config.server, TRIGGER_LINES))?;
        let port = server.port();
        let rules = IgnoreRules::load(repo.workdir(), Some(repo.git_dir()), config.ignore.clone())?;

        let hook = install_update_hook(
            repo.git_dir(),
            &HookSettings {
                host: config.server.host,
                port,
                secret: sync.secret(),
                branch: &config.branch,
            },
        )?;
        info!("Installed {}", hook.display());

        let watcher = match DirectoryWatcher::start(repo.workdir(), rules, sync.watch_sink()) {
            Ok(watcher) => watcher,
            Err(e) => {
                remove_hook(&repo);
                return Err(e);
            }
        };
        sync.start();

        let stop_server = server.shutdown_handle();
        let (stopped_tx, stopped) = oneshot::channel();
        let handler = Arc::clone(&sync);
        let spawned = thread::Builder::new()
            .name("trigger-server".to_string())
            .spawn(move || {
                let result = server.run(
                    move |lines: &[String], reply: &mut dyn Write, peer: SocketAddr| {
                        handler.handle_trigger(lines, reply, peer)
                    },
                );
                let _ = stopped_tx.send(());
                result
            });
        let server = match spawned {
            Ok(server) => server,
            Err(e) => {
                watcher.stop();
                sync.stop();
                remove_hook(&repo);
                return Err(e).context("Failed to spawn trigger server thread");
            }
        };

        info!(
            "Synchronizing {} with branch {} of {}",
            folder.display(),
            config.branch,
            repository.display()
        );

        Ok(Self {
            repo,
            sync,
            watcher: Some(watcher),
            server: Some(server),
            stop_server,
            stopped,
            port,
            lock: Some(lock),
        })
    }

    /// Port the trigger server listens on
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn synchronizer(&self) -> &Synchronizer<GitRepository> {
        &self.sync
    }

    /// Serve until Ctrl-C or until the trigger server gives up
    pub async fn run_until_interrupted(mut self) -> Result<()> {
        tokio::select! {
            interrupted = tokio::signal::ctrl_c() => match interrupted {
                Ok(()) => info!("Interrupted, shutting down"),
                Err(e) => warn!("Failed to listen for Ctrl-C, shutting down: {}", e),
            },
            _ = &mut self.stopped => warn!("Trigger server stopped"),
        }
        self.shutdown()
    }

    /// Stop serving and undo startup
    pub fn shutdown(mut self) -> Result<()> {
        self.stop_server.shutdown();
        let served = match self.server.take() {
            Some(server) => match server.join() {
                Ok(result) => result.map_err(anyhow::Error::from),
                Err(_) => Err(anyhow!("trigger server thread panicked")),
            },
            None => Ok(()),
        };

        if let Some(watcher) = self.watcher.take() {
            watcher.stop();
        }
        self.sync.stop();
        remove_hook(&self.repo);

        let released = match self.lock.take() {
            Some(lock) => lock.release(),
            None => Ok(()),
        };

        served.context("Trigger server failed")?;
        released?;
        info!("Stopped");
        Ok(())
    }
}

fn remove_hook(repo: &GitRepository) {
    match uninstall_update_hook(repo.git_dir()) {
        Ok(true) => info!("Removed update hook"),
        Ok(false) => warn!("Update hook was replaced by someone else, leaving it"),
        Err(e) => warn!("Failed to remove update hook: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_secret_shape() {
        let secret = generate_secret();
        assert_eq!(secret.len(), SECRET_LEN);
        assert!(secret
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit()));
        assert_ne!(generate_secret(), generate_secret());
    }

    #[test]
    fn test_resolve_config_defaults() {
        let temp_dir = TempDir::new().unwrap();

        let config = resolve_config(None, temp_dir.path(), None, None).unwrap();
        assert_eq!(config, SyncConfig::default());
    }

    #[test]
    fn test_resolve_config_overrides() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(
            temp_dir.path().join("boxsync.toml"),
            "branch = \"shared\"\ndebounce_secs = 30\n",
        )
        .unwrap();

        let from_file = resolve_config(None, temp_dir.path(), None, None).unwrap();
        assert_eq!(from_file.branch, "shared");
        assert_eq!(from_file.debounce_secs, 30);

        let overridden =
            resolve_config(None, temp_dir.path(), Some("dropbox".to_string()), Some(2)).unwrap();
        assert_eq!(overridden.branch, "dropbox");
        assert_eq!(overridden.debounce_secs, 2);
    }

    #[test]
    fn test_resolve_config_rejects_zero_timeout() {
        let temp_dir = TempDir::new().unwrap();
        assert!(resolve_config(None, temp_dir.path(), None, Some(0)).is_err());
    }

    #[test]
    fn test_explicit_config_must_exist() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("missing.toml");
        assert!(resolve_config(Some(&missing), temp_dir.path(), None, None).is_err());
    }
}
