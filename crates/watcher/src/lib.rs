//! File system watching for boxsync
//!
//! This crate provides:
//! - Recursive directory watching through `notify`
//! - Ignore rules for git metadata, editor scratch files and .gitignore
//! - The resettable debounce timer
//! - Change aggregation between debounce fires

pub mod aggregate;
pub mod debounce;
pub mod ignore;

pub use aggregate::ChangeAggregator;
pub use debounce::{DebounceTimer, TimerError, TimerHandle, TimerState};
pub use ignore::IgnoreRules;

use anyhow::{Context, Result};
use crossbeam_channel::{unbounded, Receiver};
use notify::event::{EventKind as NotifyKind, ModifyKind};
use notify::{RecommendedWatcher, RecursiveMode, Watcher as _};
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Type of file system event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// File or directory created
    Create,
    /// File contents or metadata modified
    Modify,
    /// File or directory deleted
    Delete,
    /// File or directory renamed; both old and new paths are reported
    Rename,
}

impl EventKind {
    fn describe(self) -> &'static str {
        match self {
            EventKind::Create => "Created",
            EventKind::Modify => "Modified",
            EventKind::Delete => "Deleted",
            EventKind::Rename => "Renamed",
        }
    }
}

/// Event delivered to the watcher's sink
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// A path under the watched directory changed
    Changed { path: PathBuf, kind: EventKind },
    /// Events were lost; every path must be considered dirty
    Rescan,
}

/// Recursive watcher for one directory
///
/// Owns its `notify` registration and the thread that dispatches events to
/// the sink. Dropping the watcher unregisters and stops the thread.
pub struct DirectoryWatcher {
    root: PathBuf,
    watcher: Option<RecommendedWatcher>,
    dispatcher: Option<JoinHandle<()>>,
}

impl DirectoryWatcher {
    /// Start watching `root`, passing filtered events to `sink`
    pub fn start<F>(root: &Path, rules: IgnoreRules, sink: F) -> Result<Self>
    where
        F: Fn(WatchEvent) + Send + 'static,
    {
        let (tx, rx) = unbounded();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            // Receiver gone means we are shutting down
            let _ = tx.send(res);
        })
        .context("Failed to create directory watcher")?;

        watcher
            .watch(root, RecursiveMode::Recursive)
            .with_context(|| format!("Failed to watch {}", root.display()))?;

        let dispatcher = thread::Builder::new()
            .name("watch-dispatch".to_string())
            .spawn(move || dispatch(rx, rules, sink))
            .context("Failed to spawn watch dispatch thread")?;

        debug!("Watching {}", root.display());
        Ok(Self {
            root: root.to_path_buf(),
            watcher: Some(watcher),
            dispatcher: Some(dispatcher),
        })
    }

    /// Watched directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Stop watching and wait for pending events to be dispatched
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        // Dropping the notify watcher drops the sender, ending dispatch
        self.watcher.take();
        if let Some(dispatcher) = self.dispatcher.take() {
            if dispatcher.join().is_err() {
                warn!("Watch dispatch thread panicked");
            }
        }
    }
}

impl Drop for DirectoryWatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn dispatch<F>(rx: Receiver<notify::Result<notify::Event>>, mut rules: IgnoreRules, sink: F)
where
    F: Fn(WatchEvent),
{
    for res in rx {
        let event = match res {
            Ok(event) => event,
            Err(e) => {
                warn!("Watch error, assuming everything changed: {}", e);
                sink(WatchEvent::Rescan);
                continue;
            }
        };

        if event.need_rescan() {
            warn!("Watcher queue overflowed, assuming everything changed");
            sink(WatchEvent::Rescan);
            continue;
        }

        let Some(kind) = classify(&event.kind) else {
            continue;
        };

        for path in event.paths {
            if rules.should_ignore(&path) {
                continue;
            }
            if path.file_name().map_or(false, |n| n == ".gitignore")
                && path.parent() == Some(rules.root())
            {
                if let Err(e) = rules.reload() {
                    warn!("Failed to reload .gitignore: {}", e);
                }
            }
            info!("{} {}", kind.describe(), path.display());
            sink(WatchEvent::Changed { path, kind });
        }
    }
    debug!("Watch dispatch finished");
}

/// Map notify's event kinds onto ours; access events are dropped
fn classify(kind: &NotifyKind) -> Option<EventKind> {
    match kind {
        NotifyKind::Create(_) => Some(EventKind::Create),
        NotifyKind::Remove(_) => Some(EventKind::Delete),
        NotifyKind::Modify(ModifyKind::Name(_)) => Some(EventKind::Rename),
        NotifyKind::Modify(_) => Some(EventKind::Modify),
        NotifyKind::Any | NotifyKind::Other => Some(EventKind::Modify),
        NotifyKind::Access(_) => None,
    }
}
