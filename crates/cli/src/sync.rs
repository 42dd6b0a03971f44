//! Directory/branch synchronizer
//!
//! Glues the pieces together: directory events feed the change aggregator,
//! the debounce timer commits what accumulated, and trigger requests from
//! the update hook check out pushed revisions. Commits and checkouts are
//! kept apart by one [`Gate`].

use anyhow::Result;
use boxsync_core::{is_revision_id, ChangeSet, Gate, VersionControl};
use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use watcher::{ChangeAggregator, DebounceTimer, TimerError, TimerHandle, WatchEvent};

/// Lines in a trigger request: the secret and the pushed revision
pub const TRIGGER_LINES: usize = 2;

const AUTH_FAILED: &str = "hook auth failed";
const INVALID_REVISION: &str = "not a revision id";
const BUSY: &str = "update is in progress, try again later";
const CONFLICT: &str = "WARNING: DROPBOX CONFLICT";
const CONFLICT_EXPLANATION: &str =
    "files changed while the directory was updated; they will be committed on top of the pushed revision";

pub struct Synchronizer<V> {
    vcs: Arc<V>,
    gate: Gate,
    timer: DebounceTimer<ChangeSet>,
    changes: ChangeAggregator,
    secret: String,
}

impl<V> Synchronizer<V>
where
    V: VersionControl + 'static,
{
    /// Create a synchronizer committing through `vcs` after `debounce` of quiet
    ///
    /// Trigger requests must present `secret`.
    pub fn new(vcs: Arc<V>, debounce: Duration, secret: String) -> Result<Self, TimerError> {
        let gate = Gate::new();
        let committer = Arc::clone(&vcs);
        let timer = DebounceTimer::new(
            debounce,
            Some(gate.clone()),
            move |changes: ChangeSet, timer: &TimerHandle<ChangeSet>| {
                commit(committer.as_ref(), changes, timer)
            },
        )?;
        let changes = ChangeAggregator::new(timer.handle());

        Ok(Self {
            vcs,
            gate,
            timer,
            changes,
            secret,
        })
    }

    /// Schedule a full pass to pick up edits made while we were not watching
    pub fn start(&self) {
        if !self.changes.assume_all_changed() {
            debug!("Gate busy at startup, full pass deferred");
        }
    }

    /// Drop the pending countdown; uncommitted changes are discarded
    pub fn stop(&self) {
        self.timer.cancel();
        let dropped = self.changes.drain();
        if !dropped.is_empty() {
            warn!("Shutting down with uncommitted changes ({})", describe(&dropped));
        }
    }

    pub fn gate(&self) -> &Gate {
        &self.gate
    }

    pub fn changes(&self) -> &ChangeAggregator {
        &self.changes
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// Sink for a [`watcher::DirectoryWatcher`]
    pub fn watch_sink(&self) -> impl Fn(WatchEvent) + Send + 'static {
        let changes = self.changes.clone();
        move |event| record_event(&changes, event)
    }

    pub fn on_watch_event(&self, event: WatchEvent) {
        record_event(&self.changes, event)
    }

    /// Answer one trigger request from the update hook
    ///
    /// Only a failed checkout is reported as an error; rejected requests are
    /// answered and count as handled.
    pub fn handle_trigger(&self, lines: &[String], reply: &mut dyn Write, peer: SocketAddr) -> Result<()> {
        let [secret, revision] = lines else {
            anyhow::bail!("expected {} request lines, got {}", TRIGGER_LINES, lines.len());
        };

        if *secret != self.secret {
            warn!("Rejected trigger from {}: wrong secret", peer);
            send(reply, AUTH_FAILED);
            send(reply, "ERROR");
            return Ok(());
        }

        if !is_revision_id(revision) {
            warn!("Rejected trigger from {}: {:?} is not a revision id", peer, revision);
            send(reply, INVALID_REVISION);
            send(reply, "ERROR");
            return Ok(());
        }

        let Some(guard) = self.gate.try_guard() else {
            info!("Rejected trigger for {}: commit in progress", revision);
            send(reply, BUSY);
            send(reply, "ERROR");
            return Ok(());
        };

        send(reply, &format!("updating directory to {}...", short_revision(revision)));
        info!("Updating directory to {}", revision);
        let checkout = self.vcs.check_out(revision);
        drop(guard);

        if let Err(e) = checkout {
            self.changes.retry_pending();
            send(reply, &format!("checkout failed: {:#}", e));
            return Err(e.context(format!("failed to check out {}", revision)));
        }
        send(reply, "synced directory updated!");

        // The drift check moves HEAD and the index, so it takes the gate
        // again; a commit window that opened in between covers the drift.
        let Some(guard) = self.gate.try_guard() else {
            debug!("Commit window opened after checkout, scheduling a full pass");
            self.changes.assume_all_changed();
            send(reply, "OK");
            return Ok(());
        };
        let drift = self.vcs.has_changes(revision);
        drop(guard);

        match drift {
            Ok(true) => {
                warn!("Directory changed during checkout of {}", revision);
                self.changes.assume_all_changed();
                send(reply, CONFLICT);
                send(reply, CONFLICT_EXPLANATION);
            }
            Ok(false) => {
                self.changes.retry_pending();
            }
            Err(e) => {
                warn!("Drift check after checkout failed, scheduling a full pass: {:#}", e);
                self.changes.assume_all_changed();
            }
        }

        send(reply, "OK");
        Ok(())
    }
}

/// Debounce callback: commit what accumulated
fn commit<V>(vcs: &V, changes: ChangeSet, timer: &TimerHandle<ChangeSet>)
where
    V: VersionControl + ?Sized,
{
    if changes.is_empty() {
        debug!("Debounce fired without changes");
        return;
    }

    info!("Committing {}", describe(&changes));
    match vcs.check_in(&changes) {
        Ok(Some(revision)) => info!("Committed {}", revision),
        Ok(None) => info!("Nothing to commit"),
        Err(e) => {
            // Retried in full with the next change or trigger
            error!("Commit failed: {:#}", e);
            timer.update(ChangeSet::mark_all);
        }
    }
}

fn record_event(changes: &ChangeAggregator, event: WatchEvent) {
    match event {
        WatchEvent::Changed { path, .. } => {
            changes.record(path);
        }
        WatchEvent::Rescan => {
            changes.assume_all_changed();
        }
    }
}

fn describe(changes: &ChangeSet) -> String {
    if changes.is_all() {
        "all files".to_string()
    } else if changes.len() == 1 {
        "1 path".to_string()
    } else {
        format!("{} paths", changes.len())
    }
}

/// Write one reply line; a client that went away is not our problem
fn send(reply: &mut dyn Write, line: &str) {
    let written = reply
        .write_all(line.as_bytes())
        .and_then(|()| reply.write_all(b"\n"))
        .and_then(|()| reply.flush());
    if let Err(e) = written {
        debug!("Failed to send reply line: {}", e);
    }
}

/// First seven characters of a revision id
pub fn short_revision(revision: &str) -> &str {
    match revision.char_indices().nth(7) {
        Some((end, _)) => &revision[..end],
        None => revision,
    }
}
