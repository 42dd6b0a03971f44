//! Change aggregation between debounce fires
//!
//! Paths are accumulated inside the debounce timer's payload, so recording a
//! path and restarting the countdown happen under one lock, and the set is
//! drained under that same lock when the timer fires.

use crate::debounce::TimerHandle;
use boxsync_core::ChangeSet;
use std::path::PathBuf;
use tracing::debug;

/// Thread-safe accumulator of changed paths, tied to a debounce timer
#[derive(Clone)]
pub struct ChangeAggregator {
    timer: TimerHandle<ChangeSet>,
}

impl ChangeAggregator {
    /// Wrap the handle of a `DebounceTimer<ChangeSet>`
    pub fn new(timer: TimerHandle<ChangeSet>) -> Self {
        Self { timer }
    }

    /// Record a changed path and restart the countdown
    ///
    /// Returns whether a countdown is running. The path is kept either way,
    /// so a busy gate never loses it.
    pub fn record(&self, path: impl Into<PathBuf>) -> bool {
        let path = path.into();
        let started = self.timer.update_and_start(|changes| changes.insert(path));
        if !started {
            debug!("change recorded while the gate is busy, deferring commit");
        }
        started
    }

    /// Mark every path as dirty and restart the countdown
    pub fn assume_all_changed(&self) -> bool {
        self.timer.update_and_start(ChangeSet::mark_all)
    }

    /// Start a countdown if changes were recorded but never committed
    pub fn retry_pending(&self) -> bool {
        self.timer.start_if(|changes| !changes.is_empty())
    }

    /// Take the accumulated changes, leaving an empty set
    pub fn drain(&self) -> ChangeSet {
        self.timer.take()
    }

    /// Copy of the accumulated changes
    pub fn snapshot(&self) -> ChangeSet {
        self.timer.inspect(ChangeSet::clone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debounce::{DebounceTimer, TimerState};
    use boxsync_core::Gate;
    use crossbeam_channel::{unbounded, Receiver};
    use std::path::Path;
    use std::thread;
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_millis(150);

    fn aggregator(gate: Gate) -> (DebounceTimer<ChangeSet>, ChangeAggregator, Receiver<ChangeSet>) {
        let (tx, rx) = unbounded();
        let timer = DebounceTimer::new(TIMEOUT, Some(gate), move |changes, _: &TimerHandle<_>| {
            tx.send(changes).unwrap();
        })
        .unwrap();
        let changes = ChangeAggregator::new(timer.handle());
        (timer, changes, rx)
    }

    #[test]
    fn test_burst_coalesces_into_one_fire() {
        let (_timer, changes, rx) = aggregator(Gate::new());

        for name in ["a", "b", "c", "a", "d"] {
            assert!(changes.record(format!("/w/{}", name)));
            thread::sleep(TIMEOUT / 4);
        }

        let fired = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        let expected: ChangeSet = ["/w/a", "/w/b", "/w/c", "/w/d"].into_iter().collect();
        assert_eq!(fired, expected);
        assert!(rx.recv_timeout(TIMEOUT * 3).is_err());
        assert!(changes.snapshot().is_empty());
    }

    #[test]
    fn test_busy_gate_retains_paths() {
        let gate = Gate::new();
        let (timer, changes, rx) = aggregator(gate.clone());

        assert!(gate.try_acquire());
        assert!(!changes.record("/w/a"));
        assert!(!changes.record("/w/b"));
        assert_eq!(timer.state(), TimerState::Idle);
        assert!(rx.recv_timeout(TIMEOUT * 2).is_err());
        assert_eq!(changes.snapshot().len(), 2);

        gate.release();
        assert!(changes.retry_pending());
        let fired = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(fired.contains(Path::new("/w/a")));
        assert!(fired.contains(Path::new("/w/b")));
    }

    #[test]
    fn test_retry_without_pending_changes_stays_idle() {
        let gate = Gate::new();
        let (timer, changes, _rx) = aggregator(gate.clone());

        assert!(!changes.retry_pending());
        assert_eq!(timer.state(), TimerState::Idle);
        assert!(!gate.is_held());
    }

    #[test]
    fn test_assume_all_changed_overrides_paths() {
        let (_timer, changes, rx) = aggregator(Gate::new());

        changes.record("/w/a");
        assert!(changes.assume_all_changed());
        changes.record("/w/b");

        let fired = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(fired.is_all());
    }

    #[test]
    fn test_record_during_fire_goes_to_next_window() {
        let gate = Gate::new();
        let (tx, rx) = unbounded();
        let (entered_tx, entered_rx) = unbounded();
        let timer = DebounceTimer::new(
            TIMEOUT,
            Some(gate.clone()),
            move |fired: ChangeSet, _: &TimerHandle<_>| {
                entered_tx.send(()).unwrap();
                thread::sleep(Duration::from_millis(100));
                tx.send(fired).unwrap();
            },
        )
        .unwrap();
        let changes = ChangeAggregator::new(timer.handle());

        changes.record("/w/first");
        entered_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(changes.record("/w/second"));

        let first = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        let second = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(first, ["/w/first"].into_iter().collect::<ChangeSet>());
        assert_eq!(second, ["/w/second"].into_iter().collect::<ChangeSet>());
    }

    #[test]
    fn test_drain_clears() {
        let (timer, changes, _rx) = aggregator(Gate::new());
        changes.record("/w/a");
        timer.cancel();

        let drained = changes.drain();
        assert_eq!(drained.len(), 1);
        assert!(changes.drain().is_empty());
    }
}
