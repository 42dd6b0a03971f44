//! Resettable debounce timer
//!
//! Calls back once the configured quiet period has elapsed since the *last*
//! call to [`DebounceTimer::start`]. Each timer owns one waiter thread
//! parked on a condition variable.
//!
//! The timer also guards a payload `T` with the same mutex that protects
//! its state. Updating the payload and restarting the countdown happen under
//! one lock acquisition, and the waiter takes the payload under that lock
//! right before calling back, so an update always lands in exactly one
//! window.
//!
//! If a [`Gate`] is attached, the timer holds it for as long as a countdown
//! is pending or the callback is running. `start` never blocks on the gate:
//! when it is taken, `start` reports failure and the timer stays idle.

use boxsync_core::Gate;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error};

/// Errors raised when creating a timer
#[derive(Debug, Error)]
pub enum TimerError {
    #[error("debounce timeout must be greater than zero")]
    ZeroTimeout,

    #[error("failed to spawn debounce thread")]
    Spawn(#[source] std::io::Error),
}

/// Countdown state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    /// No countdown pending; the gate is not held for a window
    Idle,
    /// `start` was called again while counting down; the waiter re-arms
    Reset,
    /// Counting down towards the deadline
    Primed,
}

struct Inner<T> {
    state: TimerState,
    deadline: Instant,
    /// The callback is running; it still owns the gate
    executing: bool,
    gate_held: bool,
    shutdown: bool,
    payload: T,
}

struct Shared<T> {
    inner: Mutex<Inner<T>>,
    cond: Condvar,
    timeout: Duration,
    gate: Option<Gate>,
}

impl<T> Shared<T> {
    /// Arm or re-arm the countdown, caller holds the lock
    fn start_locked(&self, inner: &mut Inner<T>) -> bool {
        if inner.shutdown {
            return false;
        }

        if !inner.gate_held {
            if let Some(gate) = &self.gate {
                if !gate.try_acquire() {
                    return false;
                }
            }
            inner.gate_held = true;
        }

        inner.deadline = Instant::now() + self.timeout;
        inner.state = match inner.state {
            TimerState::Idle => TimerState::Primed,
            TimerState::Reset | TimerState::Primed => TimerState::Reset,
        };
        self.cond.notify_all();
        true
    }

    /// Release the gate if nothing needs it anymore, caller holds the lock
    fn release_locked(&self, inner: &mut Inner<T>) {
        if inner.gate_held && !inner.executing && inner.state == TimerState::Idle {
            inner.gate_held = false;
            if let Some(gate) = &self.gate {
                gate.release();
            }
        }
    }
}

/// Cloneable handle to a [`DebounceTimer`]
///
/// Handles stay valid after the timer is dropped; `start` then always fails.
pub struct TimerHandle<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for TimerHandle<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> TimerHandle<T> {
    /// Start or restart the countdown
    ///
    /// Returns false if the attached gate could not be acquired (or the
    /// timer was shut down); no countdown is running in that case.
    pub fn start(&self) -> bool {
        let mut inner = self.shared.inner.lock();
        self.shared.start_locked(&mut inner)
    }

    /// Update the payload, then start or restart the countdown
    ///
    /// The update is kept even if starting fails.
    pub fn update_and_start(&self, update: impl FnOnce(&mut T)) -> bool {
        let mut inner = self.shared.inner.lock();
        update(&mut inner.payload);
        self.shared.start_locked(&mut inner)
    }

    /// Start the countdown only if `pending` says the payload needs it
    ///
    /// Returns whether a countdown is running afterwards.
    pub fn start_if(&self, pending: impl FnOnce(&T) -> bool) -> bool {
        let mut inner = self.shared.inner.lock();
        if inner.state != TimerState::Idle {
            return true;
        }
        if !pending(&inner.payload) {
            return false;
        }
        self.shared.start_locked(&mut inner)
    }

    /// Update the payload without touching the countdown
    pub fn update(&self, update: impl FnOnce(&mut T)) {
        let mut inner = self.shared.inner.lock();
        update(&mut inner.payload);
    }

    /// Read the payload
    pub fn inspect<R>(&self, read: impl FnOnce(&T) -> R) -> R {
        let inner = self.shared.inner.lock();
        read(&inner.payload)
    }

    /// Abort the pending countdown without calling back
    pub fn cancel(&self) {
        let mut inner = self.shared.inner.lock();
        if inner.state != TimerState::Idle {
            inner.state = TimerState::Idle;
            self.shared.release_locked(&mut inner);
            self.shared.cond.notify_all();
        }
    }

    /// Current countdown state
    pub fn state(&self) -> TimerState {
        self.shared.inner.lock().state
    }
}

impl<T: Default> TimerHandle<T> {
    /// Take the payload, leaving the default in its place
    pub fn take(&self) -> T {
        let mut inner = self.shared.inner.lock();
        std::mem::take(&mut inner.payload)
    }
}

/// Debounce timer with a dedicated waiter thread
///
/// Dropping the timer stops the waiter without calling back.
pub struct DebounceTimer<T> {
    handle: TimerHandle<T>,
    thread: Option<JoinHandle<()>>,
}

impl<T> DebounceTimer<T>
where
    T: Default + Send + 'static,
{
    /// Create a timer that calls `callback` with the drained payload
    ///
    /// The callback runs on the waiter thread with the state lock released,
    /// so it may call back into the timer through the handle it is given.
    pub fn new<F>(timeout: Duration, gate: Option<Gate>, callback: F) -> Result<Self, TimerError>
    where
        F: FnMut(T, &TimerHandle<T>) + Send + 'static,
    {
        if timeout.is_zero() {
            return Err(TimerError::ZeroTimeout);
        }

        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                state: TimerState::Idle,
                deadline: Instant::now(),
                executing: false,
                gate_held: false,
                shutdown: false,
                payload: T::default(),
            }),
            cond: Condvar::new(),
            timeout,
            gate,
        });
        let handle = TimerHandle { shared };

        let waiter = handle.clone();
        let thread = thread::Builder::new()
            .name("debounce".to_string())
            .spawn(move || run_waiter(waiter, callback))
            .map_err(TimerError::Spawn)?;

        Ok(Self {
            handle,
            thread: Some(thread),
        })
    }
}

impl<T> DebounceTimer<T> {
    /// A cloneable handle sharing this timer's state
    pub fn handle(&self) -> TimerHandle<T> {
        self.handle.clone()
    }

    /// See [`TimerHandle::start`]
    pub fn start(&self) -> bool {
        self.handle.start()
    }

    /// See [`TimerHandle::cancel`]
    pub fn cancel(&self) {
        self.handle.cancel()
    }

    /// See [`TimerHandle::state`]
    pub fn state(&self) -> TimerState {
        self.handle.state()
    }
}

impl<T> Drop for DebounceTimer<T> {
    fn drop(&mut self) {
        {
            let mut inner = self.handle.shared.inner.lock();
            inner.shutdown = true;
            inner.state = TimerState::Idle;
            self.handle.shared.cond.notify_all();
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("debounce thread panicked");
            }
        }
    }
}

fn run_waiter<T, F>(handle: TimerHandle<T>, mut callback: F)
where
    T: Default,
    F: FnMut(T, &TimerHandle<T>),
{
    let shared = &handle.shared;
    let mut inner = shared.inner.lock();

    loop {
        if inner.shutdown {
            shared.release_locked(&mut inner);
            return;
        }

        match inner.state {
            TimerState::Idle => shared.cond.wait(&mut inner),
            // Restarted while we slept; the deadline already moved forward
            TimerState::Reset => inner.state = TimerState::Primed,
            TimerState::Primed => {
                let deadline = inner.deadline;
                if Instant::now() < deadline {
                    shared.cond.wait_until(&mut inner, deadline);
                    continue;
                }
                fire(&handle, &mut inner, &mut callback);
            }
        }
    }
}

fn fire<T, F>(handle: &TimerHandle<T>, inner: &mut MutexGuard<'_, Inner<T>>, callback: &mut F)
where
    T: Default,
    F: FnMut(T, &TimerHandle<T>),
{
    inner.state = TimerState::Idle;
    inner.executing = true;
    let payload = std::mem::take(&mut inner.payload);

    debug!("debounce period elapsed, calling back");
    let outcome = MutexGuard::unlocked(inner, || {
        panic::catch_unwind(AssertUnwindSafe(|| callback(payload, handle)))
    });
    if outcome.is_err() {
        error!("debounce callback panicked");
    }

    inner.executing = false;
    // A start() during the callback keeps the gate for the new window
    handle.shared.release_locked(inner);
}
