//! Cooperative shutdown for a sync run
//!
//! One [`ShutdownCoordinator`] is created per run and shared by the driver,
//! the lister, the reconciler and every worker. Signal handlers only call
//! [`ShutdownCoordinator::request_shutdown`]; everything else polls or waits
//! on the state.
//!
//! ```text
//! Running ──interrupt──▶ Draining ──interrupt──▶ ForceStopping
//!    │                      │                        │
//!    └──────finish──────────┴─────────finish─────────┴──▶ Stopped
//! ```

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

use log::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    /// Normal submission and processing
    Running,
    /// No new work is dispatched; in-flight messages finish
    Draining,
    /// In-flight work is abandoned at the next checkpoint
    ForceStopping,
    /// The run is over
    Stopped,
}

/// Which states cut a wait short
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    /// Any shutdown request (listing, reconciliation)
    OnShutdown,
    /// Only a forced stop (a message already being processed)
    OnForceStop,
}

impl Interrupt {
    fn applies(self, state: ShutdownState) -> bool {
        match self {
            Interrupt::OnShutdown => state != ShutdownState::Running,
            Interrupt::OnForceStop => {
                matches!(state, ShutdownState::ForceStopping | ShutdownState::Stopped)
            }
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: ShutdownState,
    interrupts: u32,
}

/// Shared cancellation context for one sync run
#[derive(Debug)]
pub struct ShutdownCoordinator {
    inner: Mutex<Inner>,
    changed: Condvar,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: ShutdownState::Running,
                interrupts: 0,
            }),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> ShutdownState {
        self.lock().state
    }

    /// Record an interrupt signal and return the resulting state
    ///
    /// The first interrupt starts a drain, the second forces a stop.
    /// Interrupts after the run has stopped are ignored.
    pub fn request_shutdown(&self) -> ShutdownState {
        let mut inner = self.lock();
        let next = match inner.state {
            ShutdownState::Running => {
                info!("Shutdown requested, waiting for in-flight messages to finish (interrupt again to force)");
                ShutdownState::Draining
            }
            ShutdownState::Draining => {
                warn!("Forced shutdown, abandoning in-flight messages");
                ShutdownState::ForceStopping
            }
            other => other,
        };
        if next != inner.state {
            inner.interrupts += 1;
            inner.state = next;
            self.changed.notify_all();
        }
        next
    }

    /// Mark the run as finished, returning the state it finished from
    pub fn finish(&self) -> ShutdownState {
        let mut inner = self.lock();
        let previous = inner.state;
        inner.state = ShutdownState::Stopped;
        self.changed.notify_all();
        previous
    }

    /// New messages may be handed to workers
    pub fn should_dispatch(&self) -> bool {
        self.state() == ShutdownState::Running
    }

    /// Any shutdown has been requested (or the run is over)
    pub fn is_stopping(&self) -> bool {
        self.state() != ShutdownState::Running
    }

    /// In-flight work should be abandoned
    pub fn is_force_stopping(&self) -> bool {
        Interrupt::OnForceStop.applies(self.state())
    }

    /// At least one interrupt was received during this run
    pub fn was_interrupted(&self) -> bool {
        self.lock().interrupts > 0
    }

    /// A second interrupt was received during this run
    pub fn was_forced(&self) -> bool {
        self.lock().interrupts > 1
    }

    /// Sleep for `duration` unless `interrupt` applies first
    ///
    /// Returns `true` if the full duration elapsed.
    pub fn sleep(&self, duration: Duration, interrupt: Interrupt) -> bool {
        let guard = self.lock();
        let (guard, _) = self
            .changed
            .wait_timeout_while(guard, duration, |inner| !interrupt.applies(inner.state))
            .unwrap_or_else(|e| e.into_inner());
        !interrupt.applies(guard.state)
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
