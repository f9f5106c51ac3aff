//! Outstanding-work accounting and the run lifecycle states.

use futures_util::task::AtomicWaker;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::task::Waker;

/// Counter of admitted-but-not-yet-retired work units.
///
/// Incremented when an item is admitted to the frontier, decremented exactly
/// once when the item's expansion (or drain) completes. Reaching zero wakes
/// the run coordinator; with nothing left queued, zero is the termination
/// condition.
pub struct PendingWork {
    outstanding: AtomicUsize,
    waker: AtomicWaker,
}

impl PendingWork {
    /// Constructs a counter with no outstanding work.
    pub fn new() -> Self {
        Self {
            outstanding: AtomicUsize::new(0),
            waker: AtomicWaker::new(),
        }
    }

    /// Records `count` newly admitted work units.
    pub fn add(&self, count: usize) {
        self.outstanding.fetch_add(count, Ordering::AcqRel);
    }

    /// Retires one work unit, waking the coordinator if it was the last.
    pub fn retire(&self) {
        if self.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.waker.wake();
        }
    }

    /// Number of work units still in flight or queued.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Registers the coordinator's waker for the next zero crossing.
    pub fn register(&self, waker: &Waker) {
        self.waker.register(waker);
    }

    /// Wakes the coordinator regardless of the count.
    pub fn wake(&self) {
        self.waker.wake();
    }
}

impl Default for PendingWork {
    fn default() -> Self {
        Self::new()
    }
}

/// Lifecycle of a dispatch run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Work is being admitted and expanded.
    Running,
    /// Queues are closed; in-flight executors are exiting.
    Draining,
    /// Every executor has exited. Terminal.
    Stopped,
}

impl RunState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => RunState::Running,
            1 => RunState::Draining,
            _ => RunState::Stopped,
        }
    }
}

/// Monotonic state cell; transitions never move backwards.
pub struct StateCell(AtomicU8);

impl StateCell {
    /// Starts in [`RunState::Running`].
    pub fn new() -> Self {
        Self(AtomicU8::new(RunState::Running as u8))
    }

    /// Current state.
    pub fn get(&self) -> RunState {
        RunState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Advances toward `next`; a later state already in place wins.
    pub fn advance(&self, next: RunState) {
        self.0.fetch_max(next as u8, Ordering::AcqRel);
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retire_counts_down_to_zero() {
        let pending = PendingWork::new();
        pending.add(2);
        pending.retire();
        assert_eq!(pending.outstanding(), 1);
        pending.retire();
        assert_eq!(pending.outstanding(), 0);
    }

    #[test]
    fn state_never_regresses() {
        let state = StateCell::new();
        assert_eq!(state.get(), RunState::Running);
        state.advance(RunState::Stopped);
        state.advance(RunState::Draining);
        assert_eq!(state.get(), RunState::Stopped);
    }
}
