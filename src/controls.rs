//! Tunable knobs bounding dispatch behavior.

use crate::pool::WorkItem;
use std::time::Duration;

/// Limits shared by every executor in a dispatch run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DispatchControls {
    max_depth: u8,
    gate_capacity: usize,
    deadline: Option<Duration>,
}

impl DispatchControls {
    /// Constructs controls with the given depth limit and gate capacity.
    pub fn new(max_depth: u8, gate_capacity: usize) -> Self {
        Self {
            max_depth,
            gate_capacity,
            deadline: None,
        }
    }

    /// Adds a wall-clock deadline after which the run cancels itself.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Maximum depth at which items are still expanded.
    pub fn max_depth(&self) -> u8 {
        self.max_depth
    }

    /// Maximum number of concurrent expansion calls.
    pub fn gate_capacity(&self) -> usize {
        self.gate_capacity
    }

    /// Optional wall-clock bound on the whole run.
    pub fn deadline(&self) -> Option<Duration> {
        self.deadline
    }

    /// Whether an item is shallow enough to be expanded.
    ///
    /// Items past the limit were already recorded as visited when admitted;
    /// they are retired without an expansion call.
    pub fn should_expand<K>(&self, item: &WorkItem<K>) -> bool {
        item.depth() <= self.max_depth
    }
}

impl Default for DispatchControls {
    fn default() -> Self {
        Self {
            max_depth: 4,
            gate_capacity: 4,
            deadline: None,
        }
    }
}
