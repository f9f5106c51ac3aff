//! Counting permit pool bounding concurrent expansion calls.

use std::error::Error;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Fixed-capacity gate acquired around every expansion call.
///
/// A full gate delays acquisition until a permit frees up; it never rejects.
/// Closing the gate wakes every blocked acquirer with [`GateClosed`] so
/// cancellation is not stalled by executors parked here.
pub struct AdmissionGate {
    permits: Arc<Semaphore>,
    capacity: usize,
}

/// Permit held for the duration of one expansion call.
///
/// Dropping the permit returns it to the gate on every exit path, including
/// expansion failure.
pub struct FetchPermit {
    _permit: OwnedSemaphorePermit,
}

/// The gate was closed by cancellation while acquiring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateClosed;

impl fmt::Display for GateClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "admission gate closed")
    }
}

impl Error for GateClosed {}

impl AdmissionGate {
    /// Builds a gate with the given permit capacity (minimum one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Configured permit capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Permits currently free.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Waits for a free permit, scoped to the returned guard.
    pub async fn admit(&self) -> Result<FetchPermit, GateClosed> {
        Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map(|permit| FetchPermit { _permit: permit })
            .map_err(|_| GateClosed)
    }

    /// Closes the gate, waking all blocked acquirers.
    pub fn close(&self) {
        self.permits.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "current_thread")]
    async fn permits_return_on_drop() {
        let gate = AdmissionGate::new(2);
        let first = gate.admit().await.expect("permit free");
        let second = gate.admit().await.expect("permit free");
        assert_eq!(gate.available(), 0);
        drop(first);
        assert_eq!(gate.available(), 1);
        drop(second);
        assert_eq!(gate.available(), 2);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn close_wakes_blocked_acquirer() {
        let gate = Arc::new(AdmissionGate::new(1));
        let held = gate.admit().await.expect("permit free");

        let waiter = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.admit().await })
        };

        gate.close();
        let result = waiter.await.expect("waiter joined");
        assert_eq!(result.err(), Some(GateClosed));
        drop(held);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn zero_capacity_is_clamped() {
        let gate = AdmissionGate::new(0);
        assert_eq!(gate.capacity(), 1);
        let permit = gate.admit().await.expect("one permit exists");
        drop(permit);
    }
}
