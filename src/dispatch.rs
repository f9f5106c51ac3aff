//! Dispatcher runtime coordinating admission, expansion, and shutdown.

use crate::canonical::Canonicalizer;
use crate::completion::{PendingWork, RunState, StateCell};
use crate::controls::DispatchControls;
use crate::frontier::{AdmitOutcome, Frontier};
use crate::gate::AdmissionGate;
use crate::pool::{ExecutorPool, SubmitError};
use futures_util::future::{join_all, BoxFuture};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::{yield_now, JoinHandle};
use tokio::time::sleep;

/// Boxed error type surfaced by expansion callbacks.
pub type DynError = Box<dyn std::error::Error + Send + Sync>;

/// Expansion callback: maps an item to the children it discovers.
///
/// Called concurrently up to the gate capacity; a failure retires the item
/// without children and never stops the run by itself.
pub type FetchFn<K> =
    Arc<dyn Fn(K) -> BoxFuture<'static, Result<Vec<K>, DynError>> + Send + Sync>;

/// Policy deciding when accumulated expansion failures cancel the run.
///
/// Receives the latest failure and the total failure count so far; returning
/// true escalates to cancellation with [`CancelCause::ErrorThreshold`].
pub type EscalationPolicy<K> = Arc<dyn Fn(&ExpansionFailure<K>, usize) -> bool + Send + Sync>;

/// Why a run was cancelled before the frontier was exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CancelCause {
    /// A cancel handle was invoked.
    External,
    /// The configured deadline elapsed.
    Deadline,
    /// The escalation policy tripped on accumulated failures.
    ErrorThreshold,
}

impl fmt::Display for CancelCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelCause::External => write!(f, "external request"),
            CancelCause::Deadline => write!(f, "deadline elapsed"),
            CancelCause::ErrorThreshold => write!(f, "error threshold"),
        }
    }
}

const CAUSE_NONE: u8 = 0;
const CAUSE_EXTERNAL: u8 = 1;
const CAUSE_DEADLINE: u8 = 2;
const CAUSE_ERRORS: u8 = 3;

fn cause_to_u8(cause: CancelCause) -> u8 {
    match cause {
        CancelCause::External => CAUSE_EXTERNAL,
        CancelCause::Deadline => CAUSE_DEADLINE,
        CancelCause::ErrorThreshold => CAUSE_ERRORS,
    }
}

fn cause_from_u8(value: u8) -> Option<CancelCause> {
    match value {
        CAUSE_EXTERNAL => Some(CancelCause::External),
        CAUSE_DEADLINE => Some(CancelCause::Deadline),
        CAUSE_ERRORS => Some(CancelCause::ErrorThreshold),
        _ => None,
    }
}

/// A single failed expansion, retired without children.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExpansionFailure<K> {
    /// Canonical item whose expansion failed.
    pub item: K,
    /// Depth the item was discovered at.
    pub depth: u8,
    /// Stringified error from the expansion callback.
    pub message: String,
}

/// Aggregated outcome of a dispatch run.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchReport<K> {
    /// Every canonical key admitted over the run, expanded or not.
    pub visited: HashSet<K>,
    /// Per-item expansion failures, in completion order.
    pub failures: Vec<ExpansionFailure<K>>,
    /// Counter snapshot taken at shutdown.
    pub stats: StatsSnapshot,
}

/// Sentinel error distinguishing an aborted run from natural exhaustion.
///
/// Carries the same report a successful run would have returned, so callers
/// can still read what was visited before the cancellation.
#[derive(Debug)]
pub struct CancelledEarly<K> {
    /// What triggered the cancellation.
    pub cause: CancelCause,
    /// Partial results accumulated before shutdown.
    pub report: DispatchReport<K>,
}

impl<K> fmt::Display for CancelledEarly<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dispatch cancelled early: {}", self.cause)
    }
}

impl<K: fmt::Debug> std::error::Error for CancelledEarly<K> {}

/// Counters tracked across a run.
#[derive(Default)]
pub struct DispatchStats {
    items_expanded: AtomicUsize,
    children_discovered: AtomicUsize,
    items_admitted: AtomicUsize,
    duplicates_filtered: AtomicUsize,
    malformed_dropped: AtomicUsize,
    depth_pruned: AtomicUsize,
    drained_on_cancel: AtomicUsize,
    fetch_errors: AtomicUsize,
}

impl DispatchStats {
    fn record_expanded(&self) {
        self.items_expanded.fetch_add(1, Ordering::Relaxed);
    }

    fn record_discovered(&self) {
        self.children_discovered.fetch_add(1, Ordering::Relaxed);
    }

    fn record_admit(&self, outcome: AdmitOutcome) {
        match outcome {
            AdmitOutcome::Admitted => {
                self.items_admitted.fetch_add(1, Ordering::Relaxed);
            }
            AdmitOutcome::Duplicate => {
                self.duplicates_filtered.fetch_add(1, Ordering::Relaxed);
            }
            AdmitOutcome::Malformed => {
                self.malformed_dropped.fetch_add(1, Ordering::Relaxed);
            }
            AdmitOutcome::ShuttingDown => {}
        }
    }

    fn record_depth_pruned(&self) {
        self.depth_pruned.fetch_add(1, Ordering::Relaxed);
    }

    fn record_drained(&self) {
        self.drained_on_cancel.fetch_add(1, Ordering::Relaxed);
    }

    fn record_fetch_error(&self) {
        self.fetch_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Copies the counters into a plain snapshot.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            items_expanded: self.items_expanded.load(Ordering::Relaxed),
            children_discovered: self.children_discovered.load(Ordering::Relaxed),
            items_admitted: self.items_admitted.load(Ordering::Relaxed),
            duplicates_filtered: self.duplicates_filtered.load(Ordering::Relaxed),
            malformed_dropped: self.malformed_dropped.load(Ordering::Relaxed),
            depth_pruned: self.depth_pruned.load(Ordering::Relaxed),
            drained_on_cancel: self.drained_on_cancel.load(Ordering::Relaxed),
            fetch_errors: self.fetch_errors.load(Ordering::Relaxed),
        }
    }
}

/// Plain-value copy of the run counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Items whose expansion callback completed successfully.
    pub items_expanded: usize,
    /// Children returned by expansion callbacks, before dedup.
    pub children_discovered: usize,
    /// Items admitted to the frontier (seeds included).
    pub items_admitted: usize,
    /// Children rejected as already-seen keys.
    pub duplicates_filtered: usize,
    /// Items the canonicalizer rejected.
    pub malformed_dropped: usize,
    /// Admitted items retired past the depth limit without expansion.
    pub depth_pruned: usize,
    /// Admitted items retired unexpanded because of cancellation.
    pub drained_on_cancel: usize,
    /// Expansion callbacks that returned an error.
    pub fetch_errors: usize,
}

impl StatsSnapshot {
    /// Prints the counters in the same shape the demo binary reports them.
    pub fn report(&self, elapsed: Duration) {
        let secs = elapsed.as_secs_f32().max(f32::EPSILON);
        println!("--- dispatch stats ({secs:.2}s) ---");
        println!("items expanded: {}", self.items_expanded);
        println!("items expanded/sec: {:.2}", self.items_expanded as f32 / secs);
        println!("children discovered: {}", self.children_discovered);
        println!("items admitted: {}", self.items_admitted);
        println!("duplicate skips: {}", self.duplicates_filtered);
        println!("malformed drops: {}", self.malformed_dropped);
        println!("depth pruned: {}", self.depth_pruned);
        println!("drained on cancel: {}", self.drained_on_cancel);
        println!("expansion errors: {}", self.fetch_errors);
    }
}

struct DispatchCore<K, const EXECUTORS: usize, const INBOX: usize> {
    frontier: Frontier<K>,
    pool: ExecutorPool<K, EXECUTORS, INBOX>,
    gate: AdmissionGate,
    pending: Arc<PendingWork>,
    stats: DispatchStats,
    failures: Mutex<Vec<ExpansionFailure<K>>>,
    controls: DispatchControls,
    cancel_cause: AtomicU8,
    state: StateCell,
}

impl<K, const EXECUTORS: usize, const INBOX: usize> DispatchCore<K, EXECUTORS, INBOX>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    fn is_cancelled(&self) -> bool {
        self.cancel_cause.load(Ordering::Acquire) != CAUSE_NONE
    }

    fn cause(&self) -> Option<CancelCause> {
        cause_from_u8(self.cancel_cause.load(Ordering::Acquire))
    }

    /// First call wins; later calls (any cause) are no-ops.
    fn cancel(&self, cause: CancelCause) {
        let claimed = self.cancel_cause.compare_exchange(
            CAUSE_NONE,
            cause_to_u8(cause),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if claimed.is_err() {
            return;
        }
        self.begin_drain();
        self.pending.wake();
    }

    fn begin_drain(&self) {
        self.state.advance(RunState::Draining);
        self.frontier.shutdown();
        self.pool.shutdown_all();
        self.gate.close();
    }

    /// Resolves once the outstanding count hits zero or cancellation fires.
    async fn quiesced(&self) {
        Quiesce {
            pending: self.pending.as_ref(),
            cancel_cause: &self.cancel_cause,
        }
        .await
    }

    /// Retires items still queued after the executors exited, closing the
    /// outstanding count on the cancellation path.
    async fn retire_leftovers(&self) {
        for _item in self.frontier.drain().await {
            self.stats.record_drained();
            self.pending.retire();
        }
        for executor in self.pool.iter() {
            for _item in executor.drain().await {
                self.stats.record_drained();
                self.pending.retire();
            }
        }
    }
}

struct Quiesce<'a> {
    pending: &'a PendingWork,
    cancel_cause: &'a AtomicU8,
}

impl<'a> Quiesce<'a> {
    fn ready(&self) -> bool {
        self.pending.outstanding() == 0
            || self.cancel_cause.load(Ordering::Acquire) != CAUSE_NONE
    }
}

impl<'a> core::future::Future for Quiesce<'a> {
    type Output = ();

    fn poll(
        self: core::pin::Pin<&mut Self>,
        cx: &mut core::task::Context<'_>,
    ) -> core::task::Poll<Self::Output> {
        if self.ready() {
            core::task::Poll::Ready(())
        } else {
            self.pending.register(cx.waker());
            if self.ready() {
                core::task::Poll::Ready(())
            } else {
                core::task::Poll::Pending
            }
        }
    }
}

/// Broadcastable stop signal for a running dispatch.
///
/// Cloneable and safe to invoke from any concurrent context; only the first
/// `cancel` has effect.
pub struct CancelHandle<K, const EXECUTORS: usize, const INBOX: usize> {
    core: Arc<DispatchCore<K, EXECUTORS, INBOX>>,
}

impl<K, const EXECUTORS: usize, const INBOX: usize> Clone for CancelHandle<K, EXECUTORS, INBOX> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<K, const EXECUTORS: usize, const INBOX: usize> CancelHandle<K, EXECUTORS, INBOX>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    /// Requests cancellation; idempotent.
    pub fn cancel(&self) {
        self.core.cancel(CancelCause::External);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.core.is_cancelled()
    }

    /// Current lifecycle state of the run.
    pub fn state(&self) -> RunState {
        self.core.state.get()
    }

    /// Work units admitted but not yet retired.
    pub fn outstanding(&self) -> usize {
        self.core.pending.outstanding()
    }
}

/// Bounded breadth-first dispatcher over canonicalizable items.
///
/// `EXECUTORS` sizes the expansion pool and `INBOX` each executor's bounded
/// queue; both are fixed at compile time. Depth limit, gate capacity, and
/// deadline come from [`DispatchControls`].
pub struct Dispatcher<K, const EXECUTORS: usize, const INBOX: usize> {
    core: Arc<DispatchCore<K, EXECUTORS, INBOX>>,
    fetch: FetchFn<K>,
    seeds: Vec<K>,
    escalation: Option<EscalationPolicy<K>>,
}

impl<K, const EXECUTORS: usize, const INBOX: usize> Dispatcher<K, EXECUTORS, INBOX>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    /// Builds a dispatcher over the given seeds and expansion callback.
    pub fn new(
        seeds: Vec<K>,
        canonicalize: Canonicalizer<K>,
        fetch: FetchFn<K>,
        controls: DispatchControls,
    ) -> Self {
        let pending = Arc::new(PendingWork::new());
        let gate = AdmissionGate::new(controls.gate_capacity());
        let core = Arc::new(DispatchCore {
            frontier: Frontier::new(canonicalize, Arc::clone(&pending)),
            pool: ExecutorPool::new(),
            gate,
            pending,
            stats: DispatchStats::default(),
            failures: Mutex::new(Vec::new()),
            controls,
            cancel_cause: AtomicU8::new(CAUSE_NONE),
            state: StateCell::new(),
        });
        Self {
            core,
            fetch,
            seeds,
            escalation: None,
        }
    }

    /// Installs a policy escalating accumulated failures to cancellation.
    pub fn with_escalation(mut self, policy: EscalationPolicy<K>) -> Self {
        self.escalation = Some(policy);
        self
    }

    /// Returns a handle usable to cancel the run from another task.
    pub fn cancel_handle(&self) -> CancelHandle<K, EXECUTORS, INBOX> {
        CancelHandle {
            core: Arc::clone(&self.core),
        }
    }

    /// Runs to completion: seeds the frontier, spawns the feeder and the
    /// executor pool, waits for quiescence, then drains and joins everything
    /// before assembling the report.
    pub async fn run(self) -> Result<DispatchReport<K>, CancelledEarly<K>> {
        let Dispatcher {
            core,
            fetch,
            seeds,
            escalation,
        } = self;

        for seed in seeds {
            let outcome = core.frontier.admit(seed, 0).await;
            core.stats.record_admit(outcome);
        }

        let deadline_timer = core.controls.deadline().map(|after| {
            let core = Arc::clone(&core);
            tokio::spawn(async move {
                sleep(after).await;
                core.cancel(CancelCause::Deadline);
            })
        });

        let feeder = {
            let core = Arc::clone(&core);
            tokio::spawn(feed_loop(core))
        };

        let executors: Vec<JoinHandle<()>> = (0..EXECUTORS)
            .map(|id| {
                let core = Arc::clone(&core);
                let fetch = Arc::clone(&fetch);
                let escalation = escalation.clone();
                tokio::spawn(expansion_loop(core, fetch, escalation, id))
            })
            .collect();

        core.quiesced().await;
        core.begin_drain();

        let _ = feeder.await;
        join_all(executors).await;
        core.retire_leftovers().await;
        core.state.advance(RunState::Stopped);

        if let Some(timer) = deadline_timer {
            timer.abort();
        }

        let visited = core.frontier.take_visited().await;
        let failures = {
            let mut guard = core.failures.lock().await;
            std::mem::take(&mut *guard)
        };
        let report = DispatchReport {
            visited,
            failures,
            stats: core.stats.snapshot(),
        };

        match core.cause() {
            None => Ok(report),
            Some(cause) => Err(CancelledEarly { cause, report }),
        }
    }
}

/// Single consumer of the frontier; hands items round-robin to the pool.
async fn feed_loop<K, const EXECUTORS: usize, const INBOX: usize>(
    core: Arc<DispatchCore<K, EXECUTORS, INBOX>>,
) where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    while let Some(mut item) = core.frontier.next_item().await {
        loop {
            match core.pool.submit(item).await {
                Ok(id) => {
                    crate::debug_log!("feeder: dispatched to executor {id}");
                    let _ = id;
                    break;
                }
                Err(SubmitError::QueueFull(returned)) => {
                    if core.frontier.is_shutdown() {
                        core.frontier.requeue_front(returned).await;
                        return;
                    }
                    item = returned;
                    yield_now().await;
                }
                Err(SubmitError::ShuttingDown(returned)) => {
                    core.frontier.requeue_front(returned).await;
                    return;
                }
            }
        }
    }
}

/// One executor's loop: pull, depth-check, expand under the gate, admit
/// children, retire the item.
async fn expansion_loop<K, const EXECUTORS: usize, const INBOX: usize>(
    core: Arc<DispatchCore<K, EXECUTORS, INBOX>>,
    fetch: FetchFn<K>,
    escalation: Option<EscalationPolicy<K>>,
    id: usize,
) where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    let Some(executor) = core.pool.executor(id) else {
        return;
    };

    while let Some(item) = executor.next_item().await {
        if core.is_cancelled() {
            core.stats.record_drained();
            core.pending.retire();
            continue;
        }

        if !core.controls.should_expand(&item) {
            core.stats.record_depth_pruned();
            core.pending.retire();
            continue;
        }

        let permit = match core.gate.admit().await {
            Ok(permit) => permit,
            Err(_closed) => {
                core.stats.record_drained();
                core.pending.retire();
                continue;
            }
        };
        let outcome = (fetch)(item.payload().clone()).await;
        drop(permit);

        match outcome {
            Ok(children) => {
                core.stats.record_expanded();
                let child_depth = item.depth().saturating_add(1);
                for child in children {
                    core.stats.record_discovered();
                    let admitted = core.frontier.admit(child, child_depth).await;
                    core.stats.record_admit(admitted);
                    if admitted == AdmitOutcome::ShuttingDown {
                        break;
                    }
                }
            }
            Err(err) => {
                core.stats.record_fetch_error();
                let failure = ExpansionFailure {
                    item: item.payload().clone(),
                    depth: item.depth(),
                    message: err.to_string(),
                };
                crate::debug_log!(
                    "executor {id}: expansion failed at depth {}: {}",
                    failure.depth,
                    failure.message
                );
                let count = {
                    let mut failures = core.failures.lock().await;
                    failures.push(failure.clone());
                    failures.len()
                };
                let escalate = escalation
                    .as_ref()
                    .map(|policy| policy(&failure, count))
                    .unwrap_or(false);
                if escalate {
                    core.cancel(CancelCause::ErrorThreshold);
                }
            }
        }

        // The item retires only after its children were admitted, so the
        // outstanding count cannot dip to zero while fan-out is mid-flight.
        core.pending.retire();
    }
}
