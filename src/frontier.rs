//! Admission of discovered items and the FIFO queue feeding the executors.

use crate::canonical::Canonicalizer;
use crate::completion::PendingWork;
use crate::pool::WorkItem;
use futures_util::task::AtomicWaker;
use std::collections::{HashSet, VecDeque};
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Outcome of offering a raw item to the frontier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitOutcome {
    /// First sighting; the key was recorded and the item queued for expansion.
    Admitted,
    /// The canonical key was admitted previously.
    Duplicate,
    /// The canonicalizer rejected the raw item; dropped without accounting.
    Malformed,
    /// The frontier no longer accepts work.
    ShuttingDown,
}

/// Deduplicating admission point plus the queue of items awaiting expansion.
///
/// The visited set lives here because the frontier is the single place where
/// admission happens: the check-and-insert on the set is one critical
/// section, so two concurrent discoveries of the same key can never both be
/// admitted. A key is inserted before its item is ever queued, which is what
/// guarantees each key is dispatched at most once.
pub struct Frontier<K> {
    queue: Mutex<VecDeque<WorkItem<K>>>,
    visited: Mutex<HashSet<K>>,
    canonicalize: Canonicalizer<K>,
    pending: Arc<PendingWork>,
    queued: AtomicUsize,
    shutdown: AtomicBool,
    waker: AtomicWaker,
}

impl<K> Frontier<K>
where
    K: Eq + Hash + Clone,
{
    /// Constructs an empty frontier.
    pub fn new(canonicalize: Canonicalizer<K>, pending: Arc<PendingWork>) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            visited: Mutex::new(HashSet::new()),
            canonicalize,
            pending,
            queued: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            waker: AtomicWaker::new(),
        }
    }

    /// Number of items waiting inside the frontier queue.
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    /// Whether the frontier has stopped accepting work.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Offers a raw item at the given depth.
    ///
    /// On admission the key is recorded as visited, the outstanding-work
    /// count is incremented, and the item is queued — in that order, so the
    /// count can never read zero while an admitted item is still queued.
    pub async fn admit(&self, raw: K, depth: u8) -> AdmitOutcome {
        if self.shutdown.load(Ordering::Acquire) {
            return AdmitOutcome::ShuttingDown;
        }

        let Some(key) = (self.canonicalize)(&raw) else {
            return AdmitOutcome::Malformed;
        };

        {
            let mut visited = self.visited.lock().await;
            if !visited.insert(key.clone()) {
                return AdmitOutcome::Duplicate;
            }
        }

        self.pending.add(1);
        self.enqueue_back(WorkItem::new(key, depth)).await;
        AdmitOutcome::Admitted
    }

    async fn enqueue_back(&self, item: WorkItem<K>) {
        let mut queue = self.queue.lock().await;
        queue.push_back(item);
        self.queued.fetch_add(1, Ordering::Release);
        self.waker.wake();
    }

    /// Puts an item back at the head of the queue.
    ///
    /// Used by the feeder when the pool refuses an already-admitted item
    /// during shutdown; the item keeps its outstanding-work unit so the
    /// leftover drain can retire it.
    pub async fn requeue_front(&self, item: WorkItem<K>) {
        let mut queue = self.queue.lock().await;
        queue.push_front(item);
        self.queued.fetch_add(1, Ordering::Release);
        self.waker.wake();
    }

    async fn try_next_item(&self) -> Option<WorkItem<K>> {
        let mut queue = self.queue.lock().await;
        let next = queue.pop_front();
        if next.is_some() {
            self.queued.fetch_sub(1, Ordering::Release);
        }
        next
    }

    fn should_wake(&self) -> bool {
        self.queued.load(Ordering::Acquire) > 0 || self.shutdown.load(Ordering::Acquire)
    }

    /// Blocks until an item is available or shutdown is requested.
    ///
    /// Items still queued at shutdown are handed out so the caller can drain
    /// them; `None` means empty and shut down.
    pub async fn next_item(&self) -> Option<WorkItem<K>> {
        loop {
            if let Some(item) = self.try_next_item().await {
                return Some(item);
            }

            if self.shutdown.load(Ordering::Acquire) {
                return None;
            }

            WaitForFrontier { frontier: self }.await;
        }
    }

    /// Signals shutdown and wakes any waiters. Further admissions fail.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.waker.wake();
    }

    /// Empties the queue, returning whatever was still waiting.
    pub async fn drain(&self) -> Vec<WorkItem<K>> {
        let mut queue = self.queue.lock().await;
        self.queued.store(0, Ordering::Release);
        queue.drain(..).collect()
    }

    /// Takes the accumulated visited set, leaving the frontier empty.
    pub async fn take_visited(&self) -> HashSet<K> {
        let mut visited = self.visited.lock().await;
        std::mem::take(&mut *visited)
    }
}

struct WaitForFrontier<'a, K> {
    frontier: &'a Frontier<K>,
}

impl<'a, K> core::future::Future for WaitForFrontier<'a, K>
where
    K: Eq + Hash + Clone,
{
    type Output = ();

    fn poll(
        self: core::pin::Pin<&mut Self>,
        cx: &mut core::task::Context<'_>,
    ) -> core::task::Poll<Self::Output> {
        if self.frontier.should_wake() {
            core::task::Poll::Ready(())
        } else {
            self.frontier.waker.register(cx.waker());
            if self.frontier.should_wake() {
                core::task::Poll::Ready(())
            } else {
                core::task::Poll::Pending
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::identity;

    fn frontier() -> (Frontier<String>, Arc<PendingWork>) {
        let pending = Arc::new(PendingWork::new());
        (
            Frontier::new(identity::<String>(), Arc::clone(&pending)),
            pending,
        )
    }

    #[tokio::test(flavor = "current_thread")]
    async fn duplicates_rejected_after_first_admission() {
        let (frontier, pending) = frontier();

        assert_eq!(
            frontier.admit("https://dup.test".to_string(), 0).await,
            AdmitOutcome::Admitted
        );
        assert_eq!(
            frontier.admit("https://dup.test".to_string(), 1).await,
            AdmitOutcome::Duplicate
        );
        assert_eq!(pending.outstanding(), 1);
        assert_eq!(frontier.queued(), 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn malformed_items_never_counted() {
        let pending = Arc::new(PendingWork::new());
        let reject_all: Canonicalizer<String> = Arc::new(|_| None);
        let frontier = Frontier::new(reject_all, Arc::clone(&pending));

        assert_eq!(
            frontier.admit("anything".to_string(), 0).await,
            AdmitOutcome::Malformed
        );
        assert_eq!(pending.outstanding(), 0);
        assert_eq!(frontier.queued(), 0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn shutdown_refuses_new_work_but_hands_out_queued() {
        let (frontier, _pending) = frontier();

        frontier.admit("a".to_string(), 0).await;
        frontier.shutdown();

        assert_eq!(
            frontier.admit("b".to_string(), 0).await,
            AdmitOutcome::ShuttingDown
        );
        assert!(frontier.next_item().await.is_some());
        assert_eq!(frontier.next_item().await, None);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn waiting_consumer_wakes_on_admission() {
        let pending = Arc::new(PendingWork::new());
        let frontier = Arc::new(Frontier::new(identity::<String>(), pending));

        let consumer = {
            let frontier = Arc::clone(&frontier);
            tokio::spawn(async move { frontier.next_item().await })
        };

        frontier.admit("https://seed.test".to_string(), 0).await;

        let item = consumer.await.expect("consumer joined").expect("item");
        assert_eq!(item.payload().as_str(), "https://seed.test");
        assert_eq!(item.depth(), 0);
    }
}
