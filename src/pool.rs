//! Executor pool with bounded per-executor inboxes and atomic wakeups.

use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};
use futures_util::task::AtomicWaker;
use heapless::Deque;
use std::array::from_fn;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Mutex;

/// Default number of executors used by the demo binary.
pub const DEFAULT_EXECUTOR_COUNT: usize = 8;
/// Default per-executor bounded inbox depth.
pub const DEFAULT_INBOX_DEPTH: usize = 64;

/// A unit of discovered work: a canonical payload plus its discovery depth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem<K> {
    payload: K,
    depth: u8,
}

impl<K> WorkItem<K> {
    /// Creates a new work item.
    pub fn new(payload: K, depth: u8) -> Self {
        Self { payload, depth }
    }

    /// Canonical payload carried by the item.
    pub fn payload(&self) -> &K {
        &self.payload
    }

    /// Depth at which the item was discovered.
    pub fn depth(&self) -> u8 {
        self.depth
    }
}

/// Errors that can emerge while handing work to an executor inbox.
#[derive(Debug)]
pub enum SubmitError<K> {
    /// The executor is shutting down and refuses more work.
    ShuttingDown(WorkItem<K>),
    /// The bounded inbox is at capacity.
    QueueFull(WorkItem<K>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubmitErrorKind {
    QueueFull,
    ShuttingDown,
}

impl<K> SubmitError<K> {
    /// Recover the original item payload.
    pub fn into_item(self) -> WorkItem<K> {
        match self {
            SubmitError::ShuttingDown(item) | SubmitError::QueueFull(item) => item,
        }
    }

    fn kind(&self) -> SubmitErrorKind {
        match self {
            SubmitError::QueueFull(_) => SubmitErrorKind::QueueFull,
            SubmitError::ShuttingDown(_) => SubmitErrorKind::ShuttingDown,
        }
    }
}

/// Pool-wide coordination for expansion executors.
pub struct ExecutorPool<K, const COUNT: usize, const INBOX: usize> {
    executors: [Executor<K, INBOX>; COUNT],
    rr_cursor: AtomicUsize,
}

impl<K, const COUNT: usize, const INBOX: usize> ExecutorPool<K, COUNT, INBOX> {
    /// Builds a pool of COUNT executors.
    pub fn new() -> Self {
        Self {
            executors: from_fn(Executor::new),
            rr_cursor: AtomicUsize::new(0),
        }
    }

    /// Returns an iterator over all executors.
    pub fn iter(&self) -> impl Iterator<Item = &Executor<K, INBOX>> {
        self.executors.iter()
    }

    /// Pulls a handle for a specific executor id.
    pub fn executor(&self, id: usize) -> Option<&Executor<K, INBOX>> {
        self.executors.get(id)
    }

    /// Submits an item in round-robin order across executor inboxes.
    pub async fn submit(&self, mut item: WorkItem<K>) -> Result<usize, SubmitError<K>> {
        let start = self.rr_cursor.fetch_add(1, Ordering::AcqRel);
        let mut last_kind = SubmitErrorKind::QueueFull;
        for offset in 0..COUNT {
            let idx = (start + offset) % COUNT;
            match self.executors[idx].submit(item).await {
                Ok(()) => return Ok(idx),
                Err(err) => {
                    last_kind = err.kind();
                    item = err.into_item();
                }
            }
        }

        Err(match last_kind {
            SubmitErrorKind::QueueFull => SubmitError::QueueFull(item),
            SubmitErrorKind::ShuttingDown => SubmitError::ShuttingDown(item),
        })
    }

    /// Signals every executor to stop accepting work and wakes all waiters.
    pub fn shutdown_all(&self) {
        for executor in self.executors.iter() {
            executor.shutdown();
        }
    }
}

impl<K, const COUNT: usize, const INBOX: usize> Default for ExecutorPool<K, COUNT, INBOX> {
    fn default() -> Self {
        Self::new()
    }
}

/// A single expansion executor with a bounded inbox and atomic wakeups.
pub struct Executor<K, const INBOX: usize> {
    id: usize,
    inbox: Mutex<Deque<WorkItem<K>, INBOX>>,
    backlog: AtomicUsize,
    shutdown: AtomicBool,
    waker: AtomicWaker,
}

impl<K, const INBOX: usize> Executor<K, INBOX> {
    fn new(id: usize) -> Self {
        Self {
            id,
            inbox: Mutex::new(Deque::new()),
            backlog: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            waker: AtomicWaker::new(),
        }
    }

    /// Executor identifier inside the pool.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Number of items waiting in the inbox.
    pub fn backlog(&self) -> usize {
        self.backlog.load(Ordering::Acquire)
    }

    /// Attempt to enqueue an item into the bounded inbox.
    pub async fn submit(&self, item: WorkItem<K>) -> Result<(), SubmitError<K>> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(SubmitError::ShuttingDown(item));
        }

        let mut inbox = self.inbox.lock().await;
        if self.shutdown.load(Ordering::Acquire) {
            return Err(SubmitError::ShuttingDown(item));
        }

        match inbox.push_back(item) {
            Ok(()) => {
                self.backlog.fetch_add(1, Ordering::Release);
                self.waker.wake();
                Ok(())
            }
            Err(item) => Err(SubmitError::QueueFull(item)),
        }
    }

    /// Try to fetch an item immediately.
    pub async fn try_next_item(&self) -> Option<WorkItem<K>> {
        let mut inbox = self.inbox.lock().await;
        let next = inbox.pop_front();
        if next.is_some() {
            self.backlog.fetch_sub(1, Ordering::Release);
        }
        next
    }

    /// Awaits until an item becomes available or the executor shuts down.
    ///
    /// Items already queued are still handed out after shutdown; `None` is
    /// returned only once the inbox is empty.
    pub async fn next_item(&self) -> Option<WorkItem<K>> {
        loop {
            if let Some(item) = self.try_next_item().await {
                return Some(item);
            }

            if self.shutdown.load(Ordering::Acquire) {
                return None;
            }

            WaitForWake { executor: self }.await;
        }
    }

    /// Signals the executor to stop accepting work and wakes all waiters.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.waker.wake();
    }

    /// Empties the inbox, returning whatever was still queued.
    pub async fn drain(&self) -> Vec<WorkItem<K>> {
        let mut inbox = self.inbox.lock().await;
        let mut drained = Vec::with_capacity(inbox.len());
        while let Some(item) = inbox.pop_front() {
            drained.push(item);
        }
        self.backlog.store(0, Ordering::Release);
        drained
    }

    fn should_wake(&self) -> bool {
        self.backlog.load(Ordering::Acquire) > 0 || self.shutdown.load(Ordering::Acquire)
    }
}

struct WaitForWake<'a, K, const INBOX: usize> {
    executor: &'a Executor<K, INBOX>,
}

impl<'a, K, const INBOX: usize> Future for WaitForWake<'a, K, INBOX> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.executor.should_wake() {
            Poll::Ready(())
        } else {
            self.executor.waker.register(cx.waker());
            if self.executor.should_wake() {
                Poll::Ready(())
            } else {
                Poll::Pending
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(flavor = "current_thread")]
    async fn round_robin_submission() {
        let pool: ExecutorPool<&'static str, 2, 4> = ExecutorPool::new();
        let idx = pool
            .submit(WorkItem::new("https://example.com", 0))
            .await
            .expect("inbox accepts");
        assert!(idx < 2);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn waiting_executor_wakes_on_submit() {
        let executor: Arc<Executor<&'static str, 4>> = Arc::new(Executor::new(0));
        let worker = {
            let executor = Arc::clone(&executor);
            tokio::spawn(async move { executor.next_item().await })
        };

        executor
            .submit(WorkItem::new("https://wake.test", 0))
            .await
            .unwrap();

        let result = worker.await.unwrap();
        assert_eq!(result.unwrap().payload(), &"https://wake.test");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn queued_items_survive_shutdown_until_drained() {
        let executor: Executor<&'static str, 4> = Executor::new(0);
        executor.submit(WorkItem::new("a", 0)).await.unwrap();
        executor.submit(WorkItem::new("b", 1)).await.unwrap();
        executor.shutdown();

        assert!(matches!(
            executor.submit(WorkItem::new("c", 0)).await,
            Err(SubmitError::ShuttingDown(_))
        ));

        // Already-queued items are still handed out for drain accounting.
        assert_eq!(executor.next_item().await.unwrap().payload(), &"a");
        let leftovers = executor.drain().await;
        assert_eq!(leftovers.len(), 1);
        assert_eq!(executor.next_item().await, None);
        assert_eq!(executor.backlog(), 0);
    }
}
