use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::scheduler::job::WorkRef;

const INITIAL_CAPACITY: usize = 100;

/// FIFO of work waiting for a worker.
///
/// A single lock guards the entries. Dequeuers park on a [`Notify`] that is
/// signalled on every enqueue, and the scheduler's shutdown token wakes all of
/// them at once. The queue grows on demand and never rejects work.
#[derive(Debug)]
pub struct WorkQueue {
    entries: Mutex<VecDeque<WorkRef>>,
    available: Notify,
    shutdown: CancellationToken,
}

impl WorkQueue {
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(INITIAL_CAPACITY)),
            available: Notify::new(),
            shutdown,
        }
    }

    fn entries(&self) -> MutexGuard<'_, VecDeque<WorkRef>> {
        // a panic while holding the lock cannot leave the deque half-updated
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append to the tail and wake one waiting dequeuer.
    pub fn enqueue(&self, work: WorkRef) {
        self.entries().push_back(work);
        self.available.notify_one();
    }

    /// Append several entries under one lock acquisition, in order.
    pub fn enqueue_all<I>(&self, work: I)
    where
        I: IntoIterator<Item = WorkRef>,
    {
        let added = {
            let mut entries = self.entries();
            let before = entries.len();
            entries.extend(work);
            entries.len() - before
        };
        if added > 0 {
            self.available.notify_one();
        }
    }

    /// Put an entry back at the head, ahead of everything queued since.
    pub fn requeue_front(&self, work: WorkRef) {
        self.entries().push_front(work);
        self.available.notify_one();
    }

    /// Drop every entry belonging to one of `job_ids`. Returns how many went.
    pub fn remove_jobs(&self, job_ids: &[u32]) -> usize {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|work| !job_ids.contains(&work.job_id));
        before - entries.len()
    }

    /// Pop the head without waiting.
    pub fn try_dequeue(&self) -> Option<WorkRef> {
        let mut entries = self.entries();
        let work = entries.pop_front();
        if work.is_some() && !entries.is_empty() {
            // pass the wakeup on so other parked dequeuers see the remainder
            self.available.notify_one();
        }
        work
    }

    /// Wait for the head entry.
    ///
    /// Returns `None` once the scheduler is shutting down, including for
    /// callers that were already parked when shutdown began.
    pub async fn dequeue(&self) -> Option<WorkRef> {
        loop {
            if self.shutdown.is_cancelled() {
                return None;
            }
            if let Some(work) = self.try_dequeue() {
                return Some(work);
            }
            tokio::select! {
                _ = self.available.notified() => {}
                _ = self.shutdown.cancelled() => return None,
            }
        }
    }

    /// Approximate number of queued entries; informational only.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}
