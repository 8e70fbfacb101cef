use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::error::{Result, SchedulerError};
use crate::protocol::{
    ResultsResponse, StatusRequest, StatusResponse, SubmitJobPayload, WorkDispatch,
};
use crate::scheduler::job::{ConnectionId, Job, WorkRef};
use crate::scheduler::queue::WorkQueue;
use crate::scheduler::registry::{is_job_complete, JobRegistry};

/// Shared state handed to every connection handler.
///
/// Lock order is registry then queue. Neither lock is held across network
/// I/O.
#[derive(Debug)]
pub struct SchedulerContext {
    registry: RwLock<JobRegistry>,
    queue: WorkQueue,
    running: CancellationToken,
    next_connection: AtomicU64,
    completed_job_retention: Duration,
}

impl SchedulerContext {
    pub fn new(config: &SchedulerConfig, running: CancellationToken) -> Self {
        Self {
            registry: RwLock::new(JobRegistry::with_capacity(config.max_jobs)),
            queue: WorkQueue::new(running.clone()),
            running,
            next_connection: AtomicU64::new(1),
            completed_job_retention: config.completed_job_retention,
        }
    }

    pub fn registry(&self) -> &RwLock<JobRegistry> {
        &self.registry
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.running
    }

    pub fn is_running(&self) -> bool {
        !self.running.is_cancelled()
    }

    /// Clear the running flag and release every blocked dequeuer.
    pub fn shutdown(&self) {
        if self.is_running() {
            tracing::info!("Scheduler shutting down");
        }
        self.running.cancel();
    }

    pub fn next_connection_id(&self) -> ConnectionId {
        ConnectionId(self.next_connection.fetch_add(1, Ordering::Relaxed))
    }

    /// Build a job from a decoded payload and register it.
    pub async fn submit_job(&self, payload: &SubmitJobPayload) -> Result<u32> {
        let job = Job::from_payload(payload)?;
        self.register_job(job).await
    }

    /// Give the job an id and slot, then queue all of its items.
    ///
    /// Registration and queueing happen under the registry write lock, so no
    /// reader observes a registered job whose items are not yet queued.
    pub async fn register_job(&self, job: Job) -> Result<u32> {
        let mut registry = self.registry.write().await;
        if registry.is_full() {
            let evicted = registry.evict_completed(self.completed_job_retention);
            if !evicted.is_empty() {
                // ids may be drawn again, so leftover entries must not outlive them
                let purged = self.queue.remove_jobs(&evicted);
                tracing::debug!(purged, "Dropped queue entries of evicted jobs");
            }
        }

        let id = registry.register(job)?;
        let job = registry.find_job(id)?;
        self.queue
            .enqueue_all((0..job.items.len()).map(|index| WorkRef { job_id: id, index }));

        tracing::info!(
            job_id = id,
            items = job.items.len(),
            chain_len = job.chain_len,
            "Job registered"
        );
        Ok(id)
    }

    /// Wait for the next item that still needs an answer and bind it to `conn`.
    ///
    /// Returns `None` once the scheduler shuts down. Cancel safe: an entry
    /// popped before the call is dropped goes back to the head of the queue.
    pub async fn next_work(&self, conn: ConnectionId) -> Option<WorkDispatch> {
        loop {
            let mut held = HeldWork {
                queue: &self.queue,
                work: Some(self.queue.dequeue().await?),
            };
            let mut registry = self.registry.write().await;
            let work = held.work.take()?;
            match registry.bind(work, conn) {
                Some(dispatch) => {
                    tracing::debug!(
                        job_id = work.job_id,
                        index = work.index,
                        conn_id = %conn,
                        "Work item bound"
                    );
                    return Some(dispatch);
                }
                None => {
                    tracing::debug!(
                        job_id = work.job_id,
                        index = work.index,
                        "Skipping finished queue entry"
                    );
                }
            }
        }
    }

    /// Store an answer from `conn`. Returns false when it was ignored.
    pub async fn record_answer(&self, conn: ConnectionId, answer: i32) -> bool {
        let mut registry = self.registry.write().await;
        match registry.record_answer(conn, answer) {
            Some(work) => {
                tracing::debug!(
                    job_id = work.job_id,
                    index = work.index,
                    answer,
                    conn_id = %conn,
                    "Answer recorded"
                );
                true
            }
            None => {
                tracing::debug!(conn_id = %conn, answer, "Ignoring answer with no bound work item");
                false
            }
        }
    }

    /// Progress report for one job.
    ///
    /// When an unfinished item has gone untouched for the request's timeout it
    /// is queued again, at most one item per query.
    pub async fn query_status(&self, request: StatusRequest) -> StatusResponse {
        let mut registry = self.registry.write().await;
        let timeout = Duration::from_millis(request.timeout_ms as u64);

        match registry.take_stale_item(request.job_id, timeout) {
            Ok(Some(work)) => {
                tracing::info!(
                    job_id = work.job_id,
                    index = work.index,
                    timeout_ms = request.timeout_ms,
                    "Re-queueing stale work item"
                );
                self.queue.enqueue(work);
            }
            Ok(None) => {}
            Err(SchedulerError::JobNotFound(job_id)) => {
                tracing::debug!(job_id, "Status requested for unknown job");
                return StatusResponse::no_job();
            }
            Err(e) => {
                tracing::warn!(job_id = request.job_id, error = %e, "Status query failed");
                return StatusResponse::no_job();
            }
        }

        match registry.aggregate(request.job_id) {
            Ok(agg) => StatusResponse::new(agg.completed, agg.total, agg.mean),
            Err(_) => StatusResponse::no_job(),
        }
    }

    pub async fn query_results(&self, job_id: u32) -> ResultsResponse {
        let mut registry = self.registry.write().await;
        match registry.find_job_mut(job_id) {
            Ok(job) => {
                if is_job_complete(job) {
                    ResultsResponse::Success(job.results())
                } else {
                    ResultsResponse::NotComplete
                }
            }
            Err(_) => ResultsResponse::NoJob,
        }
    }

    pub async fn release_connection(&self, conn: ConnectionId) {
        self.registry.write().await.release_connection(conn);
    }
}

/// A dequeued entry not yet bound to a connection.
struct HeldWork<'a> {
    queue: &'a WorkQueue,
    work: Option<WorkRef>,
}

impl Drop for HeldWork<'_> {
    fn drop(&mut self) {
        if let Some(work) = self.work.take() {
            self.queue.requeue_front(work);
        }
    }
}
