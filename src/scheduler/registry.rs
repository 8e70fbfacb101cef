use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;

use crate::error::{Result, SchedulerError};
use crate::protocol::WorkDispatch;
use crate::scheduler::job::{ConnectionId, Job, WorkRef};

pub const DEFAULT_MAX_JOBS: usize = 50;

/// Job ids are drawn from `1..=MAX_JOB_ID`.
pub const MAX_JOB_ID: u32 = 65_535;

/// Completed/total counts and the mean of the answers collected so far.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JobAggregate {
    pub completed: u32,
    pub total: u32,
    pub mean: f64,
}

/// In-memory table of live jobs.
///
/// Jobs occupy a fixed number of slots and are found by id. Each connection
/// has at most one outstanding work item, tracked in `bindings` so answers
/// resolve without scanning every job.
#[derive(Debug)]
pub struct JobRegistry {
    slots: Vec<Option<Job>>,
    bindings: HashMap<ConnectionId, WorkRef>,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_JOBS)
    }

    /// Capacity is capped at the number of distinct job ids.
    pub fn with_capacity(max_jobs: usize) -> Self {
        let max_jobs = max_jobs.min(MAX_JOB_ID as usize);
        let mut slots = Vec::with_capacity(max_jobs);
        slots.resize_with(max_jobs, || None);
        Self {
            slots,
            bindings: HashMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of live jobs.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|s| s.is_none())
    }

    pub fn is_full(&self) -> bool {
        self.slots.iter().all(|s| s.is_some())
    }

    fn contains(&self, job_id: u32) -> bool {
        self.slots.iter().flatten().any(|job| job.id == job_id)
    }

    fn generate_id(&self) -> u32 {
        let mut rng = rand::thread_rng();
        loop {
            let id = rng.gen_range(1..=MAX_JOB_ID);
            if !self.contains(id) {
                return id;
            }
        }
    }

    /// Assign a fresh id and place the job in the first free slot.
    ///
    /// Nothing is modified when the registry is full.
    pub fn register(&mut self, mut job: Job) -> Result<u32> {
        let slot = self
            .slots
            .iter()
            .position(|s| s.is_none())
            .ok_or_else(|| SchedulerError::RegistryFull(self.slots.len()))?;

        let id = self.generate_id();
        job.assign_id(id);
        self.slots[slot] = Some(job);
        Ok(id)
    }

    pub fn find_job(&self, job_id: u32) -> Result<&Job> {
        self.slots
            .iter()
            .flatten()
            .find(|job| job.id == job_id)
            .ok_or(SchedulerError::JobNotFound(job_id))
    }

    pub fn find_job_mut(&mut self, job_id: u32) -> Result<&mut Job> {
        self.slots
            .iter_mut()
            .flatten()
            .find(|job| job.id == job_id)
            .ok_or(SchedulerError::JobNotFound(job_id))
    }

    /// Bind a dequeued entry to `conn` and build the task to send.
    ///
    /// Returns `None` for entries that no longer need work: the item was
    /// answered after being re-queued, or its job has been evicted. A
    /// connection that already held another unanswered item gives it up.
    pub fn bind(&mut self, work: WorkRef, conn: ConnectionId) -> Option<WorkDispatch> {
        let item = self
            .find_job_mut(work.job_id)
            .ok()?
            .items
            .get_mut(work.index)?;
        if item.done {
            return None;
        }
        item.bound_connection = Some(conn);
        item.touch();
        let dispatch = item.dispatch();

        if let Some(previous) = self.bindings.insert(conn, work) {
            if previous != work {
                self.unbind_item(previous, conn);
            }
        }
        Some(dispatch)
    }

    fn unbind_item(&mut self, work: WorkRef, conn: ConnectionId) {
        if let Ok(job) = self.find_job_mut(work.job_id) {
            if let Some(item) = job.items.get_mut(work.index) {
                if item.bound_connection == Some(conn) {
                    item.bound_connection = None;
                }
            }
        }
    }

    /// Store `answer` on the unfinished item bound to `conn`.
    ///
    /// Late or duplicate answers, and answers from connections holding no
    /// work, are ignored. Returns the item that was updated.
    pub fn record_answer(&mut self, conn: ConnectionId, answer: i32) -> Option<WorkRef> {
        let work = *self.bindings.get(&conn)?;
        let job = match self.find_job_mut(work.job_id) {
            Ok(job) => job,
            Err(_) => {
                self.bindings.remove(&conn);
                return None;
            }
        };

        let item = job.items.get_mut(work.index)?;
        if item.done || item.bound_connection != Some(conn) {
            self.bindings.remove(&conn);
            return None;
        }

        item.answer = answer;
        item.done = true;
        is_job_complete(job);
        self.bindings.remove(&conn);
        Some(work)
    }

    /// Forget the binding held by a connection that has gone away.
    pub fn release_connection(&mut self, conn: ConnectionId) {
        if let Some(work) = self.bindings.remove(&conn) {
            self.unbind_item(work, conn);
        }
    }

    pub fn bound_work(&self, conn: ConnectionId) -> Option<WorkRef> {
        self.bindings.get(&conn).copied()
    }

    /// Counts and mean over the answers collected so far.
    pub fn aggregate(&self, job_id: u32) -> Result<JobAggregate> {
        Ok(compute_aggregate(self.find_job(job_id)?))
    }

    /// Find the first unfinished item untouched for at least `timeout`.
    ///
    /// The item's staleness clock restarts, so a single status query
    /// re-queues at most one item.
    pub fn take_stale_item(&mut self, job_id: u32, timeout: Duration) -> Result<Option<WorkRef>> {
        let job = self.find_job_mut(job_id)?;
        let stale = job
            .items
            .iter_mut()
            .enumerate()
            .find(|(_, item)| !item.done && item.touched_at.elapsed() >= timeout);

        Ok(stale.map(|(index, item)| {
            item.touch();
            WorkRef { job_id, index }
        }))
    }

    /// Drop completed jobs that finished at least `retention` ago.
    ///
    /// Returns the ids of the jobs removed.
    pub fn evict_completed(&mut self, retention: Duration) -> Vec<u32> {
        let now = Utc::now();
        let mut evicted = Vec::new();
        for slot in self.slots.iter_mut() {
            let expired = slot
                .as_ref()
                .and_then(|job| job.completed_at)
                .map(|done_at| {
                    (now - done_at)
                        .to_std()
                        .map(|age| age >= retention)
                        .unwrap_or(retention.is_zero())
                })
                .unwrap_or(false);
            if expired {
                if let Some(job) = slot.take() {
                    evicted.push(job.id);
                }
            }
        }

        if !evicted.is_empty() {
            self.bindings.retain(|_, work| !evicted.contains(&work.job_id));
            tracing::info!(count = evicted.len(), ids = ?evicted, "Evicted completed jobs");
        }
        evicted
    }
}

/// True iff every item of `job` is done.
///
/// The first time completion is observed the job is stamped with its
/// completion time and a report of every item/answer pair is logged.
pub fn is_job_complete(job: &mut Job) -> bool {
    if !job.is_complete() {
        return false;
    }
    if job.completed_at.is_none() {
        job.completed_at = Some(Utc::now());
        tracing::info!(job_id = job.id, items = job.items.len(), "Job complete");
        for work in &job.items {
            tracing::info!(job_id = job.id, item = work.item, answer = work.answer, "Job result");
        }
    }
    true
}

/// Completed/total counts plus the mean of every collected answer.
pub fn compute_aggregate(job: &Job) -> JobAggregate {
    let (completed, sum) = job
        .items
        .iter()
        .filter(|w| w.done)
        .fold((0u32, 0i64), |(n, sum), w| (n + 1, sum + w.answer as i64));

    let mean = if completed == 0 {
        0.0
    } else {
        sum as f64 / completed as f64
    };

    JobAggregate {
        completed,
        total: job.items.len() as u32,
        mean,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{OperationStep, Operator, SubmitJobPayload};

    fn job(items: Vec<u32>) -> Job {
        Job::from_payload(&SubmitJobPayload::new(
            vec![OperationStep::new(Operator::Add, 3)],
            items,
        ))
        .unwrap()
    }

    fn conn(n: u64) -> ConnectionId {
        ConnectionId(n)
    }

    #[test]
    fn capacity_never_exceeds_id_space() {
        assert_eq!(JobRegistry::with_capacity(usize::MAX).capacity(), MAX_JOB_ID as usize);
        assert_eq!(JobRegistry::with_capacity(3).capacity(), 3);
    }

    #[test]
    fn register_assigns_unique_ids() {
        let mut registry = JobRegistry::with_capacity(20);
        let mut ids = Vec::new();
        for _ in 0..20 {
            ids.push(registry.register(job(vec![1])).unwrap());
        }
        let mut unique = ids.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), 20);
        assert!(ids.iter().all(|&id| (1..=MAX_JOB_ID).contains(&id)));
        for id in ids {
            assert!(registry.find_job(id).unwrap().items.iter().all(|w| w.job_id == id));
        }
    }

    #[test]
    fn register_fails_when_full() {
        let mut registry = JobRegistry::with_capacity(2);
        registry.register(job(vec![1])).unwrap();
        registry.register(job(vec![2])).unwrap();
        assert!(registry.is_full());
        assert!(matches!(
            registry.register(job(vec![3])),
            Err(SchedulerError::RegistryFull(2))
        ));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn find_unknown_job() {
        let registry = JobRegistry::new();
        assert!(matches!(
            registry.find_job(42),
            Err(SchedulerError::JobNotFound(42))
        ));
    }

    #[test]
    fn answer_resolves_bound_item() {
        let mut registry = JobRegistry::new();
        let id = registry.register(job(vec![5, 10])).unwrap();

        let dispatch = registry.bind(WorkRef { job_id: id, index: 1 }, conn(7)).unwrap();
        assert_eq!(dispatch.item, 10);

        let recorded = registry.record_answer(conn(7), 13);
        assert_eq!(recorded, Some(WorkRef { job_id: id, index: 1 }));

        let job = registry.find_job(id).unwrap();
        assert!(job.items[1].done);
        assert_eq!(job.items[1].answer, 13);
        assert!(!job.items[0].done);
    }

    #[test]
    fn duplicate_answer_is_ignored() {
        let mut registry = JobRegistry::new();
        let id = registry.register(job(vec![5])).unwrap();
        registry.bind(WorkRef { job_id: id, index: 0 }, conn(1)).unwrap();

        assert!(registry.record_answer(conn(1), 8).is_some());
        assert!(registry.record_answer(conn(1), 99).is_none());

        let job = registry.find_job(id).unwrap();
        assert_eq!(job.items[0].answer, 8);
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn answer_without_binding_is_ignored() {
        let mut registry = JobRegistry::new();
        registry.register(job(vec![5])).unwrap();
        assert!(registry.record_answer(conn(3), 1).is_none());
    }

    #[test]
    fn rebinding_moves_item_to_latest_connection() {
        let mut registry = JobRegistry::new();
        let id = registry.register(job(vec![5])).unwrap();
        let work = WorkRef { job_id: id, index: 0 };

        registry.bind(work, conn(1)).unwrap();
        registry.bind(work, conn(2)).unwrap();

        // the first worker lost its claim
        assert!(registry.record_answer(conn(1), 100).is_none());
        assert!(registry.record_answer(conn(2), 8).is_some());
        assert_eq!(registry.find_job(id).unwrap().items[0].answer, 8);
    }

    #[test]
    fn new_binding_releases_previous_item() {
        let mut registry = JobRegistry::new();
        let id = registry.register(job(vec![5, 10])).unwrap();
        registry.bind(WorkRef { job_id: id, index: 0 }, conn(1)).unwrap();
        registry.bind(WorkRef { job_id: id, index: 1 }, conn(1)).unwrap();

        let job = registry.find_job(id).unwrap();
        assert_eq!(job.items[0].bound_connection, None);
        assert_eq!(job.items[1].bound_connection, Some(conn(1)));
        assert_eq!(registry.bound_work(conn(1)), Some(WorkRef { job_id: id, index: 1 }));
    }

    #[test]
    fn done_items_are_not_rebound() {
        let mut registry = JobRegistry::new();
        let id = registry.register(job(vec![5])).unwrap();
        let work = WorkRef { job_id: id, index: 0 };
        registry.bind(work, conn(1)).unwrap();
        registry.record_answer(conn(1), 8).unwrap();
        assert!(registry.bind(work, conn(2)).is_none());
    }

    #[test]
    fn release_connection_unbinds_item() {
        let mut registry = JobRegistry::new();
        let id = registry.register(job(vec![5])).unwrap();
        registry.bind(WorkRef { job_id: id, index: 0 }, conn(4)).unwrap();
        registry.release_connection(conn(4));
        assert_eq!(registry.find_job(id).unwrap().items[0].bound_connection, None);
        assert!(registry.record_answer(conn(4), 1).is_none());
    }

    #[test]
    fn aggregate_tracks_progress_and_mean() {
        let mut registry = JobRegistry::new();
        let id = registry.register(job(vec![5, 10, 20])).unwrap();

        let empty = registry.aggregate(id).unwrap();
        assert_eq!((empty.completed, empty.total, empty.mean), (0, 3, 0.0));

        registry.bind(WorkRef { job_id: id, index: 0 }, conn(1)).unwrap();
        registry.record_answer(conn(1), 8);
        registry.bind(WorkRef { job_id: id, index: 1 }, conn(1)).unwrap();
        registry.record_answer(conn(1), -3);

        let partial = registry.aggregate(id).unwrap();
        assert_eq!((partial.completed, partial.total), (2, 3));
        assert_eq!(partial.mean, 2.5);
    }

    #[test]
    fn aggregate_mean_does_not_overflow() {
        let mut j = job(vec![1, 2]);
        for w in &mut j.items {
            w.done = true;
            w.answer = i32::MAX;
        }
        assert_eq!(compute_aggregate(&j).mean, i32::MAX as f64);
    }

    #[test]
    fn completion_is_stamped_once() {
        let mut j = job(vec![1]);
        assert!(!is_job_complete(&mut j));
        j.items[0].done = true;
        assert!(is_job_complete(&mut j));
        let first = j.completed_at;
        assert!(first.is_some());
        assert!(is_job_complete(&mut j));
        assert_eq!(j.completed_at, first);
    }

    #[test]
    fn stale_item_is_returned_once_per_window() {
        let mut registry = JobRegistry::new();
        let id = registry.register(job(vec![5, 10])).unwrap();

        let stale = registry.take_stale_item(id, Duration::ZERO).unwrap();
        assert_eq!(stale, Some(WorkRef { job_id: id, index: 0 }));

        // a long window finds nothing fresh
        assert_eq!(
            registry.take_stale_item(id, Duration::from_secs(3600)).unwrap(),
            None
        );
    }

    #[test]
    fn stale_scan_skips_done_items() {
        let mut registry = JobRegistry::new();
        let id = registry.register(job(vec![5, 10])).unwrap();
        registry.bind(WorkRef { job_id: id, index: 0 }, conn(1)).unwrap();
        registry.record_answer(conn(1), 8);

        let stale = registry.take_stale_item(id, Duration::ZERO).unwrap();
        assert_eq!(stale, Some(WorkRef { job_id: id, index: 1 }));
    }

    #[test]
    fn eviction_only_removes_completed_jobs() {
        let mut registry = JobRegistry::with_capacity(2);
        let done = registry.register(job(vec![5])).unwrap();
        let pending = registry.register(job(vec![6])).unwrap();
        registry.bind(WorkRef { job_id: done, index: 0 }, conn(1)).unwrap();
        registry.record_answer(conn(1), 8);

        assert!(registry.evict_completed(Duration::from_secs(3600)).is_empty());
        assert_eq!(registry.evict_completed(Duration::ZERO), vec![done]);
        assert!(registry.find_job(done).is_err());
        assert!(registry.find_job(pending).is_ok());
        assert!(!registry.is_full());
    }
}
