use std::time::Instant;

use chrono::{DateTime, Utc};

use crate::error::{Result, SchedulerError};
use crate::protocol::{OperationStep, SubmitJobPayload, WorkDispatch};

/// The only iteration count a job may request.
pub const REQUIRED_ITERATIONS: u32 = 1;

/// Identity of one accepted TCP connection. Never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Points at one work item: the owning job and the item's index within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkRef {
    pub job_id: u32,
    pub index: usize,
}

/// One item of a job, awaiting or holding its computed answer.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub job_id: u32,
    pub item: u32,
    pub operations: Vec<OperationStep>,
    pub iterations: u32,
    /// Only meaningful once `done` is set.
    pub answer: i32,
    pub done: bool,
    pub bound_connection: Option<ConnectionId>,
    /// Last time the item was queued or handed to a worker.
    pub touched_at: Instant,
}

impl WorkItem {
    fn new(item: u32, operations: Vec<OperationStep>, iterations: u32) -> Self {
        Self {
            job_id: 0,
            item,
            operations,
            iterations,
            answer: 0,
            done: false,
            bound_connection: None,
            touched_at: Instant::now(),
        }
    }

    pub fn dispatch(&self) -> WorkDispatch {
        WorkDispatch {
            item: self.item,
            operations: self.operations.clone(),
            iterations: self.iterations,
        }
    }

    pub fn touch(&mut self) {
        self.touched_at = Instant::now();
    }
}

/// A submitter's request: one operation chain applied to every item.
#[derive(Debug, Clone)]
pub struct Job {
    /// Zero until the registry assigns an id.
    pub id: u32,
    pub items: Vec<WorkItem>,
    pub chain_len: usize,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Build a job from a decoded SUBMIT_JOB payload.
    ///
    /// Every item receives its own copy of the operation chain. Fails with
    /// `InvalidPayload` on empty chains, empty item lists or an iteration count
    /// other than one, and with `Allocation` when the item table cannot be
    /// reserved.
    pub fn from_payload(payload: &SubmitJobPayload) -> Result<Self> {
        if payload.operations.is_empty() {
            return Err(SchedulerError::InvalidPayload(
                "operation chain is empty".to_string(),
            ));
        }
        if payload.items.is_empty() {
            return Err(SchedulerError::InvalidPayload("item list is empty".to_string()));
        }
        if payload.iterations != REQUIRED_ITERATIONS {
            return Err(SchedulerError::InvalidPayload(format!(
                "iterations must be {}, got {}",
                REQUIRED_ITERATIONS, payload.iterations
            )));
        }

        let mut items = Vec::new();
        items.try_reserve_exact(payload.items.len()).map_err(|e| {
            SchedulerError::Allocation(format!("{} work items: {}", payload.items.len(), e))
        })?;

        for &item in &payload.items {
            let mut operations = Vec::new();
            operations
                .try_reserve_exact(payload.operations.len())
                .map_err(|e| SchedulerError::Allocation(format!("operation chain: {}", e)))?;
            operations.extend_from_slice(&payload.operations);
            items.push(WorkItem::new(item, operations, payload.iterations));
        }

        Ok(Self {
            id: 0,
            items,
            chain_len: payload.operations.len(),
            created_at: Utc::now(),
            completed_at: None,
        })
    }

    /// Stamp the registry-assigned id onto the job and every item it owns.
    pub fn assign_id(&mut self, id: u32) {
        self.id = id;
        for item in &mut self.items {
            item.job_id = id;
        }
    }

    pub fn completed_count(&self) -> usize {
        self.items.iter().filter(|w| w.done).count()
    }

    pub fn is_complete(&self) -> bool {
        self.items.iter().all(|w| w.done)
    }

    /// `(item, answer)` pairs for every item, in submission order.
    pub fn results(&self) -> Vec<(u32, i32)> {
        self.items.iter().map(|w| (w.item, w.answer)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Operator;

    fn payload(items: Vec<u32>) -> SubmitJobPayload {
        SubmitJobPayload::new(
            vec![
                OperationStep::new(Operator::Add, 3),
                OperationStep::new(Operator::Not, 0),
            ],
            items,
        )
    }

    #[test]
    fn one_work_item_per_submitted_item() {
        let job = Job::from_payload(&payload(vec![4, 8, 15, 16])).unwrap();
        assert_eq!(job.items.len(), 4);
        assert_eq!(job.chain_len, 2);
        assert!(job.items.iter().all(|w| !w.done));
        assert!(job.items.iter().all(|w| w.bound_connection.is_none()));
        assert_eq!(
            job.items.iter().map(|w| w.item).collect::<Vec<_>>(),
            vec![4, 8, 15, 16]
        );
    }

    #[test]
    fn chains_are_independent_copies() {
        let mut job = Job::from_payload(&payload(vec![1, 2])).unwrap();
        job.items[0].operations[0].operand = 99;
        assert_eq!(job.items[1].operations[0].operand, 3);
        assert_eq!(job.items[1].operations.len(), 2);
    }

    #[test]
    fn rejects_empty_chain() {
        let p = SubmitJobPayload::new(vec![], vec![1]);
        assert!(matches!(
            Job::from_payload(&p),
            Err(SchedulerError::InvalidPayload(_))
        ));
    }

    #[test]
    fn rejects_empty_items() {
        assert!(matches!(
            Job::from_payload(&payload(vec![])),
            Err(SchedulerError::InvalidPayload(_))
        ));
    }

    #[test]
    fn rejects_wrong_iterations() {
        let mut p = payload(vec![1]);
        p.iterations = 2;
        assert!(matches!(
            Job::from_payload(&p),
            Err(SchedulerError::InvalidPayload(_))
        ));
        p.iterations = 0;
        assert!(Job::from_payload(&p).is_err());
    }

    #[test]
    fn assign_id_stamps_every_item() {
        let mut job = Job::from_payload(&payload(vec![1, 2, 3])).unwrap();
        job.assign_id(77);
        assert_eq!(job.id, 77);
        assert!(job.items.iter().all(|w| w.job_id == 77));
    }
}
