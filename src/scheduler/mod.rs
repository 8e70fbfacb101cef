//! Job bookkeeping: the registry of live jobs, the FIFO of pending work and
//! the shared context the connection handlers operate on.

pub mod context;
pub mod job;
pub mod queue;
pub mod registry;

pub use context::SchedulerContext;
pub use job::{ConnectionId, Job, WorkItem, WorkRef};
pub use queue::WorkQueue;
pub use registry::{JobAggregate, JobRegistry};
