//! Worker side of the scheduler.
//!
//! A worker holds one connection and loops: ask for work, evaluate the
//! operation chain locally, send the answer back.
//!
//! # Components
//!
//! - [`executor`]: pure evaluation of operation chains
//! - [`Worker`]: the pull loop

pub mod executor;

use std::net::SocketAddr;

use tokio_util::sync::CancellationToken;

use crate::client::SchedulerClient;
use crate::error::Result;

pub use executor::{apply_chain, execute};

pub struct Worker {
    scheduler: SocketAddr,
    max_items: Option<usize>,
}

impl Worker {
    pub fn new(scheduler: SocketAddr) -> Self {
        Self {
            scheduler,
            max_items: None,
        }
    }

    /// Stop after answering `max_items` items.
    pub fn with_max_items(mut self, max_items: usize) -> Self {
        self.max_items = Some(max_items);
        self
    }

    /// Pull and answer work until the scheduler goes away, `shutdown` fires
    /// or the item limit is reached. Returns the number of answers sent.
    pub async fn run(self, shutdown: CancellationToken) -> Result<usize> {
        let mut client = SchedulerClient::connect(self.scheduler).await?;
        tracing::info!(scheduler = %self.scheduler, "Worker connected");

        let mut answered = 0usize;
        while self.max_items.map_or(true, |max| answered < max) {
            let work = tokio::select! {
                work = client.query_work() => work?,
                _ = shutdown.cancelled() => break,
            };

            let Some(dispatch) = work else {
                tracing::info!("Scheduler closed the connection");
                break;
            };

            let answer = execute(&dispatch);
            client.submit_work(answer).await?;
            answered += 1;
            tracing::debug!(item = dispatch.item, answer, "Work item answered");
        }

        tracing::info!(answered, "Worker stopped");
        Ok(answered)
    }
}
