//! TCP front end of the scheduler.
//!
//! [`Server`] owns the listening socket. Each accepted connection gets its own
//! task running a [`dispatcher`], and the number of live connections is capped
//! by a semaphore. Once the shared shutdown token fires the accept loop stops,
//! open connections get a grace period to finish and any stragglers are
//! aborted.

pub mod dispatcher;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;

use crate::config::SchedulerConfig;
use crate::error::Result;
use crate::scheduler::SchedulerContext;

pub struct Server {
    listener: TcpListener,
    ctx: Arc<SchedulerContext>,
    max_connections: usize,
    drain_timeout: Duration,
}

impl Server {
    pub async fn bind(config: &SchedulerConfig, ctx: Arc<SchedulerContext>) -> Result<Self> {
        let listener = TcpListener::bind(config.listen_addr).await?;
        Ok(Self::from_listener(listener, config, ctx))
    }

    /// Serve on an already bound listener.
    pub fn from_listener(
        listener: TcpListener,
        config: &SchedulerConfig,
        ctx: Arc<SchedulerContext>,
    ) -> Self {
        Self {
            listener,
            ctx,
            max_connections: config.max_connections.max(1),
            drain_timeout: config.drain_timeout,
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until shutdown, then drain them.
    pub async fn run(self) -> Result<()> {
        let addr = self.local_addr()?;
        let shutdown = self.ctx.shutdown_token().clone();
        let limit = Arc::new(Semaphore::new(self.max_connections));
        let mut connections = JoinSet::new();

        tracing::info!(addr = %addr, max_connections = self.max_connections, "Scheduler listening");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,

                Some(finished) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = finished {
                        if e.is_panic() {
                            tracing::error!(error = %e, "Connection handler panicked");
                        }
                    }
                }

                (permit, accepted) = accept_with_permit(&self.listener, &limit) => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let ctx = self.ctx.clone();
                            connections.spawn(async move {
                                dispatcher::handle_connection(ctx, stream, peer).await;
                                drop(permit);
                            });
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed to accept connection");
                            tokio::time::sleep(Duration::from_millis(50)).await;
                        }
                    }
                }
            }
        }

        drop(self.listener);
        tracing::info!(open = connections.len(), "Listener closed, draining connections");

        if tokio::time::timeout(self.drain_timeout, drain(&mut connections))
            .await
            .is_err()
        {
            tracing::warn!(
                remaining = connections.len(),
                "Drain timeout elapsed, aborting connections"
            );
            connections.shutdown().await;
        }

        tracing::info!("Server stopped");
        Ok(())
    }
}

async fn accept_with_permit(
    listener: &TcpListener,
    limit: &Arc<Semaphore>,
) -> (
    Option<OwnedSemaphorePermit>,
    std::io::Result<(tokio::net::TcpStream, SocketAddr)>,
) {
    // never closed
    let permit = limit.clone().acquire_owned().await.ok();
    let accepted = listener.accept().await;
    (permit, accepted)
}

async fn drain(connections: &mut JoinSet<()>) {
    while connections.join_next().await.is_some() {}
}
