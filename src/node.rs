use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::discovery::DiscoveryResponder;
use crate::error::Result;
use crate::scheduler::SchedulerContext;
use crate::server::Server;

/// A running scheduler process: TCP server plus discovery responder.
pub struct Node {
    pub config: SchedulerConfig,
    pub ctx: Arc<SchedulerContext>,
    shutdown: CancellationToken,
}

impl Node {
    /// Validate `config` and build the shared scheduler state.
    ///
    /// `shutdown` is the process-wide running flag: cancelling it, by signal
    /// or by a SHUTDOWN request, stops every component.
    pub fn new(config: SchedulerConfig, shutdown: CancellationToken) -> Result<Self> {
        config.validate()?;
        let ctx = Arc::new(SchedulerContext::new(&config, shutdown.clone()));
        Ok(Self {
            config,
            ctx,
            shutdown,
        })
    }

    /// Run until shutdown.
    ///
    /// 1. Binds the TCP listener
    /// 2. Spawns the discovery responder, when configured
    /// 3. Serves connections until the shutdown token fires
    /// 4. Waits for the responder to stop
    ///
    /// # Errors
    ///
    /// Returns an error if either socket cannot be bound. Per-connection
    /// failures are logged and never end the node.
    pub async fn run(self) -> Result<()> {
        let server = Server::bind(&self.config, self.ctx.clone()).await?;
        let tcp_addr = server.local_addr()?;

        let discovery = match self.config.discovery_addr {
            Some(addr) => Some(self.spawn_discovery(addr, tcp_addr).await?),
            None => None,
        };

        let result = server.run().await;

        // also stops the responder when the server failed
        self.shutdown.cancel();
        if let Some(handle) = discovery {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Discovery responder task failed");
            }
        }

        tracing::info!("Node stopped");
        result
    }

    async fn spawn_discovery(
        &self,
        addr: SocketAddr,
        tcp_addr: SocketAddr,
    ) -> Result<tokio::task::JoinHandle<()>> {
        let responder = DiscoveryResponder::bind(addr, tcp_addr.port()).await?;
        Ok(tokio::spawn(responder.run(self.shutdown.clone())))
    }
}
