use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::error::{Result, SchedulerError};
use crate::protocol::{
    Header, Operation, ResultsRequest, StatusRequest, SubmitJobPayload, WorkAnswer,
};
use crate::scheduler::{ConnectionId, SchedulerContext};

/// What the connection loop should do after a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

/// Serves every request arriving on one TCP connection.
///
/// Requests are handled strictly one at a time. A decode failure or I/O error
/// ends this connection only; the shared scheduler state is left untouched.
struct Dispatcher {
    ctx: Arc<SchedulerContext>,
    conn: ConnectionId,
    peer: SocketAddr,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// Run the protocol on an accepted stream until it closes.
pub async fn handle_connection(ctx: Arc<SchedulerContext>, stream: TcpStream, peer: SocketAddr) {
    let conn = ctx.next_connection_id();
    let (read_half, write_half) = stream.into_split();
    let mut dispatcher = Dispatcher {
        ctx: ctx.clone(),
        conn,
        peer,
        reader: BufReader::new(read_half),
        writer: write_half,
    };

    tracing::debug!(conn_id = %conn, peer = %peer, "Connection accepted");
    dispatcher.run().await;
    ctx.release_connection(conn).await;
    tracing::debug!(conn_id = %conn, peer = %peer, "Connection closed");
}

impl Dispatcher {
    async fn run(&mut self) {
        let shutdown = self.ctx.shutdown_token().clone();
        loop {
            let header = tokio::select! {
                header = Header::read_from(&mut self.reader) => header,
                _ = shutdown.cancelled() => break,
            };

            let operation = match header {
                Ok(header) => header.operation,
                Err(e) if e.is_disconnect() => break,
                Err(e) => {
                    tracing::warn!(
                        conn_id = %self.conn,
                        peer = %self.peer,
                        error = %e,
                        "Protocol error, dropping connection"
                    );
                    break;
                }
            };

            match self.dispatch(operation).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Close) => break,
                Err(SchedulerError::Protocol(e)) if e.is_disconnect() => {
                    tracing::debug!(
                        conn_id = %self.conn,
                        op = %operation,
                        "Peer closed mid-request"
                    );
                    break;
                }
                Err(e) => {
                    tracing::warn!(
                        conn_id = %self.conn,
                        op = %operation,
                        error = %e,
                        "Request failed, dropping connection"
                    );
                    break;
                }
            }
        }
    }

    async fn dispatch(&mut self, operation: Operation) -> Result<Flow> {
        match operation {
            Operation::SubmitJob => self.submit_job().await,
            Operation::QueryWork => self.query_work().await,
            Operation::SubmitWork => self.submit_work().await,
            Operation::QueryStatus => self.query_status().await,
            Operation::QueryResults => self.query_results().await,
            Operation::Shutdown => self.shutdown().await,
        }
    }

    async fn submit_job(&mut self) -> Result<Flow> {
        let payload = SubmitJobPayload::read_from(&mut self.reader).await?;
        match self.ctx.submit_job(&payload).await {
            Ok(job_id) => {
                self.writer.write_all(&job_id.to_be_bytes()).await?;
                Ok(Flow::Continue)
            }
            Err(e @ SchedulerError::Allocation(_)) => {
                tracing::error!(conn_id = %self.conn, error = %e, "Job creation failed");
                Ok(Flow::Close)
            }
            Err(e) => {
                tracing::warn!(conn_id = %self.conn, error = %e, "Job rejected");
                Ok(Flow::Close)
            }
        }
    }

    async fn query_work(&mut self) -> Result<Flow> {
        let ctx = self.ctx.clone();
        let next = ctx.next_work(self.conn);
        tokio::pin!(next);

        let work = tokio::select! {
            work = &mut next => work,
            closed = peer_closed(&mut self.reader) => {
                if closed {
                    tracing::debug!(conn_id = %self.conn, "Worker left while waiting for work");
                    return Ok(Flow::Close);
                }
                // pipelined bytes stay buffered until the reply is sent
                next.await
            }
        };

        match work {
            Some(dispatch) => {
                self.writer.write_all(&dispatch.to_bytes()).await?;
                Ok(Flow::Continue)
            }
            // shutting down: the worker gets no reply
            None => Ok(Flow::Close),
        }
    }

    async fn submit_work(&mut self) -> Result<Flow> {
        let WorkAnswer { answer } = WorkAnswer::read_from(&mut self.reader).await?;
        self.ctx.record_answer(self.conn, answer).await;
        Ok(Flow::Continue)
    }

    async fn query_status(&mut self) -> Result<Flow> {
        let request = StatusRequest::read_from(&mut self.reader).await?;
        let response = self.ctx.query_status(request).await;
        self.writer.write_all(&response.to_bytes()).await?;
        Ok(Flow::Continue)
    }

    async fn query_results(&mut self) -> Result<Flow> {
        let ResultsRequest { job_id } = ResultsRequest::read_from(&mut self.reader).await?;
        let response = self.ctx.query_results(job_id).await;
        self.writer.write_all(&response.to_bytes()).await?;
        Ok(Flow::Continue)
    }

    async fn shutdown(&mut self) -> Result<Flow> {
        tracing::info!(conn_id = %self.conn, peer = %self.peer, "Shutdown requested");
        let ack = Operation::Shutdown.to_u32().to_be_bytes();
        if let Err(e) = self.writer.write_all(&ack).await {
            tracing::debug!(conn_id = %self.conn, error = %e, "Could not acknowledge shutdown");
        }
        self.ctx.shutdown();
        Ok(Flow::Close)
    }
}

/// Resolves once the peer has hung up or sent more bytes; true on hang-up.
async fn peer_closed(reader: &mut BufReader<OwnedReadHalf>) -> bool {
    match reader.fill_buf().await {
        Ok(buf) => buf.is_empty(),
        Err(_) => true,
    }
}
