//! Submitter and worker side of the wire protocol.

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};

use crate::error::Result;
use crate::protocol::{
    Header, Operation, ProtocolError, ResultsRequest, ResultsResponse, StatusRequest,
    StatusResponse, SubmitJobPayload, WorkAnswer, WorkDispatch,
};

/// One connection to a scheduler.
///
/// A worker keeps the same client for its whole session: answers are matched
/// to work items by connection, so a SUBMIT_WORK must travel on the
/// connection that issued the QUERY_WORK.
pub struct SchedulerClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl SchedulerClient {
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        })
    }

    async fn send(&mut self, operation: Operation, body: &[u8]) -> Result<()> {
        let mut frame = Vec::with_capacity(crate::protocol::HEADER_LEN + body.len());
        frame.extend_from_slice(&Header::new(operation).to_bytes());
        frame.extend_from_slice(body);
        self.writer.write_all(&frame).await?;
        Ok(())
    }

    /// Submit a job and return its id.
    ///
    /// The scheduler closes the connection instead of replying when the job
    /// is rejected, which surfaces here as a protocol error.
    pub async fn submit_job(&mut self, payload: &SubmitJobPayload) -> Result<u32> {
        self.send(Operation::SubmitJob, &payload.to_bytes()).await?;
        let id = self.reader.read_u32().await.map_err(ProtocolError::from)?;
        Ok(id)
    }

    pub async fn query_status(&mut self, job_id: u32, timeout_ms: u32) -> Result<StatusResponse> {
        let request = StatusRequest { job_id, timeout_ms };
        self.send(Operation::QueryStatus, &request.to_bytes()).await?;
        Ok(StatusResponse::read_from(&mut self.reader).await?)
    }

    pub async fn query_results(&mut self, job_id: u32) -> Result<ResultsResponse> {
        self.send(Operation::QueryResults, &ResultsRequest { job_id }.to_bytes())
            .await?;
        Ok(ResultsResponse::read_from(&mut self.reader).await?)
    }

    /// Block until the scheduler hands out a work item.
    ///
    /// Returns `None` when the scheduler closes the connection instead, which
    /// it does while shutting down.
    pub async fn query_work(&mut self) -> Result<Option<WorkDispatch>> {
        self.send(Operation::QueryWork, &[]).await?;
        match WorkDispatch::read_from(&mut self.reader).await {
            Ok(dispatch) => Ok(Some(dispatch)),
            Err(e) if e.is_disconnect() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn submit_work(&mut self, answer: i32) -> Result<()> {
        self.send(Operation::SubmitWork, &WorkAnswer { answer }.to_bytes())
            .await
    }

    /// Ask the scheduler to stop. Returns true once the acknowledgement
    /// arrives.
    pub async fn shutdown(&mut self) -> Result<bool> {
        self.send(Operation::Shutdown, &[]).await?;
        let ack = self.reader.read_u32().await.map_err(ProtocolError::from)?;
        Ok(ack == Operation::Shutdown.to_u32())
    }
}
