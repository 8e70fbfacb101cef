//! Binary wire protocol shared by the scheduler, submitters and workers.
//!
//! Every request starts with an 8-byte [`Header`] (version, operation) and is
//! followed by an operation-specific body. All integers are big-endian and
//! repeated records are preceded by their count; messages carry no overall
//! length prefix, so bodies are decoded field by field straight off the stream.
//!
//! # Components
//!
//! - [`Operation`] / [`Header`]: request framing
//! - [`message`]: request and response bodies
//! - [`float`]: host-independent packing of the status mean

pub mod float;
pub mod message;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

pub use message::{
    OperationStep, Operator, ResultsRequest, ResultsResponse, StatusRequest, StatusResponse,
    SubmitJobPayload, WorkAnswer, WorkDispatch,
};

/// The only protocol version this scheduler speaks.
pub const PROTOCOL_VERSION: u32 = 1;

/// Size of the request header on the wire.
pub const HEADER_LEN: usize = 8;

/// Errors raised while decoding a message. Any of them ends the connection.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u32),

    #[error("unknown operation code {0}")]
    UnknownOperation(u32),

    #[error("unknown operator code {0}")]
    UnknownOperator(u32),

    #[error("unknown results status {0}")]
    UnknownStatus(u32),

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// True when the peer simply went away, as opposed to sending garbage.
    pub fn is_disconnect(&self) -> bool {
        match self {
            ProtocolError::ConnectionClosed => true,
            ProtocolError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

/// Operation codes carried in the request header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    SubmitJob,
    QueryStatus,
    QueryResults,
    QueryWork,
    SubmitWork,
    Shutdown,
}

impl Operation {
    pub const fn to_u32(self) -> u32 {
        match self {
            Operation::SubmitJob => 0,
            Operation::QueryStatus => 1,
            Operation::QueryResults => 2,
            Operation::QueryWork => 3,
            Operation::SubmitWork => 4,
            Operation::Shutdown => 5,
        }
    }

    pub const fn from_u32(code: u32) -> Option<Self> {
        match code {
            0 => Some(Operation::SubmitJob),
            1 => Some(Operation::QueryStatus),
            2 => Some(Operation::QueryResults),
            3 => Some(Operation::QueryWork),
            4 => Some(Operation::SubmitWork),
            5 => Some(Operation::Shutdown),
            _ => None,
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::SubmitJob => write!(f, "SUBMIT_JOB"),
            Operation::QueryStatus => write!(f, "QUERY_STATUS"),
            Operation::QueryResults => write!(f, "QUERY_RESULTS"),
            Operation::QueryWork => write!(f, "QUERY_WORK"),
            Operation::SubmitWork => write!(f, "SUBMIT_WORK"),
            Operation::Shutdown => write!(f, "SHUTDOWN"),
        }
    }
}

/// Request header: `{version: u32, operation: u32}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u32,
    pub operation: Operation,
}

impl Header {
    pub fn new(operation: Operation) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            operation,
        }
    }

    pub fn to_bytes(self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[..4].copy_from_slice(&self.version.to_be_bytes());
        buf[4..].copy_from_slice(&self.operation.to_u32().to_be_bytes());
        buf
    }

    /// Read a header, rejecting foreign versions and unknown operations.
    ///
    /// A clean end-of-stream before the first byte is reported as
    /// [`ProtocolError::ConnectionClosed`].
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self, ProtocolError> {
        let mut buf = [0u8; HEADER_LEN];
        let first = reader.read(&mut buf[..1]).await?;
        if first == 0 {
            return Err(ProtocolError::ConnectionClosed);
        }
        reader.read_exact(&mut buf[1..]).await?;

        let version = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }

        let code = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let operation = Operation::from_u32(code).ok_or(ProtocolError::UnknownOperation(code))?;

        Ok(Self { version, operation })
    }
}

/// Records read ahead of arrival are capped so a bogus count cannot force a
/// huge allocation before the data shows up.
const MAX_PREALLOCATED_RECORDS: usize = 4096;

pub(crate) fn record_buffer<T>(count: u32) -> Vec<T> {
    Vec::with_capacity((count as usize).min(MAX_PREALLOCATED_RECORDS))
}
