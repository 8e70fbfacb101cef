//! Request and response bodies.
//!
//! Each message exposes `to_bytes` for the sending side and an async
//! `read_from` for the receiving side. Bodies never include the request
//! header; callers write [`Header`](super::Header) first.

use tokio::io::{AsyncRead, AsyncReadExt};

use super::float;
use super::{record_buffer, ProtocolError};

/// Arithmetic and bitwise operators a job can chain together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Operator {
    Add,
    SubRight,
    SubLeft,
    And,
    Or,
    Xor,
    Not,
    RotateRight,
    RotateLeft,
}

impl Operator {
    pub const fn to_u32(self) -> u32 {
        match self {
            Operator::Add => 0,
            Operator::SubRight => 1,
            Operator::SubLeft => 2,
            Operator::And => 3,
            Operator::Or => 4,
            Operator::Xor => 5,
            Operator::Not => 6,
            Operator::RotateRight => 7,
            Operator::RotateLeft => 8,
        }
    }

    pub const fn from_u32(code: u32) -> Option<Self> {
        match code {
            0 => Some(Operator::Add),
            1 => Some(Operator::SubRight),
            2 => Some(Operator::SubLeft),
            3 => Some(Operator::And),
            4 => Some(Operator::Or),
            5 => Some(Operator::Xor),
            6 => Some(Operator::Not),
            7 => Some(Operator::RotateRight),
            8 => Some(Operator::RotateLeft),
            _ => None,
        }
    }
}

impl std::fmt::Display for Operator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let symbol = match self {
            Operator::Add => "+",
            Operator::SubRight => "-",
            Operator::SubLeft => "-<",
            Operator::And => "&",
            Operator::Or => "|",
            Operator::Xor => "^",
            Operator::Not => "~",
            Operator::RotateRight => ">>>",
            Operator::RotateLeft => "<<<",
        };
        f.write_str(symbol)
    }
}

/// One `{operation, operand}` pair of an operation chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct OperationStep {
    pub operator: Operator,
    pub operand: u32,
}

impl OperationStep {
    pub fn new(operator: Operator, operand: u32) -> Self {
        Self { operator, operand }
    }

    fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.operator.to_u32().to_be_bytes());
        buf.extend_from_slice(&self.operand.to_be_bytes());
    }

    async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self, ProtocolError> {
        let code = reader.read_u32().await?;
        let operand = reader.read_u32().await?;
        let operator = Operator::from_u32(code).ok_or(ProtocolError::UnknownOperator(code))?;
        Ok(Self { operator, operand })
    }
}

fn write_chain(buf: &mut Vec<u8>, chain: &[OperationStep]) {
    buf.extend_from_slice(&(chain.len() as u32).to_be_bytes());
    for step in chain {
        step.write_to(buf);
    }
}

async fn read_chain<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Vec<OperationStep>, ProtocolError> {
    let count = reader.read_u32().await?;
    let mut chain = record_buffer(count);
    for _ in 0..count {
        chain.push(OperationStep::read_from(reader).await?);
    }
    Ok(chain)
}

/// Body of a SUBMIT_JOB request.
///
/// Counts are decoded as sent; zero counts and iteration values other than one
/// are rejected later, when the job is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitJobPayload {
    pub operations: Vec<OperationStep>,
    pub iterations: u32,
    pub items: Vec<u32>,
}

impl SubmitJobPayload {
    pub fn new(operations: Vec<OperationStep>, items: Vec<u32>) -> Self {
        Self {
            operations,
            iterations: 1,
            items,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(12 + self.operations.len() * 8 + self.items.len() * 4);
        write_chain(&mut buf, &self.operations);
        buf.extend_from_slice(&self.iterations.to_be_bytes());
        buf.extend_from_slice(&(self.items.len() as u32).to_be_bytes());
        for item in &self.items {
            buf.extend_from_slice(&item.to_be_bytes());
        }
        buf
    }

    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self, ProtocolError> {
        let operations = read_chain(reader).await?;
        let iterations = reader.read_u32().await?;
        let num_items = reader.read_u32().await?;
        let mut items = record_buffer(num_items);
        for _ in 0..num_items {
            items.push(reader.read_u32().await?);
        }
        Ok(Self {
            operations,
            iterations,
            items,
        })
    }
}

/// Task sent to a worker in reply to QUERY_WORK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkDispatch {
    pub item: u32,
    pub operations: Vec<OperationStep>,
    pub iterations: u32,
}

impl WorkDispatch {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(12 + self.operations.len() * 8);
        buf.extend_from_slice(&self.item.to_be_bytes());
        write_chain(&mut buf, &self.operations);
        buf.extend_from_slice(&self.iterations.to_be_bytes());
        buf
    }

    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self, ProtocolError> {
        let item = reader.read_u32().await?;
        let operations = read_chain(reader).await?;
        let iterations = reader.read_u32().await?;
        Ok(Self {
            item,
            operations,
            iterations,
        })
    }
}

/// Body of a SUBMIT_WORK request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkAnswer {
    pub answer: i32,
}

impl WorkAnswer {
    pub fn to_bytes(self) -> [u8; 4] {
        self.answer.to_be_bytes()
    }

    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self, ProtocolError> {
        Ok(Self {
            answer: reader.read_i32().await?,
        })
    }
}

/// Body of a QUERY_STATUS request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusRequest {
    pub job_id: u32,
    /// Staleness window after which an unfinished item is handed out again.
    pub timeout_ms: u32,
}

impl StatusRequest {
    pub fn to_bytes(self) -> [u8; 8] {
        let mut buf = [0u8; 8];
        buf[..4].copy_from_slice(&self.job_id.to_be_bytes());
        buf[4..].copy_from_slice(&self.timeout_ms.to_be_bytes());
        buf
    }

    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self, ProtocolError> {
        let job_id = reader.read_u32().await?;
        let timeout_ms = reader.read_u32().await?;
        Ok(Self { job_id, timeout_ms })
    }
}

/// Reply to QUERY_STATUS.
///
/// An unknown job is reported as all zeroes: real jobs always have at least
/// one item, so `total == 0` unambiguously means "no such job".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusResponse {
    pub completed: u32,
    pub total: u32,
    pub packed_mean: u64,
}

impl StatusResponse {
    pub const WIRE_LEN: usize = 16;

    pub fn new(completed: u32, total: u32, mean: f64) -> Self {
        Self {
            completed,
            total,
            packed_mean: float::pack_mean(mean),
        }
    }

    pub fn no_job() -> Self {
        Self {
            completed: 0,
            total: 0,
            packed_mean: 0,
        }
    }

    pub fn is_no_job(&self) -> bool {
        self.total == 0
    }

    pub fn mean(&self) -> f64 {
        float::unpack_mean(self.packed_mean)
    }

    pub fn to_bytes(self) -> [u8; Self::WIRE_LEN] {
        let mut buf = [0u8; Self::WIRE_LEN];
        buf[..4].copy_from_slice(&self.completed.to_be_bytes());
        buf[4..8].copy_from_slice(&self.total.to_be_bytes());
        buf[8..].copy_from_slice(&self.packed_mean.to_be_bytes());
        buf
    }

    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self, ProtocolError> {
        let completed = reader.read_u32().await?;
        let total = reader.read_u32().await?;
        let packed_mean = reader.read_u64().await?;
        Ok(Self {
            completed,
            total,
            packed_mean,
        })
    }
}

/// Body of a QUERY_RESULTS request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultsRequest {
    pub job_id: u32,
}

impl ResultsRequest {
    pub fn to_bytes(self) -> [u8; 4] {
        self.job_id.to_be_bytes()
    }

    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self, ProtocolError> {
        Ok(Self {
            job_id: reader.read_u32().await?,
        })
    }
}

/// Reply to QUERY_RESULTS, prefixed on the wire by a status code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultsResponse {
    /// Every item is done; `(item, answer)` pairs in submission order.
    Success(Vec<(u32, i32)>),
    NoJob,
    NotComplete,
}

impl ResultsResponse {
    pub const SUCCESS: u32 = 0;
    pub const NO_JOB: u32 = 1;
    pub const NOT_COMPLETE: u32 = 2;

    pub fn status_code(&self) -> u32 {
        match self {
            ResultsResponse::Success(_) => Self::SUCCESS,
            ResultsResponse::NoJob => Self::NO_JOB,
            ResultsResponse::NotComplete => Self::NOT_COMPLETE,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.status_code().to_be_bytes());
        if let ResultsResponse::Success(results) = self {
            buf.reserve(4 + results.len() * 8);
            buf.extend_from_slice(&(results.len() as u32).to_be_bytes());
            for (item, answer) in results {
                buf.extend_from_slice(&item.to_be_bytes());
                buf.extend_from_slice(&answer.to_be_bytes());
            }
        }
        buf
    }

    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self, ProtocolError> {
        match reader.read_u32().await? {
            Self::SUCCESS => {
                let count = reader.read_u32().await?;
                let mut results = record_buffer(count);
                for _ in 0..count {
                    let item = reader.read_u32().await?;
                    let answer = reader.read_i32().await?;
                    results.push((item, answer));
                }
                Ok(ResultsResponse::Success(results))
            }
            Self::NO_JOB => Ok(ResultsResponse::NoJob),
            Self::NOT_COMPLETE => Ok(ResultsResponse::NotComplete),
            other => Err(ProtocolError::UnknownStatus(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_job_layout() {
        let payload =
            SubmitJobPayload::new(vec![OperationStep::new(Operator::Add, 3)], vec![5, 10]);
        assert_eq!(
            payload.to_bytes(),
            vec![
                0, 0, 0, 1, // numOperations
                0, 0, 0, 0, 0, 0, 0, 3, // Add 3
                0, 0, 0, 1, // iterations
                0, 0, 0, 2, // numItems
                0, 0, 0, 5, 0, 0, 0, 10,
            ]
        );
    }

    #[tokio::test]
    async fn submit_job_decodes_from_stream() {
        let payload = SubmitJobPayload::new(
            vec![
                OperationStep::new(Operator::Xor, 0xFF),
                OperationStep::new(Operator::RotateLeft, 4),
            ],
            vec![1, 2, 3],
        );
        let bytes = payload.to_bytes();
        let decoded = SubmitJobPayload::read_from(&mut &bytes[..]).await.unwrap();
        assert_eq!(decoded, payload);
    }

    #[tokio::test]
    async fn submit_job_keeps_zero_counts_for_validation() {
        let bytes = [0u8, 0, 0, 0, 0, 0, 0, 2, 0, 0, 0, 0];
        let decoded = SubmitJobPayload::read_from(&mut &bytes[..]).await.unwrap();
        assert!(decoded.operations.is_empty());
        assert_eq!(decoded.iterations, 2);
        assert!(decoded.items.is_empty());
    }

    #[tokio::test]
    async fn truncated_submit_job_fails() {
        let payload = SubmitJobPayload::new(vec![OperationStep::new(Operator::Add, 1)], vec![1, 2]);
        let bytes = payload.to_bytes();
        let err = SubmitJobPayload::read_from(&mut &bytes[..bytes.len() - 2])
            .await
            .unwrap_err();
        assert!(err.is_disconnect());
    }

    #[tokio::test]
    async fn unknown_operator_is_rejected() {
        let bytes = [0u8, 0, 0, 1, 0, 0, 0, 42, 0, 0, 0, 1];
        let err = SubmitJobPayload::read_from(&mut &bytes[..]).await.unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownOperator(42)));
    }

    #[test]
    fn work_dispatch_layout() {
        let dispatch = WorkDispatch {
            item: 5,
            operations: vec![OperationStep::new(Operator::Add, 3)],
            iterations: 1,
        };
        assert_eq!(
            dispatch.to_bytes(),
            vec![0, 0, 0, 5, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 3, 0, 0, 0, 1]
        );
    }

    #[test]
    fn negative_answer_is_twos_complement() {
        assert_eq!(WorkAnswer { answer: -2 }.to_bytes(), [0xFF, 0xFF, 0xFF, 0xFE]);
    }

    #[test]
    fn status_response_layout() {
        let response = StatusResponse::new(1, 2, 8.0);
        let bytes = response.to_bytes();
        assert_eq!(&bytes[..8], &[0, 0, 0, 1, 0, 0, 0, 2]);
        assert_eq!(&bytes[8..], &8.0f64.to_bits().to_be_bytes());
        assert_eq!(response.mean(), 8.0);
    }

    #[test]
    fn no_job_status_is_all_zero() {
        let response = StatusResponse::no_job();
        assert!(response.is_no_job());
        assert_eq!(response.to_bytes(), [0u8; StatusResponse::WIRE_LEN]);
    }

    #[test]
    fn results_layouts() {
        assert_eq!(ResultsResponse::NoJob.to_bytes(), vec![0, 0, 0, 1]);
        assert_eq!(ResultsResponse::NotComplete.to_bytes(), vec![0, 0, 0, 2]);
        assert_eq!(
            ResultsResponse::Success(vec![(5, 8), (10, -1)]).to_bytes(),
            vec![
                0, 0, 0, 0, 0, 0, 0, 2, 0, 0, 0, 5, 0, 0, 0, 8, 0, 0, 0, 10, 0xFF, 0xFF, 0xFF,
                0xFF
            ]
        );
    }

    #[tokio::test]
    async fn results_reject_unknown_status() {
        let bytes = [0u8, 0, 0, 7];
        let err = ResultsResponse::read_from(&mut &bytes[..]).await.unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownStatus(7)));
    }
}
