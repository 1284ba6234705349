use crate::types::Pose;
use std::time::Duration;
use thiserror::Error;

/// Failure talking to the embedding service.
///
/// A frame in which the service finds no face is NOT an error; it comes back
/// as an undetected [`FrameResult`](crate::FrameResult).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OracleError {
    #[error("embedding service unavailable: {0}")]
    Unavailable(String),
    #[error("embedding service rejected request (HTTP {status}): {details}")]
    Rejected { status: u16, details: String },
    #[error("malformed embedding service response: {0}")]
    Malformed(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CaptureError {
    #[error("capture cancelled")]
    Cancelled,
    #[error("no frame arrived within {0:?}")]
    Timeout(Duration),
    /// The source shut down and will produce no more frames.
    #[error("frame source exhausted")]
    Exhausted,
    #[error("frame source unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("template store: {0}")]
    Backend(String),
    #[error("stored template for '{identity}' is corrupt: {reason}")]
    Corrupt { identity: String, reason: String },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("{field} must be within [{min}, {max}], got {value}")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("{0} must be at least 1")]
    Zero(&'static str),
    #[error("config parse error: {0}")]
    Parse(String),
}

/// Session-terminal conditions surfaced by the enrollment and verification protocols.
///
/// Per-frame gating failures never show up here: the capture loop absorbs
/// them, and verification reports them as a retryable
/// [`AttemptOutcome`](crate::AttemptOutcome).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("session cancelled")]
    Cancelled,
    #[error("no authenticated identity")]
    MissingIdentity,
    #[error("identity '{0}' has no enrolled template")]
    NotEnrolled(String),
    #[error("enrollment already in progress for '{0}'")]
    EnrollmentInProgress(String),
    #[error("maximum attempts reached ({attempts})")]
    MaxAttemptsReached { attempts: u32 },
    #[error("pose {pose} not accepted after {frames} frames")]
    PoseAttemptsExhausted { pose: Pose, frames: u32 },
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("embedding service reports no horizontal offset; liveness challenge unavailable")]
    LivenessUnavailable,
    #[error("pose {0} accepted without an embedding")]
    MissingPoseEmbedding(Pose),
    #[error("capture session already complete")]
    SessionComplete,
    #[error(transparent)]
    Oracle(#[from] OracleError),
    #[error(transparent)]
    Capture(CaptureError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<CaptureError> for ProtocolError {
    fn from(err: CaptureError) -> Self {
        match err {
            CaptureError::Cancelled => ProtocolError::Cancelled,
            other => ProtocolError::Capture(other),
        }
    }
}

/// Coarse classification used by hosts to route recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Cancelled,
    Precondition,
    Terminal,
    Infrastructure,
    Internal,
}

impl ProtocolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProtocolError::Cancelled => ErrorKind::Cancelled,
            ProtocolError::MissingIdentity
            | ProtocolError::NotEnrolled(_)
            | ProtocolError::EnrollmentInProgress(_) => ErrorKind::Precondition,
            ProtocolError::MaxAttemptsReached { .. }
            | ProtocolError::PoseAttemptsExhausted { .. } => ErrorKind::Terminal,
            ProtocolError::Oracle(_)
            | ProtocolError::Capture(_)
            | ProtocolError::Store(_)
            | ProtocolError::LivenessUnavailable => ErrorKind::Infrastructure,
            ProtocolError::DimensionMismatch { .. }
            | ProtocolError::MissingPoseEmbedding(_)
            | ProtocolError::SessionComplete
            | ProtocolError::Config(_) => ErrorKind::Internal,
        }
    }
}
