//! facegate-core - staged face enrollment and verification protocol.
//!
//! Drives an external embedding service through a fixed pose sequence,
//! averages the accepted embeddings into a per-identity template, and
//! verifies fresh captures against it by cosine similarity, optionally
//! behind a left/right head-turn liveness challenge.

pub mod capture;
pub mod config;
pub mod enrollment;
pub mod error;
pub mod session;
pub mod store;
pub mod traits;
pub mod types;
pub mod verification;

pub use capture::{CaptureSession, FrameVerdict, PoseAcceptance, SessionState, StepOutcome};
pub use config::ProtocolConfig;
pub use enrollment::{average_poses, Enroller, EnrollmentTemplate};
pub use error::{CaptureError, ConfigError, ErrorKind, OracleError, ProtocolError, StoreError};
pub use session::{CancelToken, EnrollmentLease, NoopObserver, SessionContext, SessionObserver, SessionRegistry};
pub use store::MemoryTemplateStore;
pub use traits::{EmbeddingOracle, FrameSource, TemplateStore};
pub use types::{Embedding, Frame, FrameResult, Pose};
pub use verification::{
    AttemptOutcome, AttemptTracker, Decision, RetryReason, TurnDirection, VerificationMode, Verifier,
};
