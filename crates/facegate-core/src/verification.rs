//! Verification against a stored template, with an optional head-turn
//! liveness challenge, and the per-action retry policy.

use crate::capture::FrameVerdict;
use crate::config::ProtocolConfig;
use crate::error::ProtocolError;
use crate::session::SessionContext;
use crate::traits::{EmbeddingOracle, FrameSource, TemplateStore};
use crate::types::{Embedding, FrameResult};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationMode {
    /// One frame, compared directly.
    #[default]
    Simple,
    /// LEFT then RIGHT head turn; the RIGHT frame is compared.
    Challenged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnDirection {
    Left,
    Right,
}

impl fmt::Display for TurnDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TurnDirection::Left => "left",
            TurnDirection::Right => "right",
        })
    }
}

/// Why a single attempt did not match. All of these leave the action open
/// for another attempt (subject to [`AttemptTracker`]).
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum RetryReason {
    NoFaceDetected,
    QualityTooLow { quality: f32 },
    TurnFurther { direction: TurnDirection, offset: f32 },
    DoesNotMatch,
}

impl fmt::Display for RetryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryReason::NoFaceDetected => f.write_str("no face detected"),
            RetryReason::QualityTooLow { .. } => f.write_str("quality too low"),
            RetryReason::TurnFurther { direction, .. } => write!(f, "turn further {direction}"),
            RetryReason::DoesNotMatch => f.write_str("does not match"),
        }
    }
}

/// Result of one verification attempt.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Matched { similarity: f32 },
    Rejected {
        reason: RetryReason,
        /// Present when the attempt got as far as the comparison.
        similarity: Option<f32>,
    },
}

impl AttemptOutcome {
    pub fn is_match(&self) -> bool {
        matches!(self, AttemptOutcome::Matched { .. })
    }
}

/// Runs single verification attempts.
pub struct Verifier<'a> {
    config: &'a ProtocolConfig,
}

impl<'a> Verifier<'a> {
    pub fn new(config: &'a ProtocolConfig) -> Self {
        Self { config }
    }

    /// One attempt for `identity`.
    ///
    /// Fails fast with [`ProtocolError::NotEnrolled`] before touching the
    /// camera when no template is stored. Nothing is persisted.
    pub fn attempt<F, O, T>(
        &self,
        identity: &str,
        mode: VerificationMode,
        ctx: &mut SessionContext<'_, F, O>,
        store: &T,
    ) -> Result<AttemptOutcome, ProtocolError>
    where
        F: FrameSource,
        O: EmbeddingOracle,
        T: TemplateStore + ?Sized,
    {
        if identity.is_empty() {
            return Err(ProtocolError::MissingIdentity);
        }
        let template = store
            .fetch(identity)?
            .ok_or_else(|| ProtocolError::NotEnrolled(identity.to_string()))?;
        if template.dim() != self.config.embedding_dim {
            return Err(ProtocolError::DimensionMismatch {
                expected: self.config.embedding_dim,
                actual: template.dim(),
            });
        }

        let outcome = match mode {
            VerificationMode::Simple => self.simple(&template, ctx)?,
            VerificationMode::Challenged => self.challenged(&template, ctx)?,
        };

        match &outcome {
            AttemptOutcome::Matched { similarity } => {
                tracing::info!(identity, ?mode, similarity, "verification matched")
            }
            AttemptOutcome::Rejected { reason, similarity } => {
                tracing::info!(identity, ?mode, %reason, ?similarity, "verification rejected")
            }
        }
        Ok(outcome)
    }

    fn simple<F, O>(
        &self,
        template: &Embedding,
        ctx: &mut SessionContext<'_, F, O>,
    ) -> Result<AttemptOutcome, ProtocolError>
    where
        F: FrameSource,
        O: EmbeddingOracle,
    {
        let frame = ctx.classify_next(self.config, false)?;
        if let Some(reason) = self.gate(&frame) {
            return Ok(rejected(reason));
        }
        self.compare(template, &frame.embedding)
    }

    fn challenged<F, O>(
        &self,
        template: &Embedding,
        ctx: &mut SessionContext<'_, F, O>,
    ) -> Result<AttemptOutcome, ProtocolError>
    where
        F: FrameSource,
        O: EmbeddingOracle,
    {
        ctx.observer.challenge_issued(TurnDirection::Left);
        let left = ctx.classify_next(self.config, true)?;
        if let Some(reason) = self.gate(&left) {
            return Ok(rejected(reason));
        }
        if let Some(reason) = self.turn(&left, TurnDirection::Left)? {
            return Ok(rejected(reason));
        }

        ctx.throttle(self.config)?;

        ctx.observer.challenge_issued(TurnDirection::Right);
        let right = ctx.classify_next(self.config, true)?;
        if let Some(reason) = self.gate(&right) {
            return Ok(rejected(reason));
        }
        if let Some(reason) = self.turn(&right, TurnDirection::Right)? {
            return Ok(rejected(reason));
        }

        self.compare(template, &right.embedding)
    }

    fn gate(&self, frame: &FrameResult) -> Option<RetryReason> {
        match FrameVerdict::gate(frame, self.config.verification_quality_min) {
            FrameVerdict::NoFace => Some(RetryReason::NoFaceDetected),
            FrameVerdict::LowQuality { quality } => Some(RetryReason::QualityTooLow { quality }),
            FrameVerdict::Good { .. } => None,
        }
    }

    /// `Some(TurnFurther)` unless the head turned past the threshold in `direction`.
    fn turn(&self, frame: &FrameResult, direction: TurnDirection) -> Result<Option<RetryReason>, ProtocolError> {
        let raw = frame.horizontal_offset.ok_or(ProtocolError::LivenessUnavailable)?;
        let offset = if self.config.liveness_mirrored { -raw } else { raw };
        let threshold = self.config.liveness_dx_threshold;

        let passed = match direction {
            TurnDirection::Left => offset < -threshold,
            TurnDirection::Right => offset > threshold,
        };
        tracing::debug!(%direction, offset, threshold, passed, "liveness turn");

        Ok((!passed).then_some(RetryReason::TurnFurther { direction, offset }))
    }

    fn compare(&self, template: &Embedding, fresh: &Embedding) -> Result<AttemptOutcome, ProtocolError> {
        if fresh.dim() != template.dim() {
            return Err(ProtocolError::DimensionMismatch {
                expected: template.dim(),
                actual: fresh.dim(),
            });
        }
        Ok(self.decide(template.similarity(fresh)))
    }

    /// Threshold decision. The boundary value itself is a match.
    pub fn decide(&self, similarity: f32) -> AttemptOutcome {
        if similarity >= self.config.similarity_min {
            AttemptOutcome::Matched { similarity }
        } else {
            AttemptOutcome::Rejected {
                reason: RetryReason::DoesNotMatch,
                similarity: Some(similarity),
            }
        }
    }
}

fn rejected(reason: RetryReason) -> AttemptOutcome {
    AttemptOutcome::Rejected {
        reason,
        similarity: None,
    }
}

/// Final word on one attempt within a clock-in action.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Matched {
        attempt: u32,
        similarity: f32,
    },
    Retry {
        attempt: u32,
        remaining: u32,
        reason: RetryReason,
        similarity: Option<f32>,
    },
    MaxAttemptsReached {
        attempts: u32,
        reason: RetryReason,
        similarity: Option<f32>,
    },
}

/// Consecutive-failure counter for one clock-in action.
///
/// The `max_attempts`-th consecutive failure is terminal; the tracker then
/// refuses further attempts. A match resets it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptTracker {
    max_attempts: u32,
    failures: u32,
}

impl AttemptTracker {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            failures: 0,
        }
    }

    /// Number the next attempt would carry (1-based).
    pub fn next_attempt(&self) -> u32 {
        self.failures + 1
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn is_exhausted(&self) -> bool {
        self.failures >= self.max_attempts
    }

    /// Refuse to start another attempt once the action is exhausted.
    pub fn ensure_open(&self) -> Result<(), ProtocolError> {
        if self.is_exhausted() {
            Err(ProtocolError::MaxAttemptsReached {
                attempts: self.failures,
            })
        } else {
            Ok(())
        }
    }

    pub fn record(&mut self, outcome: AttemptOutcome) -> Decision {
        let attempt = self.next_attempt();
        match outcome {
            AttemptOutcome::Matched { similarity } => {
                self.failures = 0;
                Decision::Matched {
                    attempt,
                    similarity,
                }
            }
            AttemptOutcome::Rejected { reason, similarity } => {
                self.failures += 1;
                if self.is_exhausted() {
                    Decision::MaxAttemptsReached {
                        attempts: self.failures,
                        reason,
                        similarity,
                    }
                } else {
                    Decision::Retry {
                        attempt,
                        remaining: self.max_attempts - self.failures,
                        reason,
                        similarity,
                    }
                }
            }
        }
    }
}
