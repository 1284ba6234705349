//! Staged pose capture: per-pose quality/streak gating.
//!
//! Each pose stays active until `good_streak` consecutive frames are detected
//! with quality at or above `enrollment_quality_min`. Any bad frame resets the
//! streak to zero. The embedding of the most recent good frame is kept.

use crate::config::ProtocolConfig;
use crate::error::ProtocolError;
use crate::session::SessionContext;
use crate::traits::{EmbeddingOracle, FrameSource};
use crate::types::{Embedding, FrameResult, Pose};
use serde::Serialize;

/// Gate result for a single frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum FrameVerdict {
    NoFace,
    LowQuality { quality: f32 },
    Good { quality: f32 },
}

impl FrameVerdict {
    /// Apply the detection and quality gate.
    pub fn gate(frame: &FrameResult, quality_min: f32) -> Self {
        if !frame.detected || frame.embedding.is_empty() {
            FrameVerdict::NoFace
        } else if frame.quality < quality_min || frame.quality.is_nan() {
            FrameVerdict::LowQuality {
                quality: frame.quality,
            }
        } else {
            FrameVerdict::Good {
                quality: frame.quality,
            }
        }
    }

    pub fn is_good(&self) -> bool {
        matches!(self, FrameVerdict::Good { .. })
    }
}

/// Mutable acceptance state of the active pose.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoseAcceptance {
    pub consecutive_good_frames: u32,
    /// Only ever overwritten by a frame that passed the gate.
    pub last_accepted_embedding: Option<Embedding>,
    pub frames_seen: u32,
}

impl PoseAcceptance {
    pub fn new() -> Self {
        Self::default()
    }

    /// Gate one frame and update the streak.
    pub fn observe(&mut self, frame: FrameResult, quality_min: f32) -> FrameVerdict {
        self.frames_seen += 1;
        let verdict = FrameVerdict::gate(&frame, quality_min);
        if verdict.is_good() {
            self.consecutive_good_frames += 1;
            self.last_accepted_embedding = Some(frame.embedding);
        } else {
            self.consecutive_good_frames = 0;
        }
        verdict
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "pose", rename_all = "snake_case")]
pub enum SessionState {
    Active(Pose),
    AllAccepted,
    Abandoned,
}

/// What one gating step did.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub pose: Pose,
    pub verdict: FrameVerdict,
    pub streak: u32,
    /// The pose reached its streak target on this frame.
    pub accepted: bool,
}

/// Drives the fixed pose sequence to completion.
#[derive(Debug, Clone)]
pub struct CaptureSession {
    quality_min: f32,
    good_streak: u32,
    embedding_dim: usize,
    max_frames_per_pose: Option<u32>,
    state: SessionState,
    current: PoseAcceptance,
    accepted: Vec<(Pose, Embedding)>,
}

impl CaptureSession {
    pub fn new(config: &ProtocolConfig) -> Self {
        Self {
            quality_min: config.enrollment_quality_min,
            good_streak: config.good_streak.max(1),
            embedding_dim: config.embedding_dim,
            max_frames_per_pose: config.max_frames_per_pose,
            state: SessionState::Active(Pose::SEQUENCE[0]),
            current: PoseAcceptance::new(),
            accepted: Vec::with_capacity(Pose::SEQUENCE.len()),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn active_pose(&self) -> Option<Pose> {
        match self.state {
            SessionState::Active(pose) => Some(pose),
            _ => None,
        }
    }

    /// Acceptance state of the active pose.
    pub fn current(&self) -> &PoseAcceptance {
        &self.current
    }

    /// Poses accepted so far, in capture order.
    pub fn accepted(&self) -> &[(Pose, Embedding)] {
        &self.accepted
    }

    /// Feed one classified frame to the active pose.
    pub fn step(&mut self, frame: FrameResult) -> Result<StepOutcome, ProtocolError> {
        let pose = match self.state {
            SessionState::Active(pose) => pose,
            SessionState::Abandoned => return Err(ProtocolError::Cancelled),
            SessionState::AllAccepted => return Err(ProtocolError::SessionComplete),
        };

        if frame.detected && !frame.embedding.is_empty() && frame.embedding.dim() != self.embedding_dim {
            return Err(ProtocolError::DimensionMismatch {
                expected: self.embedding_dim,
                actual: frame.embedding.dim(),
            });
        }

        let verdict = self.current.observe(frame, self.quality_min);
        let streak = self.current.consecutive_good_frames;

        if streak >= self.good_streak {
            let embedding = self
                .current
                .last_accepted_embedding
                .take()
                .ok_or(ProtocolError::MissingPoseEmbedding(pose))?;
            tracing::info!(
                pose = %pose,
                frames = self.current.frames_seen,
                "pose accepted"
            );
            self.accepted.push((pose, embedding));
            self.current = PoseAcceptance::new();
            self.state = match pose.next() {
                Some(next) => SessionState::Active(next),
                None => SessionState::AllAccepted,
            };
            return Ok(StepOutcome {
                pose,
                verdict,
                streak,
                accepted: true,
            });
        }

        if let Some(cap) = self.max_frames_per_pose {
            if self.current.frames_seen >= cap {
                return Err(ProtocolError::PoseAttemptsExhausted {
                    pose,
                    frames: self.current.frames_seen,
                });
            }
        }

        Ok(StepOutcome {
            pose,
            verdict,
            streak,
            accepted: false,
        })
    }

    /// Terminate the session, discarding all partial state.
    pub fn abandon(&mut self) {
        self.state = SessionState::Abandoned;
        self.current = PoseAcceptance::new();
        self.accepted.clear();
    }

    /// Pull, classify and gate frames until every pose is accepted.
    ///
    /// Abandons the session on any error, including cancellation.
    pub fn run<F, O>(&mut self, ctx: &mut SessionContext<'_, F, O>, config: &ProtocolConfig) -> Result<(), ProtocolError>
    where
        F: FrameSource,
        O: EmbeddingOracle,
    {
        let result = self.drive(ctx, config);
        if result.is_err() {
            self.abandon();
        }
        result
    }

    fn drive<F, O>(&mut self, ctx: &mut SessionContext<'_, F, O>, config: &ProtocolConfig) -> Result<(), ProtocolError>
    where
        F: FrameSource,
        O: EmbeddingOracle,
    {
        let mut announced: Option<Pose> = None;

        while let Some(pose) = self.active_pose() {
            if announced != Some(pose) {
                tracing::info!(pose = %pose, instruction = pose.instruction(), "capturing pose");
                ctx.observer.pose_started(pose);
                announced = Some(pose);
            }

            let frame = ctx.classify_next(config, false)?;
            let outcome = self.step(frame)?;
            tracing::debug!(
                pose = %outcome.pose,
                verdict = ?outcome.verdict,
                streak = outcome.streak,
                "enrollment frame"
            );
            ctx.observer
                .frame_classified(outcome.pose, &outcome.verdict, outcome.streak);
            if outcome.accepted {
                ctx.observer.pose_accepted(outcome.pose);
            }

            if self.active_pose().is_some() {
                ctx.throttle(config)?;
            }
        }

        match self.state {
            SessionState::AllAccepted => Ok(()),
            _ => Err(ProtocolError::Cancelled),
        }
    }

    /// Accepted embeddings in pose order. Only valid after `AllAccepted`.
    pub fn into_embeddings(self) -> Result<Vec<(Pose, Embedding)>, ProtocolError> {
        if self.state != SessionState::AllAccepted {
            let pose = self.active_pose().unwrap_or(Pose::SEQUENCE[0]);
            return Err(ProtocolError::MissingPoseEmbedding(pose));
        }
        for pose in Pose::SEQUENCE {
            if !self.accepted.iter().any(|(p, _)| *p == pose) {
                return Err(ProtocolError::MissingPoseEmbedding(pose));
            }
        }
        Ok(self.accepted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(streak: u32, threshold: f32, dim: usize) -> ProtocolConfig {
        ProtocolConfig {
            good_streak: streak,
            enrollment_quality_min: threshold,
            embedding_dim: dim,
            throttle_ms: 0,
            ..Default::default()
        }
    }

    fn good(quality: f32, tag: f32) -> FrameResult {
        FrameResult::detected(quality, Embedding::new(vec![tag, 1.0]))
    }

    #[test]
    fn test_gate_classification() {
        assert_eq!(FrameVerdict::gate(&FrameResult::undetected(), 0.3), FrameVerdict::NoFace);
        assert_eq!(
            FrameVerdict::gate(&good(0.2, 0.0), 0.3),
            FrameVerdict::LowQuality { quality: 0.2 }
        );
        assert_eq!(FrameVerdict::gate(&good(0.3, 0.0), 0.3), FrameVerdict::Good { quality: 0.3 });
    }

    #[test]
    fn test_detected_without_embedding_is_no_face() {
        let frame = FrameResult::detected(0.9, Embedding::default());
        assert_eq!(FrameVerdict::gate(&frame, 0.3), FrameVerdict::NoFace);
    }

    #[test]
    fn test_failed_frame_keeps_previous_embedding() {
        let mut acc = PoseAcceptance::new();
        acc.observe(good(0.9, 7.0), 0.35);
        assert_eq!(acc.consecutive_good_frames, 1);

        acc.observe(good(0.1, 8.0), 0.35);
        assert_eq!(acc.consecutive_good_frames, 0);
        assert_eq!(acc.last_accepted_embedding.as_ref().unwrap().values[0], 7.0);

        acc.observe(FrameResult::undetected(), 0.35);
        assert_eq!(acc.consecutive_good_frames, 0);
        assert_eq!(acc.last_accepted_embedding.as_ref().unwrap().values[0], 7.0);
    }

    #[test]
    fn test_low_quality_never_sets_embedding_even_if_detected() {
        let mut acc = PoseAcceptance::new();
        for q in [0.0, 0.1, 0.2, 0.3449] {
            acc.observe(good(q, q), 0.345);
            assert_eq!(acc.consecutive_good_frames, 0);
            assert!(acc.last_accepted_embedding.is_none());
        }
    }

    #[test]
    fn test_last_good_frame_wins() {
        let mut session = CaptureSession::new(&config(3, 0.35, 2));
        session.step(good(0.5, 1.0)).unwrap();
        session.step(good(0.5, 2.0)).unwrap();
        let out = session.step(good(0.5, 3.0)).unwrap();
        assert!(out.accepted);
        assert_eq!(session.accepted()[0], (Pose::Front, Embedding::new(vec![3.0, 1.0])));
    }

    #[test]
    fn test_session_advances_through_fixed_sequence() {
        let mut session = CaptureSession::new(&config(1, 0.35, 2));
        let mut seen = Vec::new();
        while let Some(pose) = session.active_pose() {
            let out = session.step(good(0.9, seen.len() as f32)).unwrap();
            assert_eq!(out.pose, pose);
            assert!(out.accepted);
            seen.push(pose);
        }
        assert_eq!(seen, Pose::SEQUENCE.to_vec());
        assert_eq!(session.state(), SessionState::AllAccepted);
        assert_eq!(session.into_embeddings().unwrap().len(), 4);
    }

    #[test]
    fn test_counters_reset_between_poses() {
        let mut session = CaptureSession::new(&config(2, 0.35, 2));
        session.step(good(0.9, 1.0)).unwrap();
        session.step(good(0.9, 2.0)).unwrap();
        assert_eq!(session.active_pose(), Some(Pose::Left));
        assert_eq!(session.current(), &PoseAcceptance::new());
    }

    #[test]
    fn test_dimension_mismatch_is_error() {
        let mut session = CaptureSession::new(&config(3, 0.35, 128));
        let err = session.step(good(0.9, 1.0)).unwrap_err();
        assert_eq!(err, ProtocolError::DimensionMismatch { expected: 128, actual: 2 });
    }

    #[test]
    fn test_frame_cap_per_pose() {
        let cfg = ProtocolConfig {
            max_frames_per_pose: Some(2),
            ..config(3, 0.35, 2)
        };
        let mut session = CaptureSession::new(&cfg);
        session.step(FrameResult::undetected()).unwrap();
        let err = session.step(FrameResult::undetected()).unwrap_err();
        assert_eq!(err, ProtocolError::PoseAttemptsExhausted { pose: Pose::Front, frames: 2 });
    }

    #[test]
    fn test_abandon_discards_state() {
        let mut session = CaptureSession::new(&config(1, 0.35, 2));
        session.step(good(0.9, 1.0)).unwrap();
        session.abandon();
        assert_eq!(session.state(), SessionState::Abandoned);
        assert!(session.accepted().is_empty());
        assert_eq!(session.step(good(0.9, 1.0)), Err(ProtocolError::Cancelled));
    }

    #[test]
    fn test_into_embeddings_before_completion_fails() {
        let session = CaptureSession::new(&config(3, 0.35, 2));
        assert_eq!(
            session.into_embeddings(),
            Err(ProtocolError::MissingPoseEmbedding(Pose::Front))
        );
    }
}
