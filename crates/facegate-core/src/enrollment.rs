//! Enrollment: capture all poses, average, persist.

use crate::capture::CaptureSession;
use crate::config::ProtocolConfig;
use crate::error::ProtocolError;
use crate::session::{SessionContext, SessionRegistry};
use crate::traits::{EmbeddingOracle, FrameSource, TemplateStore};
use crate::types::{Embedding, Pose};

/// A template bound to the identity it was stored under.
#[derive(Debug, Clone, PartialEq)]
pub struct EnrollmentTemplate {
    pub identity: String,
    pub embedding: Embedding,
}

pub struct Enroller<'a> {
    config: &'a ProtocolConfig,
    registry: &'a SessionRegistry,
}

impl<'a> Enroller<'a> {
    pub fn new(config: &'a ProtocolConfig, registry: &'a SessionRegistry) -> Self {
        Self { config, registry }
    }

    /// Run a full enrollment for `identity` and overwrite its stored template.
    ///
    /// Only one enrollment per identity may run at a time. On cancellation or
    /// any failure nothing is written; a store failure is returned unchanged
    /// and the computed template is dropped.
    pub fn enroll<F, O, T>(
        &self,
        identity: &str,
        ctx: &mut SessionContext<'_, F, O>,
        store: &mut T,
    ) -> Result<EnrollmentTemplate, ProtocolError>
    where
        F: FrameSource,
        O: EmbeddingOracle,
        T: TemplateStore + ?Sized,
    {
        if identity.is_empty() {
            return Err(ProtocolError::MissingIdentity);
        }
        let _lease = self.registry.acquire(identity)?;
        tracing::info!(identity, "enrollment started");

        let mut session = CaptureSession::new(self.config);
        session.run(ctx, self.config)?;

        let embedding = average_poses(&session.into_embeddings()?, self.config.embedding_dim)?;

        // Last chance to honour a cancel that raced the final frame.
        ctx.cancel.check()?;

        store.save(identity, &embedding)?;
        tracing::info!(identity, dim = embedding.dim(), "template stored");

        Ok(EnrollmentTemplate {
            identity: identity.to_string(),
            embedding,
        })
    }
}

/// Elementwise mean of one embedding per pose, in pose order.
pub fn average_poses(accepted: &[(Pose, Embedding)], dim: usize) -> Result<Embedding, ProtocolError> {
    let mut ordered = Vec::with_capacity(Pose::SEQUENCE.len());
    for pose in Pose::SEQUENCE {
        let (_, embedding) = accepted
            .iter()
            .find(|(p, _)| *p == pose)
            .ok_or(ProtocolError::MissingPoseEmbedding(pose))?;
        if embedding.dim() != dim {
            return Err(ProtocolError::DimensionMismatch {
                expected: dim,
                actual: embedding.dim(),
            });
        }
        ordered.push(embedding.clone());
    }

    Embedding::mean(&ordered).ok_or(ProtocolError::MissingPoseEmbedding(Pose::SEQUENCE[0]))
}
