//! Seams to the external collaborators: camera, embedding service, template storage.

use crate::error::{CaptureError, OracleError, StoreError};
use crate::session::CancelToken;
use crate::types::{Embedding, Frame, FrameResult};

/// Black-box face detector + embedder.
pub trait EmbeddingOracle {
    /// Process one encoded image. `liveness_hint` is set for frames taken
    /// during a head-turn challenge.
    fn process(&mut self, image: &[u8], liveness_hint: bool) -> Result<FrameResult, OracleError>;
}

/// Blocking source of camera frames.
pub trait FrameSource {
    /// Wait for the next frame. Implementations should return
    /// [`CaptureError::Cancelled`] promptly once `cancel` fires.
    fn next_frame(&mut self, cancel: &CancelToken) -> Result<Frame, CaptureError>;
}

/// Per-identity template persistence. `save` replaces any previous template.
pub trait TemplateStore {
    fn save(&mut self, identity: &str, template: &Embedding) -> Result<(), StoreError>;
    fn fetch(&self, identity: &str) -> Result<Option<Embedding>, StoreError>;
}

impl<T: EmbeddingOracle + ?Sized> EmbeddingOracle for Box<T> {
    fn process(&mut self, image: &[u8], liveness_hint: bool) -> Result<FrameResult, OracleError> {
        (**self).process(image, liveness_hint)
    }
}

impl<T: FrameSource + ?Sized> FrameSource for Box<T> {
    fn next_frame(&mut self, cancel: &CancelToken) -> Result<Frame, CaptureError> {
        (**self).next_frame(cancel)
    }
}
