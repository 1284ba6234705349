//! Per-session plumbing: cancellation, observers, the frame pull step,
//! and the one-enrollment-per-identity registry.

use crate::capture::FrameVerdict;
use crate::config::ProtocolConfig;
use crate::error::ProtocolError;
use crate::traits::{EmbeddingOracle, FrameSource};
use crate::types::{FrameResult, Pose};
use crate::verification::TurnDirection;
use std::collections::HashSet;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

/// Clonable cancellation flag shared between a running session and its operator.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (flag, cvar) = &*self.inner;
        *lock(flag) = true;
        cvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *lock(&self.inner.0)
    }

    /// Sleep for `timeout` or until cancelled. Returns `true` if cancelled.
    pub fn wait(&self, timeout: Duration) -> bool {
        let (flag, cvar) = &*self.inner;
        let guard = lock(flag);
        let (guard, _) = cvar
            .wait_timeout_while(guard, timeout, |cancelled| !*cancelled)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard
    }

    /// `Err(Cancelled)` once the token has fired.
    pub fn check(&self) -> Result<(), ProtocolError> {
        if self.is_cancelled() {
            Err(ProtocolError::Cancelled)
        } else {
            Ok(())
        }
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Progress callbacks. All methods default to no-ops.
pub trait SessionObserver {
    fn pose_started(&mut self, _pose: Pose) {}
    fn frame_classified(&mut self, _pose: Pose, _verdict: &FrameVerdict, _streak: u32) {}
    fn pose_accepted(&mut self, _pose: Pose) {}
    fn challenge_issued(&mut self, _direction: TurnDirection) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl SessionObserver for NoopObserver {}

/// The collaborators one session drives.
pub struct SessionContext<'a, F, O> {
    pub frames: &'a mut F,
    pub oracle: &'a mut O,
    pub observer: &'a mut dyn SessionObserver,
    pub cancel: &'a CancelToken,
}

impl<'a, F: FrameSource, O: EmbeddingOracle> SessionContext<'a, F, O> {
    pub fn new(
        frames: &'a mut F,
        oracle: &'a mut O,
        observer: &'a mut dyn SessionObserver,
        cancel: &'a CancelToken,
    ) -> Self {
        Self {
            frames,
            oracle,
            observer,
            cancel,
        }
    }

    /// Pull one frame and classify it. Dark frames short-circuit to an
    /// undetected result when `skip_dark_frames` is set.
    pub(crate) fn classify_next(
        &mut self,
        config: &ProtocolConfig,
        liveness_hint: bool,
    ) -> Result<FrameResult, ProtocolError> {
        self.cancel.check()?;
        let frame = self.frames.next_frame(self.cancel)?;

        if config.skip_dark_frames && frame.is_dark {
            tracing::debug!(seq = frame.sequence, "dark frame, skipping service call");
            return Ok(FrameResult::undetected());
        }

        let result = self.oracle.process(&frame.data, liveness_hint)?;
        tracing::trace!(
            seq = frame.sequence,
            detected = result.detected,
            quality = result.quality,
            "frame classified"
        );
        Ok(result)
    }

    /// Inter-step rate limit. Wakes early on cancellation.
    pub(crate) fn throttle(&self, config: &ProtocolConfig) -> Result<(), ProtocolError> {
        let delay = config.throttle();
        if !delay.is_zero() && self.cancel.wait(delay) {
            return Err(ProtocolError::Cancelled);
        }
        self.cancel.check()
    }
}

/// Tracks identities with an enrollment in flight.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    active: Arc<Mutex<HashSet<String>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the enrollment slot for `identity`. Released when the lease drops.
    pub fn acquire(&self, identity: &str) -> Result<EnrollmentLease, ProtocolError> {
        let mut active = lock(&self.active);
        if !active.insert(identity.to_string()) {
            return Err(ProtocolError::EnrollmentInProgress(identity.to_string()));
        }
        Ok(EnrollmentLease {
            registry: self.clone(),
            identity: identity.to_string(),
        })
    }

    pub fn is_active(&self, identity: &str) -> bool {
        lock(&self.active).contains(identity)
    }
}

pub struct EnrollmentLease {
    registry: SessionRegistry,
    identity: String,
}

impl EnrollmentLease {
    pub fn identity(&self) -> &str {
        &self.identity
    }
}

impl Drop for EnrollmentLease {
    fn drop(&mut self) {
        lock(&self.registry.active).remove(&self.identity);
    }
}
