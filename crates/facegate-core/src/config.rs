//! Tunable protocol constants.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_ENROLLMENT_QUALITY_MIN: f32 = 0.35;
pub const DEFAULT_VERIFICATION_QUALITY_MIN: f32 = 0.30;
pub const DEFAULT_SIMILARITY_MIN: f32 = 0.60;
pub const DEFAULT_GOOD_STREAK: u32 = 3;
pub const DEFAULT_LIVENESS_DX_THRESHOLD: f32 = 0.08;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_THROTTLE_MS: u64 = 350;
pub const DEFAULT_EMBEDDING_DIM: usize = 128;

/// Thresholds and limits for enrollment and verification.
///
/// Every field has a default, so a partial TOML table is enough to override
/// a single value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Minimum quality for a frame to extend the enrollment streak.
    pub enrollment_quality_min: f32,
    /// Minimum quality for a verification frame.
    pub verification_quality_min: f32,
    /// Cosine similarity at or above which a fresh capture matches the template.
    pub similarity_min: f32,
    /// Consecutive good frames required to accept a pose.
    pub good_streak: u32,
    /// Horizontal offset magnitude a liveness head turn must exceed.
    pub liveness_dx_threshold: f32,
    /// Flip the sign of the service's horizontal offset (mirrored front cameras).
    pub liveness_mirrored: bool,
    /// Consecutive failed verification attempts before the action is refused.
    pub max_attempts: u32,
    /// Delay between successive frame submissions.
    pub throttle_ms: u64,
    /// Optional cap on frames examined per pose. `None` waits for the operator.
    pub max_frames_per_pose: Option<u32>,
    /// Expected embedding length.
    pub embedding_dim: usize,
    /// Classify frames the capture layer marked dark as undetected without a service call.
    pub skip_dark_frames: bool,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            enrollment_quality_min: DEFAULT_ENROLLMENT_QUALITY_MIN,
            verification_quality_min: DEFAULT_VERIFICATION_QUALITY_MIN,
            similarity_min: DEFAULT_SIMILARITY_MIN,
            good_streak: DEFAULT_GOOD_STREAK,
            liveness_dx_threshold: DEFAULT_LIVENESS_DX_THRESHOLD,
            liveness_mirrored: false,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            throttle_ms: DEFAULT_THROTTLE_MS,
            max_frames_per_pose: None,
            embedding_dim: DEFAULT_EMBEDDING_DIM,
            skip_dark_frames: true,
        }
    }
}

impl ProtocolConfig {
    pub fn throttle(&self) -> Duration {
        Duration::from_millis(self.throttle_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        unit_range("enrollment_quality_min", self.enrollment_quality_min)?;
        unit_range("verification_quality_min", self.verification_quality_min)?;
        unit_range("liveness_dx_threshold", self.liveness_dx_threshold)?;

        if !(-1.0..=1.0).contains(&self.similarity_min) {
            return Err(ConfigError::OutOfRange {
                field: "similarity_min",
                value: self.similarity_min as f64,
                min: -1.0,
                max: 1.0,
            });
        }

        if self.good_streak == 0 {
            return Err(ConfigError::Zero("good_streak"));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Zero("max_attempts"));
        }
        if self.embedding_dim == 0 {
            return Err(ConfigError::Zero("embedding_dim"));
        }
        if self.max_frames_per_pose == Some(0) {
            return Err(ConfigError::Zero("max_frames_per_pose"));
        }
        Ok(())
    }
}

fn unit_range(field: &'static str, value: f32) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            field,
            value: value as f64,
            min: 0.0,
            max: 1.0,
        })
    }
}
