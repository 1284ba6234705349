//! facegate-oracle - client for the face processing service.
//!
//! The service detects the largest face in an image, aligns it, and returns a
//! 128-dimensional MobileFaceNet embedding together with a quality score and
//! the face's position in the frame.

pub mod client;
pub mod wire;

pub use client::{HealthReport, HttpOracle, ModelInfo, OracleConfig, DEFAULT_BASE_URL};
