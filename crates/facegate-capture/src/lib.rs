//! facegate-capture - frame acquisition for the enrollment and verification protocol.
//!
//! Frames arrive as image files dropped into a per-identity spool directory by
//! an external camera pipeline. Each file is decoded, downscaled, re-encoded
//! as JPEG and checked for darkness before the protocol sees it.

pub mod frame;
pub mod spool;

pub use frame::{normalize, FrameError, NormalizeConfig};
pub use spool::{SpoolConfig, SpoolFrameSource};
