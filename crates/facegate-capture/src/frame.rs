//! Frame normalization: decode, downscale, JPEG re-encode, dark detection.

use facegate_core::Frame;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::GenericImageView;

const DEFAULT_MAX_DIMENSION: u32 = 640;
const DEFAULT_JPEG_QUALITY: u8 = 90;
const DEFAULT_DARK_THRESHOLD: f32 = 0.95;
/// Luma values below this count toward the dark fraction (darkest 8-bucket bin).
const DARK_PIXEL_CUTOFF: u8 = 32;

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizeConfig {
    /// Longest side after downscaling.
    pub max_dimension: u32,
    pub jpeg_quality: u8,
    /// Fraction of dark pixels above which a frame is considered dark.
    pub dark_threshold: f32,
}

impl Default for NormalizeConfig {
    fn default() -> Self {
        Self {
            max_dimension: DEFAULT_MAX_DIMENSION,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            dark_threshold: DEFAULT_DARK_THRESHOLD,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("failed to encode JPEG: {0}")]
    Encode(String),
}

/// Turn raw image bytes into a protocol [`Frame`].
pub fn normalize(bytes: &[u8], sequence: u64, config: &NormalizeConfig) -> Result<Frame, FrameError> {
    let mut img = image::load_from_memory(bytes)?;

    let (width, height) = img.dimensions();
    if width.max(height) > config.max_dimension {
        img = img.resize(config.max_dimension, config.max_dimension, FilterType::Triangle);
        tracing::trace!(
            from = ?(width, height),
            to = ?img.dimensions(),
            "downscaled frame"
        );
    }

    let gray = img.to_luma8();
    let is_dark = is_dark_frame(gray.as_raw(), config.dark_threshold);

    let rgb = img.to_rgb8();
    let mut data = Vec::new();
    JpegEncoder::new_with_quality(&mut data, config.jpeg_quality)
        .encode_image(&rgb)
        .map_err(|e| FrameError::Encode(e.to_string()))?;

    let mut frame = Frame::new(data, rgb.width(), rgb.height(), sequence);
    frame.is_dark = is_dark;
    Ok(frame)
}

/// Returns true if more than `threshold_pct` of pixels fall in the darkest bucket (0–31).
pub fn is_dark_frame(gray: &[u8], threshold_pct: f32) -> bool {
    if gray.is_empty() {
        return true;
    }
    let dark_count = gray.iter().filter(|&&p| p < DARK_PIXEL_CUTOFF).count();
    (dark_count as f32 / gray.len() as f32) > threshold_pct
}
