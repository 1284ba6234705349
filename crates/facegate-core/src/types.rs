use serde::{Deserialize, Serialize};
use std::fmt;

/// One of the head orientations captured during enrollment.
///
/// The capture order is fixed: [`Pose::SEQUENCE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pose {
    Front,
    Left,
    Right,
    Smile,
}

impl Pose {
    /// Enrollment capture order.
    pub const SEQUENCE: [Pose; 4] = [Pose::Front, Pose::Left, Pose::Right, Pose::Smile];

    /// The pose captured after this one, or `None` after the last.
    pub fn next(self) -> Option<Pose> {
        let idx = Self::SEQUENCE.iter().position(|p| *p == self)?;
        Self::SEQUENCE.get(idx + 1).copied()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Pose::Front => "front",
            Pose::Left => "left",
            Pose::Right => "right",
            Pose::Smile => "smile",
        }
    }

    /// Prompt shown to the person being enrolled.
    pub fn instruction(self) -> &'static str {
        match self {
            Pose::Front => "look straight at the camera",
            Pose::Left => "turn your head slightly to the left",
            Pose::Right => "turn your head slightly to the right",
            Pose::Smile => "look at the camera and smile",
        }
    }
}

impl fmt::Display for Pose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Face embedding vector (128-dimensional for the MobileFaceNet service).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Cosine similarity in [-1, 1]. Higher = more similar.
    ///
    /// Returns 0.0 when either vector has zero norm. Always processes all
    /// dimensions; callers are expected to have checked that lengths agree.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 {
            (dot / denom).clamp(-1.0, 1.0)
        } else {
            0.0
        }
    }

    /// Elementwise arithmetic mean.
    ///
    /// `None` if `items` is empty or the vectors differ in length.
    pub fn mean(items: &[Embedding]) -> Option<Embedding> {
        let first = items.first()?;
        let dim = first.dim();
        if items.iter().any(|e| e.dim() != dim) {
            return None;
        }

        let mut sums = vec![0.0f32; dim];
        for item in items {
            for (sum, v) in sums.iter_mut().zip(item.values.iter()) {
                *sum += v;
            }
        }
        let n = items.len() as f32;
        Some(Embedding {
            values: sums.into_iter().map(|s| s / n).collect(),
        })
    }
}

/// Output of one embedding-service call for one image.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameResult {
    pub detected: bool,
    /// Service-reported capture quality in [0, 1]. Missing values are 0.
    pub quality: f32,
    /// Empty when no face was detected.
    pub embedding: Embedding,
    /// Normalized horizontal offset of the face center from the image center
    /// (negative = left of center in the service's image coordinates).
    pub horizontal_offset: Option<f32>,
}

impl FrameResult {
    pub fn undetected() -> Self {
        Self {
            detected: false,
            quality: 0.0,
            embedding: Embedding::default(),
            horizontal_offset: None,
        }
    }

    pub fn detected(quality: f32, embedding: Embedding) -> Self {
        Self {
            detected: true,
            quality,
            embedding,
            horizontal_offset: None,
        }
    }

    pub fn with_offset(mut self, dx: f32) -> Self {
        self.horizontal_offset = Some(dx);
        self
    }
}

/// An encoded camera image ready to be sent to the embedding service.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Encoded image bytes (JPEG after normalization).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub sequence: u64,
    /// Set by the capture layer when the frame is too dark to contain a usable face.
    pub is_dark: bool,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, sequence: u64) -> Self {
        Self {
            data,
            width,
            height,
            sequence,
            is_dark: false,
        }
    }
}
