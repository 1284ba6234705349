//! JSON shapes of the embedding service and their mapping onto [`FrameResult`].

use facegate_core::{Embedding, FrameResult, OracleError};
use serde::{Deserialize, Serialize};

/// Marker the service uses for "decoded fine, found no usable face".
const NO_FACE_MARKER: &str = "no face detected";

#[derive(Debug, Serialize)]
pub struct ProcessRequest {
    #[serde(rename = "imageData")]
    pub image_data: String,
    #[serde(rename = "returnFaceImage")]
    pub return_face_image: bool,
    #[serde(rename = "livenessCheck", skip_serializing_if = "std::ops::Not::not")]
    pub liveness_check: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct ProcessResponse {
    #[serde(default)]
    pub face_detected: bool,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub quality_score: Option<f32>,
    #[serde(default)]
    pub processing_time: Option<f64>,
    /// `[x, y, w, h]` in pixels.
    #[serde(default)]
    pub bbox: Option<[f32; 4]>,
    /// `[w, h]` in pixels.
    #[serde(default)]
    pub image_size: Option<[f32; 2]>,
    #[serde(default)]
    pub center_offset: Option<[f32; 2]>,
    #[serde(default)]
    pub box_ratio: Option<f32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub details: Option<String>,
}

impl ErrorBody {
    fn message(&self) -> String {
        match (&self.error, &self.details) {
            (Some(e), Some(d)) => format!("{e}: {d}"),
            (Some(e), None) => e.clone(),
            (None, Some(d)) => d.clone(),
            (None, None) => "no details".to_string(),
        }
    }

    fn is_no_face(&self) -> bool {
        self.error
            .as_deref()
            .is_some_and(|e| e.to_ascii_lowercase().contains(NO_FACE_MARKER))
    }
}

impl ProcessResponse {
    /// Normalized horizontal face offset, from `center_offset` or derived from the box.
    pub fn horizontal_offset(&self) -> Option<f32> {
        if let Some([dx, _]) = self.center_offset {
            if dx.is_finite() {
                return Some(dx);
            }
        }
        let [x, _, w, _] = self.bbox?;
        let [img_w, _] = self.image_size?;
        if img_w <= 0.0 {
            return None;
        }
        let dx = (x + w / 2.0 - img_w / 2.0) / img_w;
        dx.is_finite().then_some(dx)
    }

    pub fn into_frame_result(self) -> FrameResult {
        let offset = self.horizontal_offset();
        let embedding = match self.embedding {
            Some(values) if self.face_detected && !values.is_empty() => values,
            _ => return FrameResult::undetected(),
        };
        let quality = self
            .quality_score
            .filter(|q| q.is_finite())
            .unwrap_or(0.0)
            .clamp(0.0, 1.0);

        FrameResult {
            detected: true,
            quality,
            embedding: Embedding::new(embedding),
            horizontal_offset: offset,
        }
    }
}

/// Map an HTTP status + body from `/process-face` onto a frame result.
pub fn interpret(status: u16, body: &str) -> Result<FrameResult, OracleError> {
    match status {
        200..=299 => {
            let parsed: ProcessResponse =
                serde_json::from_str(body).map_err(|e| OracleError::Malformed(e.to_string()))?;
            Ok(parsed.into_frame_result())
        }
        400..=499 => {
            let err: ErrorBody = serde_json::from_str(body).unwrap_or_default();
            if status == 400 && err.is_no_face() {
                Ok(FrameResult::undetected())
            } else {
                Err(OracleError::Rejected {
                    status,
                    details: err.message(),
                })
            }
        }
        _ => {
            let err: ErrorBody = serde_json::from_str(body).unwrap_or_default();
            Err(OracleError::Unavailable(format!("HTTP {status}: {}", err.message())))
        }
    }
}
