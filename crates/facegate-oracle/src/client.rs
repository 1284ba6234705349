//! Blocking HTTP client for the face processing service.

use crate::wire::{self, ProcessRequest};
use base64::Engine as _;
use facegate_core::{EmbeddingOracle, FrameResult, OracleError};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8001";
const DEFAULT_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone)]
pub struct OracleConfig {
    pub base_url: String,
    pub timeout: Duration,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }
}

/// `GET /health` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: String,
    #[serde(default)]
    pub model_loaded: Option<bool>,
    #[serde(default)]
    pub model_path: Option<String>,
    #[serde(default)]
    pub timestamp: Option<f64>,
    #[serde(default)]
    pub error: Option<String>,
}

impl HealthReport {
    pub fn is_ready(&self) -> bool {
        self.status == "ok" && self.model_loaded.unwrap_or(false)
    }
}

/// `GET /model-info` payload. Shape entries may be symbolic (e.g. `"batch"`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub input_name: String,
    pub input_shape: Vec<serde_json::Value>,
    pub output_name: String,
    pub output_shape: Vec<serde_json::Value>,
    #[serde(default)]
    pub model_path: Option<String>,
}

pub struct HttpOracle {
    client: Client,
    base_url: String,
}

impl HttpOracle {
    pub fn new(config: OracleConfig) -> Result<Self, OracleError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| OracleError::Unavailable(format!("http client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn health(&self) -> Result<HealthReport, OracleError> {
        self.get_json("/health")
    }

    pub fn model_info(&self) -> Result<ModelInfo, OracleError> {
        self.get_json("/model-info")
    }

    fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, OracleError> {
        let url = format!("{}{path}", self.base_url);
        let response = self.client.get(&url).send().map_err(transport_error)?;
        let status = response.status().as_u16();
        let body = response.text().map_err(transport_error)?;

        if !(200..300).contains(&status) {
            return Err(OracleError::Unavailable(format!("GET {path}: HTTP {status}: {body}")));
        }
        serde_json::from_str(&body).map_err(|e| OracleError::Malformed(format!("{path}: {e}")))
    }
}

impl EmbeddingOracle for HttpOracle {
    fn process(&mut self, image: &[u8], liveness_hint: bool) -> Result<FrameResult, OracleError> {
        let request = ProcessRequest {
            image_data: base64::engine::general_purpose::STANDARD.encode(image),
            return_face_image: false,
            liveness_check: liveness_hint,
        };

        let started = Instant::now();
        let response = self
            .client
            .post(format!("{}/process-face", self.base_url))
            .json(&request)
            .send()
            .map_err(transport_error)?;
        let status = response.status().as_u16();
        let body = response.text().map_err(transport_error)?;

        let result = wire::interpret(status, &body);
        tracing::debug!(
            status,
            bytes = image.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "process-face"
        );
        result
    }
}

fn transport_error(e: reqwest::Error) -> OracleError {
    if e.is_timeout() {
        OracleError::Unavailable(format!("request timed out: {e}"))
    } else if e.is_connect() {
        OracleError::Unavailable(format!("cannot connect: {e}"))
    } else {
        OracleError::Unavailable(e.to_string())
    }
}
