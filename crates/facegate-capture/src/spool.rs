//! Spool-directory frame source.
//!
//! An external camera pipeline writes one image file per frame into the
//! directory (write to a temporary name, then rename). Frames are consumed in
//! lexicographic file-name order and deleted once read.

use crate::frame::{self, NormalizeConfig};
use facegate_core::{CancelToken, CaptureError, Frame, FrameSource};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];
const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

#[derive(Debug, Clone)]
pub struct SpoolConfig {
    pub poll_interval: Duration,
    /// Give up waiting for a frame after this long. `None` waits until cancelled.
    pub wait_timeout: Option<Duration>,
    pub normalize: NormalizeConfig,
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            wait_timeout: None,
            normalize: NormalizeConfig::default(),
        }
    }
}

pub struct SpoolFrameSource {
    dir: PathBuf,
    config: SpoolConfig,
    sequence: u64,
}

impl SpoolFrameSource {
    /// Open (creating if needed) the spool directory.
    pub fn open(dir: impl Into<PathBuf>, config: SpoolConfig) -> Result<Self, CaptureError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .map_err(|e| CaptureError::Unavailable(format!("{}: {e}", dir.display())))?;
        tracing::debug!(dir = %dir.display(), "spool opened");
        Ok(Self {
            dir,
            config,
            sequence: 0,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Delete frames left over from an earlier session. Returns how many were removed.
    pub fn drain(&mut self) -> Result<usize, CaptureError> {
        let stale = self.pending()?;
        for path in &stale {
            if let Err(e) = fs::remove_file(path) {
                tracing::warn!(path = %path.display(), error = %e, "failed to remove stale frame");
            }
        }
        if !stale.is_empty() {
            tracing::info!(dir = %self.dir.display(), count = stale.len(), "discarded stale frames");
        }
        Ok(stale.len())
    }

    /// Image files currently waiting, oldest name first.
    ///
    /// A spool directory removed underneath us means the camera pipeline has
    /// shut down; no more frames will come.
    fn pending(&self) -> Result<Vec<PathBuf>, CaptureError> {
        let entries = fs::read_dir(&self.dir).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => CaptureError::Exhausted,
            _ => CaptureError::Unavailable(format!("{}: {e}", self.dir.display())),
        })?;

        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && is_image(path))
            .collect();
        files.sort();
        Ok(files)
    }

    /// Consume the next decodable frame, if any is waiting.
    fn take_next(&mut self) -> Result<Option<Frame>, CaptureError> {
        for path in self.pending()? {
            let bytes = match fs::read(&path) {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "unreadable frame");
                    continue;
                }
            };
            if let Err(e) = fs::remove_file(&path) {
                return Err(CaptureError::Unavailable(format!(
                    "cannot consume {}: {e}",
                    path.display()
                )));
            }

            self.sequence += 1;
            match frame::normalize(&bytes, self.sequence, &self.config.normalize) {
                Ok(frame) => {
                    tracing::trace!(path = %path.display(), seq = self.sequence, dark = frame.is_dark, "frame taken");
                    return Ok(Some(frame));
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping undecodable frame");
                }
            }
        }
        Ok(None)
    }
}

impl FrameSource for SpoolFrameSource {
    fn next_frame(&mut self, cancel: &CancelToken) -> Result<Frame, CaptureError> {
        let started = Instant::now();
        loop {
            if cancel.is_cancelled() {
                return Err(CaptureError::Cancelled);
            }
            if let Some(frame) = self.take_next()? {
                return Ok(frame);
            }
            if let Some(timeout) = self.config.wait_timeout {
                if started.elapsed() >= timeout {
                    return Err(CaptureError::Timeout(timeout));
                }
            }
            if cancel.wait(self.config.poll_interval) {
                return Err(CaptureError::Cancelled);
            }
        }
    }
}

fn is_image(path: &Path) -> bool {
    let hidden = path
        .file_name()
        .and_then(|n| n.to_str())
        .map_or(true, |n| n.starts_with('.'));
    let known = path
        .extension()
        .and_then(|e| e.to_str())
        .map_or(false, |e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()));
    !hidden && known
}
