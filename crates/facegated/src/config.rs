use facegate_core::{ConfigError, ProtocolConfig, ProtocolError};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_ORACLE_URL: &str = "http://127.0.0.1:8001";

/// Which message bus the daemon claims its name on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusKind {
    Session,
    System,
}

/// Daemon configuration, loaded from an optional TOML file and `FACEGATE_*`
/// environment variables. Environment values win.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the embedding service.
    pub oracle_url: String,
    /// Per-request timeout for the embedding service.
    pub oracle_timeout_secs: u64,
    /// Root of the per-identity frame spool directories.
    pub spool_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    pub bus: BusKind,
    /// Give up waiting for a camera frame after this long. 0 waits until cancelled.
    pub frame_timeout_secs: u64,
    pub protocol: ProtocolConfig,
}

/// Shape of the `FACEGATE_CONFIG` file. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    oracle_url: Option<String>,
    oracle_timeout_secs: Option<u64>,
    spool_dir: Option<PathBuf>,
    db_path: Option<PathBuf>,
    bus: Option<String>,
    frame_timeout_secs: Option<u64>,
    protocol: ProtocolConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let file = match var("FACEGATE_CONFIG") {
            Some(path) => load_file(Path::new(&path))?,
            None => FileConfig::default(),
        };

        let data_dir = var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = var("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("facegate");

        let spool_dir = var("FACEGATE_SPOOL_DIR")
            .map(PathBuf::from)
            .or(file.spool_dir)
            .unwrap_or_else(|| data_dir.join("spool"));

        let db_path = var("FACEGATE_DB_PATH")
            .map(PathBuf::from)
            .or(file.db_path)
            .unwrap_or_else(|| data_dir.join("templates.db"));

        let bus_name = var("FACEGATE_BUS").or(file.bus);
        let bus = match bus_name.as_deref() {
            None | Some("session") => BusKind::Session,
            Some("system") => BusKind::System,
            Some(other) => {
                return Err(ConfigError::Parse(format!(
                    "FACEGATE_BUS must be 'session' or 'system', got '{other}'"
                )))
            }
        };

        let mut protocol = file.protocol;
        let p = &mut protocol;
        p.enrollment_quality_min = env_f32(&var, "FACEGATE_ENROLL_QUALITY_MIN", p.enrollment_quality_min);
        p.verification_quality_min = env_f32(&var, "FACEGATE_VERIFY_QUALITY_MIN", p.verification_quality_min);
        p.similarity_min = env_f32(&var, "FACEGATE_SIMILARITY_MIN", p.similarity_min);
        p.good_streak = env_u32(&var, "FACEGATE_GOOD_STREAK", p.good_streak);
        p.liveness_dx_threshold = env_f32(&var, "FACEGATE_LIVENESS_DX", p.liveness_dx_threshold);
        p.liveness_mirrored = env_bool(&var, "FACEGATE_LIVENESS_MIRRORED", p.liveness_mirrored);
        p.max_attempts = env_u32(&var, "FACEGATE_MAX_ATTEMPTS", p.max_attempts);
        p.throttle_ms = env_u64(&var, "FACEGATE_THROTTLE_MS", p.throttle_ms);
        p.embedding_dim = env_u64(&var, "FACEGATE_EMBEDDING_DIM", p.embedding_dim as u64) as usize;
        p.skip_dark_frames = env_bool(&var, "FACEGATE_SKIP_DARK_FRAMES", p.skip_dark_frames);
        if let Some(cap) = var("FACEGATE_MAX_FRAMES_PER_POSE") {
            // 0 or empty removes the cap.
            p.max_frames_per_pose = match cap.trim() {
                "" | "0" => None,
                v => Some(parse_or_warn("FACEGATE_MAX_FRAMES_PER_POSE", v).ok_or_else(|| {
                    ConfigError::Parse(format!("FACEGATE_MAX_FRAMES_PER_POSE: invalid value '{v}'"))
                })?),
            };
        }
        protocol.validate()?;

        Ok(Self {
            oracle_url: var("FACEGATE_ORACLE_URL")
                .or(file.oracle_url)
                .unwrap_or_else(|| DEFAULT_ORACLE_URL.to_string()),
            oracle_timeout_secs: env_u64(
                &var,
                "FACEGATE_ORACLE_TIMEOUT_SECS",
                file.oracle_timeout_secs.unwrap_or(10),
            ),
            spool_dir,
            db_path,
            bus,
            frame_timeout_secs: env_u64(
                &var,
                "FACEGATE_FRAME_TIMEOUT_SECS",
                file.frame_timeout_secs.unwrap_or(30),
            ),
            protocol,
        })
    }

    pub fn frame_timeout(&self) -> Option<Duration> {
        (self.frame_timeout_secs > 0).then(|| Duration::from_secs(self.frame_timeout_secs))
    }

    /// Spool directory the camera pipeline fills for one identity.
    ///
    /// Distinct identities always get distinct directories below `spool_dir`.
    pub fn spool_dir_for(&self, identity: &str) -> Result<PathBuf, ProtocolError> {
        if identity.is_empty() {
            return Err(ProtocolError::MissingIdentity);
        }
        Ok(self.spool_dir.join(encode_identity(identity)))
    }
}

fn load_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Parse(format!("{}: {e}", path.display())))?;
    toml::from_str(&text).map_err(|e| ConfigError::Parse(format!("{}: {e}", path.display())))
}

/// Percent-encode every byte outside `[A-Za-z0-9_-]`, so the result is a
/// single path component that never starts with a dot.
fn encode_identity(identity: &str) -> String {
    let mut out = String::with_capacity(identity.len());
    for b in identity.bytes() {
        if b.is_ascii_alphanumeric() || b == b'-' || b == b'_' {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

fn parse_or_warn<T: std::str::FromStr>(key: &str, value: &str) -> Option<T> {
    let parsed = value.trim().parse().ok();
    if parsed.is_none() {
        tracing::warn!(key, value, "ignoring unparsable value");
    }
    parsed
}

fn env_f32(var: &impl Fn(&str) -> Option<String>, key: &str, default: f32) -> f32 {
    var(key)
        .and_then(|v| parse_or_warn(key, &v))
        .unwrap_or(default)
}

fn env_u32(var: &impl Fn(&str) -> Option<String>, key: &str, default: u32) -> u32 {
    var(key)
        .and_then(|v| parse_or_warn(key, &v))
        .unwrap_or(default)
}

fn env_u64(var: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> u64 {
    var(key)
        .and_then(|v| parse_or_warn(key, &v))
        .unwrap_or(default)
}

fn env_bool(var: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    let Some(value) = var(key) else {
        return default;
    };
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => {
            tracing::warn!(key, value = %value, "ignoring unparsable value");
            default
        }
    }
}
