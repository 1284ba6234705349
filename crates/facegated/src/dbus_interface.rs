use crate::config::{BusKind, Config};
use crate::engine::{EngineError, EngineHandle};
use facegate_core::{ProtocolConfig, VerificationMode};
use serde::Serialize;
use std::path::PathBuf;
use zbus::interface;

pub const BUS_NAME: &str = "org.facegate.Facegate1";
pub const OBJECT_PATH: &str = "/org/facegate/Facegate1";

/// Static part of the `Status` reply.
#[derive(Debug, Clone, Serialize)]
struct DaemonInfo {
    version: &'static str,
    oracle_url: String,
    spool_dir: PathBuf,
    db_path: PathBuf,
    bus: &'static str,
    protocol: ProtocolConfig,
}

/// D-Bus interface for the facegate daemon.
///
/// Bus name: org.facegate.Facegate1
/// Object path: /org/facegate/Facegate1
///
/// Replies are JSON documents. Failures come back as
/// `org.freedesktop.DBus.Error.Failed` whose message is
/// `{"kind": ..., "message": ...}`.
pub struct FacegateService {
    engine: EngineHandle,
    info: DaemonInfo,
}

impl FacegateService {
    pub fn new(engine: EngineHandle, config: &Config) -> Self {
        Self {
            engine,
            info: DaemonInfo {
                version: env!("CARGO_PKG_VERSION"),
                oracle_url: config.oracle_url.clone(),
                spool_dir: config.spool_dir.clone(),
                db_path: config.db_path.clone(),
                bus: match config.bus {
                    BusKind::Session => "session",
                    BusKind::System => "system",
                },
                protocol: config.protocol.clone(),
            },
        }
    }
}

#[interface(name = "org.facegate.Facegate1")]
impl FacegateService {
    /// Run the four-pose enrollment for `user` and replace their template.
    async fn enroll(&self, user: &str) -> zbus::fdo::Result<String> {
        tracing::info!(user, "enroll requested");
        let record = self.engine.enroll(user).await.map_err(to_fdo)?;
        to_json(&record)
    }

    /// One verification attempt. Reuse `action_id` across retries of the same
    /// clock-in; pass an empty string to start a new one.
    async fn verify(&self, user: &str, action_id: &str, challenge: bool) -> zbus::fdo::Result<String> {
        tracing::info!(user, action_id, challenge, "verify requested");
        let mode = if challenge {
            VerificationMode::Challenged
        } else {
            VerificationMode::Simple
        };
        let report = self.engine.verify(user, action_id, mode).await.map_err(to_fdo)?;
        to_json(&report)
    }

    /// Abort the session running for `user`. `false` if none was.
    async fn cancel(&self, user: &str) -> bool {
        self.engine.cancel(user)
    }

    async fn remove_template(&self, user: &str) -> zbus::fdo::Result<bool> {
        tracing::info!(user, "remove_template requested");
        self.engine.remove(user).await.map_err(to_fdo)
    }

    async fn list_templates(&self) -> zbus::fdo::Result<String> {
        let records = self.engine.list().await.map_err(to_fdo)?;
        to_json(&records)
    }

    async fn status(&self) -> zbus::fdo::Result<String> {
        Ok(serde_json::json!({
            "daemon": self.info,
            "sessions": self.engine.sessions(),
        })
        .to_string())
    }
}

fn to_json<T: Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

fn to_fdo(err: EngineError) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(
        serde_json::json!({
            "kind": err.kind(),
            "message": err.to_string(),
        })
        .to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use facegate_core::ProtocolError;

    #[test]
    fn test_error_payload_carries_kind() {
        let err = to_fdo(EngineError::Protocol(ProtocolError::NotEnrolled("alice".into())));
        let zbus::fdo::Error::Failed(msg) = err else {
            panic!("expected Failed");
        };
        let payload: serde_json::Value = serde_json::from_str(&msg).unwrap();
        assert_eq!(payload["kind"], "precondition");
        assert_eq!(payload["message"], "identity 'alice' has no enrolled template");
    }

    #[test]
    fn test_busy_is_precondition() {
        let zbus::fdo::Error::Failed(msg) = to_fdo(EngineError::Busy("bob".into())) else {
            panic!("expected Failed");
        };
        assert!(msg.contains("\"precondition\""));
    }
}
