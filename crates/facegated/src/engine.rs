use crate::config::Config;
use crate::sessions::{SessionGuard, SessionKind, SessionProgress, SessionTable};
use crate::store::{SqliteTemplateStore, TemplateRecord};
use facegate_capture::{SpoolConfig, SpoolFrameSource};
use facegate_core::{
    AttemptTracker, Decision, EmbeddingOracle, Enroller, ErrorKind, ProtocolError, SessionContext,
    SessionRegistry, StoreError, TemplateStore, VerificationMode, Verifier,
};
use facegate_oracle::{HttpOracle, OracleConfig};
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Idle verification actions are forgotten after this long.
const TRACKER_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("a session for '{0}' is already running")]
    Busy(String),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(String),
    #[error("engine thread exited")]
    ChannelClosed,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Protocol(e) => e.kind(),
            EngineError::Busy(_) => ErrorKind::Precondition,
            EngineError::Spawn(_) | EngineError::ChannelClosed => ErrorKind::Internal,
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        EngineError::Protocol(e.into())
    }
}

/// Result of one verification attempt within an action.
#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
    pub identity: String,
    pub action_id: String,
    #[serde(flatten)]
    pub decision: Decision,
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Enroll {
        guard: SessionGuard,
        reply: oneshot::Sender<Result<TemplateRecord, EngineError>>,
    },
    Verify {
        guard: SessionGuard,
        action_id: String,
        mode: VerificationMode,
        reply: oneshot::Sender<Result<VerifyReport, EngineError>>,
    },
    Remove {
        identity: String,
        reply: oneshot::Sender<Result<bool, EngineError>>,
    },
    List {
        reply: oneshot::Sender<Result<Vec<TemplateRecord>, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    sessions: SessionTable,
}

impl EngineHandle {
    /// Run a full pose-sequence enrollment and store the averaged template.
    pub async fn enroll(&self, identity: &str) -> Result<TemplateRecord, EngineError> {
        if identity.is_empty() {
            return Err(ProtocolError::MissingIdentity.into());
        }
        let guard = self
            .sessions
            .begin(identity, SessionKind::Enroll)
            .ok_or_else(|| ProtocolError::EnrollmentInProgress(identity.to_string()))?;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(EngineRequest::Enroll {
            guard,
            reply: reply_tx,
        })
        .await?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// One verification attempt. An empty `action_id` starts a fresh action.
    pub async fn verify(
        &self,
        identity: &str,
        action_id: &str,
        mode: VerificationMode,
    ) -> Result<VerifyReport, EngineError> {
        if identity.is_empty() {
            return Err(ProtocolError::MissingIdentity.into());
        }
        let guard = self
            .sessions
            .begin(identity, SessionKind::Verify)
            .ok_or_else(|| EngineError::Busy(identity.to_string()))?;
        let action_id = if action_id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            action_id.to_string()
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(EngineRequest::Verify {
            guard,
            action_id,
            mode,
            reply: reply_tx,
        })
        .await?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Cancel the session in flight for `identity`, if any. Does not queue.
    pub fn cancel(&self, identity: &str) -> bool {
        let found = self.sessions.cancel(identity);
        tracing::info!(identity, found, "cancel requested");
        found
    }

    pub async fn remove(&self, identity: &str) -> Result<bool, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(EngineRequest::Remove {
            identity: identity.to_string(),
            reply: reply_tx,
        })
        .await?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    pub async fn list(&self) -> Result<Vec<TemplateRecord>, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(EngineRequest::List { reply: reply_tx }).await?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    pub fn sessions(&self) -> Vec<SessionProgress> {
        self.sessions.snapshot()
    }

    async fn send(&self, req: EngineRequest) -> Result<(), EngineError> {
        self.tx.send(req).await.map_err(|_| EngineError::ChannelClosed)
    }
}

/// Spawn the engine against the configured embedding service and database.
///
/// The HTTP client and the SQLite connection are created on the engine
/// thread; startup failures are reported before this returns.
pub async fn spawn_engine(config: Config) -> Result<EngineHandle, EngineError> {
    let oracle_config = OracleConfig {
        base_url: config.oracle_url.clone(),
        timeout: Duration::from_secs(config.oracle_timeout_secs),
    };
    let db_path = config.db_path.clone();

    spawn_with(config, move || {
        let oracle = HttpOracle::new(oracle_config).map_err(ProtocolError::from)?;
        match oracle.health() {
            Ok(report) if report.is_ready() => {
                tracing::info!(url = oracle.base_url(), model = ?report.model_path, "embedding service ready")
            }
            Ok(report) => {
                tracing::warn!(url = oracle.base_url(), status = %report.status, "embedding service not ready")
            }
            Err(e) => tracing::warn!(url = oracle.base_url(), error = %e, "embedding service unreachable"),
        }

        let store = SqliteTemplateStore::open(&db_path)?;
        tracing::info!(path = %db_path.display(), "template store opened");
        Ok((oracle, store))
    })
    .await
}

/// Spawn the engine on a dedicated OS thread with collaborators built by `init`.
pub async fn spawn_with<O, F>(config: Config, init: F) -> Result<EngineHandle, EngineError>
where
    O: EmbeddingOracle + 'static,
    F: FnOnce() -> Result<(O, SqliteTemplateStore), EngineError> + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);
    let (ready_tx, ready_rx) = oneshot::channel();

    std::thread::Builder::new()
        .name("facegate-engine".into())
        .spawn(move || {
            let (oracle, store) = match init() {
                Ok(parts) => parts,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(()));

            let mut engine = Engine {
                config,
                oracle,
                store,
                registry: SessionRegistry::new(),
                trackers: HashMap::new(),
            };
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                engine.handle(req);
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(|e| EngineError::Spawn(e.to_string()))?;

    ready_rx.await.map_err(|_| EngineError::ChannelClosed)??;

    Ok(EngineHandle {
        tx,
        sessions: SessionTable::new(),
    })
}

struct TrackerSlot {
    tracker: AttemptTracker,
    touched: Instant,
}

struct Engine<O> {
    config: Config,
    oracle: O,
    store: SqliteTemplateStore,
    registry: SessionRegistry,
    trackers: HashMap<(String, String), TrackerSlot>,
}

impl<O: EmbeddingOracle> Engine<O> {
    fn handle(&mut self, req: EngineRequest) {
        match req {
            EngineRequest::Enroll { guard, reply } => {
                let result = self.run_enroll(&guard);
                if let Err(e) = &result {
                    tracing::warn!(identity = guard.identity(), error = %e, "enrollment failed");
                }
                // Release the identity before the caller hears back.
                drop(guard);
                let _ = reply.send(result);
            }
            EngineRequest::Verify {
                guard,
                action_id,
                mode,
                reply,
            } => {
                let result = self.run_verify(&guard, action_id, mode);
                if let Err(e) = &result {
                    tracing::warn!(identity = guard.identity(), error = %e, "verification failed");
                }
                drop(guard);
                let _ = reply.send(result);
            }
            EngineRequest::Remove { identity, reply } => {
                let result = self.store.remove(&identity).map_err(EngineError::from);
                if let Ok(true) = result {
                    self.trackers.retain(|(id, _), _| id != &identity);
                    tracing::info!(identity = %identity, "template removed");
                }
                let _ = reply.send(result);
            }
            EngineRequest::List { reply } => {
                let _ = reply.send(self.store.list().map_err(EngineError::from));
            }
        }
    }

    fn run_enroll(&mut self, guard: &SessionGuard) -> Result<TemplateRecord, EngineError> {
        let identity = guard.identity();
        let mut frames = open_spool(&self.config, identity)?;
        let mut observer = guard.observer();
        let mut ctx = SessionContext::new(&mut frames, &mut self.oracle, &mut observer, guard.token());

        let started = Instant::now();
        Enroller::new(&self.config.protocol, &self.registry).enroll(identity, &mut ctx, &mut self.store)?;

        let record = self.store.record(identity)?.ok_or_else(|| {
            StoreError::Backend(format!("template for '{identity}' missing after save"))
        })?;
        tracing::info!(
            identity,
            template_id = %record.template_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "enrollment complete"
        );
        Ok(record)
    }

    fn run_verify(
        &mut self,
        guard: &SessionGuard,
        action_id: String,
        mode: VerificationMode,
    ) -> Result<VerifyReport, EngineError> {
        self.trackers.retain(|_, slot| slot.touched.elapsed() < TRACKER_TTL);

        let identity = guard.identity();
        let key = (identity.to_string(), action_id);
        if let Some(slot) = self.trackers.get(&key) {
            slot.tracker.ensure_open()?;
        }
        // Refuse unknown identities before touching the spool.
        if self.store.fetch(identity)?.is_none() {
            return Err(ProtocolError::NotEnrolled(identity.to_string()).into());
        }

        let mut frames = open_spool(&self.config, identity)?;
        let mut observer = guard.observer();
        let mut ctx = SessionContext::new(&mut frames, &mut self.oracle, &mut observer, guard.token());
        let outcome = Verifier::new(&self.config.protocol).attempt(identity, mode, &mut ctx, &self.store)?;

        let max_attempts = self.config.protocol.max_attempts;
        let slot = self.trackers.entry(key.clone()).or_insert_with(|| TrackerSlot {
            tracker: AttemptTracker::new(max_attempts),
            touched: Instant::now(),
        });
        slot.touched = Instant::now();
        let decision = slot.tracker.record(outcome);

        match &decision {
            Decision::Matched { attempt, similarity } => {
                tracing::info!(identity, action = %key.1, attempt, similarity, "verified");
                self.trackers.remove(&key);
            }
            Decision::Retry {
                attempt, reason, ..
            } => {
                tracing::info!(identity, action = %key.1, attempt, %reason, "attempt failed");
            }
            Decision::MaxAttemptsReached { attempts, reason, .. } => {
                tracing::warn!(identity, action = %key.1, attempts, %reason, "maximum attempts reached");
            }
        }

        Ok(VerifyReport {
            identity: key.0,
            action_id: key.1,
            decision,
        })
    }
}

/// Per-identity spool with stale frames from earlier sessions discarded.
fn open_spool(config: &Config, identity: &str) -> Result<SpoolFrameSource, ProtocolError> {
    let spool_config = SpoolConfig {
        wait_timeout: config.frame_timeout(),
        ..Default::default()
    };
    let mut source = SpoolFrameSource::open(config.spool_dir_for(identity)?, spool_config)?;
    source.drain()?;
    Ok(source)
}
