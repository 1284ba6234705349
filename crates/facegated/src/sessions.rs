//! Sessions in flight: cancel tokens and progress, shared between the D-Bus
//! handlers and the engine thread.

use facegate_core::{CancelToken, FrameVerdict, Pose, SessionObserver, TurnDirection};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Enroll,
    Verify,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionProgress {
    pub identity: String,
    pub kind: SessionKind,
    pub pose: Option<Pose>,
    pub streak: u32,
    pub accepted: Vec<Pose>,
    pub frames: u32,
    pub last_verdict: Option<FrameVerdict>,
    pub challenge: Option<TurnDirection>,
    pub cancelled: bool,
}

struct Entry {
    token: CancelToken,
    progress: SessionProgress,
}

/// One session per identity, enrollment or verification.
#[derive(Clone, Default)]
pub struct SessionTable {
    inner: Arc<Mutex<HashMap<String, Entry>>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session for `identity`. `None` if one is already queued or running.
    pub fn begin(&self, identity: &str, kind: SessionKind) -> Option<SessionGuard> {
        let mut map = lock(&self.inner);
        if map.contains_key(identity) {
            return None;
        }
        let token = CancelToken::new();
        map.insert(
            identity.to_string(),
            Entry {
                token: token.clone(),
                progress: SessionProgress {
                    identity: identity.to_string(),
                    kind,
                    pose: None,
                    streak: 0,
                    accepted: Vec::new(),
                    frames: 0,
                    last_verdict: None,
                    challenge: None,
                    cancelled: false,
                },
            },
        );
        Some(SessionGuard {
            table: self.clone(),
            identity: identity.to_string(),
            token,
        })
    }

    /// Fire the cancel token of `identity`'s session. `false` if none is in flight.
    pub fn cancel(&self, identity: &str) -> bool {
        let mut map = lock(&self.inner);
        match map.get_mut(identity) {
            Some(entry) => {
                entry.token.cancel();
                entry.progress.cancelled = true;
                true
            }
            None => false,
        }
    }

    pub fn snapshot(&self) -> Vec<SessionProgress> {
        let mut list: Vec<_> = lock(&self.inner)
            .values()
            .map(|e| e.progress.clone())
            .collect();
        list.sort_by(|a, b| a.identity.cmp(&b.identity));
        list
    }

    fn update(&self, identity: &str, f: impl FnOnce(&mut SessionProgress)) {
        if let Some(entry) = lock(&self.inner).get_mut(identity) {
            f(&mut entry.progress);
        }
    }
}

/// Owns a row in the table for as long as the session is queued or running.
pub struct SessionGuard {
    table: SessionTable,
    identity: String,
    token: CancelToken,
}

impl SessionGuard {
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    pub fn observer(&self) -> ProgressObserver {
        ProgressObserver {
            table: self.table.clone(),
            identity: self.identity.clone(),
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        lock(&self.table.inner).remove(&self.identity);
    }
}

/// Mirrors session callbacks into the table and the log.
pub struct ProgressObserver {
    table: SessionTable,
    identity: String,
}

impl SessionObserver for ProgressObserver {
    fn pose_started(&mut self, pose: Pose) {
        tracing::debug!(identity = %self.identity, %pose, "pose started");
        self.table.update(&self.identity, |p| {
            p.pose = Some(pose);
            p.streak = 0;
        });
    }

    fn frame_classified(&mut self, pose: Pose, verdict: &FrameVerdict, streak: u32) {
        tracing::debug!(identity = %self.identity, %pose, ?verdict, streak, "frame");
        let verdict = *verdict;
        self.table.update(&self.identity, |p| {
            p.pose = Some(pose);
            p.streak = streak;
            p.frames += 1;
            p.last_verdict = Some(verdict);
        });
    }

    fn pose_accepted(&mut self, pose: Pose) {
        tracing::debug!(identity = %self.identity, %pose, "pose accepted");
        self.table.update(&self.identity, |p| p.accepted.push(pose));
    }

    fn challenge_issued(&mut self, direction: TurnDirection) {
        tracing::info!(identity = %self.identity, %direction, "turn your head {direction}");
        self.table.update(&self.identity, |p| p.challenge = Some(direction));
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
