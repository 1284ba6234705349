use facegate_core::{
    AttemptOutcome, AttemptTracker, CancelToken, CaptureError, CaptureSession, Decision, Embedding,
    EmbeddingOracle, Enroller, Frame, FrameResult, FrameSource, MemoryTemplateStore, NoopObserver,
    OracleError, Pose, ProtocolConfig, ProtocolError, RetryReason, SessionContext, SessionObserver,
    SessionRegistry, StoreError, TemplateStore, TurnDirection, VerificationMode, Verifier,
};
use std::collections::VecDeque;

/// Endless camera; frames listed in `dark` are flagged dark.
#[derive(Default)]
struct FakeCamera {
    taken: u64,
    dark: Vec<u64>,
}

impl FrameSource for FakeCamera {
    fn next_frame(&mut self, cancel: &CancelToken) -> Result<Frame, CaptureError> {
        if cancel.is_cancelled() {
            return Err(CaptureError::Cancelled);
        }
        self.taken += 1;
        let mut frame = Frame::new(vec![self.taken as u8], 640, 480, self.taken);
        frame.is_dark = self.dark.contains(&self.taken);
        Ok(frame)
    }
}

/// Replays scripted service responses in order.
#[derive(Default)]
struct ScriptedOracle {
    script: VecDeque<Result<FrameResult, OracleError>>,
    calls: usize,
    hints: Vec<bool>,
}

impl ScriptedOracle {
    fn new(script: Vec<FrameResult>) -> Self {
        Self {
            script: script.into_iter().map(Ok).collect(),
            ..Default::default()
        }
    }
}

impl EmbeddingOracle for ScriptedOracle {
    fn process(&mut self, _image: &[u8], liveness_hint: bool) -> Result<FrameResult, OracleError> {
        self.calls += 1;
        self.hints.push(liveness_hint);
        self.script
            .pop_front()
            .unwrap_or_else(|| Err(OracleError::Unavailable("script exhausted".into())))
    }
}

struct FailingStore;

impl TemplateStore for FailingStore {
    fn save(&mut self, _identity: &str, _template: &Embedding) -> Result<(), StoreError> {
        Err(StoreError::Backend("database is locked".into()))
    }
    fn fetch(&self, _identity: &str) -> Result<Option<Embedding>, StoreError> {
        Ok(None)
    }
}

/// Cancels the session when a given pose starts.
struct CancelAt {
    pose: Pose,
    token: CancelToken,
}

impl SessionObserver for CancelAt {
    fn pose_started(&mut self, pose: Pose) {
        if pose == self.pose {
            self.token.cancel();
        }
    }
}

/// Cancels the session when the given head-turn prompt is shown.
struct CancelOnChallenge {
    direction: TurnDirection,
    token: CancelToken,
}

impl SessionObserver for CancelOnChallenge {
    fn challenge_issued(&mut self, direction: TurnDirection) {
        if direction == self.direction {
            self.token.cancel();
        }
    }
}

fn config() -> ProtocolConfig {
    ProtocolConfig {
        good_streak: 3,
        enrollment_quality_min: 0.35,
        embedding_dim: 3,
        throttle_ms: 0,
        ..Default::default()
    }
}

fn face(quality: f32, values: [f32; 3]) -> FrameResult {
    FrameResult::detected(quality, Embedding::new(values.to_vec()))
}

fn three_good(values: [f32; 3]) -> Vec<FrameResult> {
    vec![face(0.9, values), face(0.9, values), face(0.9, values)]
}

#[test]
fn streak_resets_and_last_good_frame_is_kept() {
    let mut session = CaptureSession::new(&config());
    let qualities = [0.5, 0.4, 0.1, 0.5, 0.5, 0.5];

    let mut accepted_at = None;
    for (i, q) in qualities.iter().enumerate() {
        let out = session.step(face(*q, [i as f32 + 1.0, 0.0, 0.0])).unwrap();
        if i == 2 {
            assert_eq!(out.streak, 0);
        }
        if out.accepted {
            accepted_at = Some(i + 1);
            break;
        }
    }

    assert_eq!(accepted_at, Some(6));
    assert_eq!(session.accepted()[0].0, Pose::Front);
    assert_eq!(session.accepted()[0].1.values, vec![6.0, 0.0, 0.0]);
    assert_eq!(session.active_pose(), Some(Pose::Left));
}

#[test]
fn pose_needs_streak_of_consecutive_good_frames() {
    // good, good, no-face, good, good, low, good, good, good
    let frames = vec![
        face(0.9, [1.0, 0.0, 0.0]),
        face(0.9, [1.0, 0.0, 0.0]),
        FrameResult::undetected(),
        face(0.9, [1.0, 0.0, 0.0]),
        face(0.9, [1.0, 0.0, 0.0]),
        face(0.2, [1.0, 0.0, 0.0]),
        face(0.9, [1.0, 0.0, 0.0]),
        face(0.9, [1.0, 0.0, 0.0]),
        face(0.9, [1.0, 0.0, 0.0]),
    ];
    let mut session = CaptureSession::new(&config());
    let accepted: Vec<bool> = frames
        .into_iter()
        .map(|f| session.step(f).unwrap().accepted)
        .collect();
    assert_eq!(accepted.iter().filter(|a| **a).count(), 1);
    assert!(accepted[8]);
}

#[test]
fn enrollment_averages_poses_and_round_trips_through_store() {
    let cfg = config();
    let registry = SessionRegistry::new();
    let mut script = vec![
        face(0.5, [9.0, 9.0, 9.0]),
        face(0.4, [9.0, 9.0, 9.0]),
        face(0.1, [9.0, 9.0, 9.0]),
        face(0.5, [9.0, 9.0, 9.0]),
        face(0.5, [9.0, 9.0, 9.0]),
        face(0.5, [1.0, 0.0, 0.0]),
    ];
    script.extend(three_good([0.0, 1.0, 0.0]));
    script.extend(three_good([0.0, 0.0, 1.0]));
    script.extend(three_good([1.0, 1.0, 1.0]));

    let mut camera = FakeCamera::default();
    let mut oracle = ScriptedOracle::new(script);
    let mut observer = NoopObserver;
    let cancel = CancelToken::new();
    let mut store = MemoryTemplateStore::new();

    let template = {
        let mut ctx = SessionContext::new(&mut camera, &mut oracle, &mut observer, &cancel);
        Enroller::new(&cfg, &registry)
            .enroll("alice", &mut ctx, &mut store)
            .unwrap()
    };

    assert_eq!(template.identity, "alice");
    assert_eq!(template.embedding.values, vec![0.5, 0.5, 0.5]);
    assert_eq!(store.fetch("alice").unwrap(), Some(template.embedding));
    assert_eq!(oracle.calls, 15);
    assert!(oracle.hints.iter().all(|h| !h));
    assert!(!registry.is_active("alice"));
}

#[test]
fn re_enrollment_replaces_template() {
    let cfg = ProtocolConfig {
        good_streak: 1,
        ..config()
    };
    let registry = SessionRegistry::new();
    let mut store = MemoryTemplateStore::new();
    store.save("alice", &Embedding::new(vec![5.0, 5.0, 5.0])).unwrap();

    let mut camera = FakeCamera::default();
    let mut oracle = ScriptedOracle::new(vec![face(0.9, [2.0, 0.0, 0.0]); 4]);
    let mut observer = NoopObserver;
    let cancel = CancelToken::new();
    let mut ctx = SessionContext::new(&mut camera, &mut oracle, &mut observer, &cancel);
    Enroller::new(&cfg, &registry)
        .enroll("alice", &mut ctx, &mut store)
        .unwrap();

    assert_eq!(store.fetch("alice").unwrap().unwrap().values, vec![2.0, 0.0, 0.0]);
}

#[test]
fn cancellation_discards_everything() {
    let cfg = config();
    let registry = SessionRegistry::new();
    let cancel = CancelToken::new();
    let mut camera = FakeCamera::default();
    let mut oracle = ScriptedOracle::new(three_good([1.0, 0.0, 0.0]));
    let mut observer = CancelAt {
        pose: Pose::Left,
        token: cancel.clone(),
    };
    let mut store = MemoryTemplateStore::new();

    let mut ctx = SessionContext::new(&mut camera, &mut oracle, &mut observer, &cancel);
    let err = Enroller::new(&cfg, &registry)
        .enroll("alice", &mut ctx, &mut store)
        .unwrap_err();

    assert_eq!(err, ProtocolError::Cancelled);
    assert!(store.is_empty());
    assert!(!registry.is_active("alice"));
}

#[test]
fn concurrent_enrollment_for_same_identity_is_refused() {
    let cfg = config();
    let registry = SessionRegistry::new();
    let _held = registry.acquire("alice").unwrap();

    let mut camera = FakeCamera::default();
    let mut oracle = ScriptedOracle::default();
    let mut observer = NoopObserver;
    let cancel = CancelToken::new();
    let mut store = MemoryTemplateStore::new();
    let mut ctx = SessionContext::new(&mut camera, &mut oracle, &mut observer, &cancel);

    let err = Enroller::new(&cfg, &registry)
        .enroll("alice", &mut ctx, &mut store)
        .unwrap_err();
    assert_eq!(err, ProtocolError::EnrollmentInProgress("alice".into()));
    assert_eq!(oracle.calls, 0);
}

#[test]
fn oracle_failure_propagates_unmasked() {
    let cfg = config();
    let registry = SessionRegistry::new();
    let mut camera = FakeCamera::default();
    let mut oracle = ScriptedOracle::new(vec![face(0.9, [1.0, 0.0, 0.0])]);
    oracle
        .script
        .push_back(Err(OracleError::Unavailable("connection refused".into())));
    let mut observer = NoopObserver;
    let cancel = CancelToken::new();
    let mut store = MemoryTemplateStore::new();
    let mut ctx = SessionContext::new(&mut camera, &mut oracle, &mut observer, &cancel);

    let err = Enroller::new(&cfg, &registry)
        .enroll("alice", &mut ctx, &mut store)
        .unwrap_err();
    assert_eq!(
        err,
        ProtocolError::Oracle(OracleError::Unavailable("connection refused".into()))
    );
    assert!(store.is_empty());
}

#[test]
fn store_write_failure_is_surfaced_verbatim() {
    let cfg = ProtocolConfig {
        good_streak: 1,
        ..config()
    };
    let registry = SessionRegistry::new();
    let mut camera = FakeCamera::default();
    let mut oracle = ScriptedOracle::new(vec![face(0.9, [1.0, 0.0, 0.0]); 4]);
    let mut observer = NoopObserver;
    let cancel = CancelToken::new();
    let mut ctx = SessionContext::new(&mut camera, &mut oracle, &mut observer, &cancel);

    let err = Enroller::new(&cfg, &registry)
        .enroll("alice", &mut ctx, &mut FailingStore)
        .unwrap_err();
    assert_eq!(err.to_string(), "template store: database is locked");
}

#[test]
fn dark_frames_reset_streak_without_service_call() {
    let cfg = ProtocolConfig {
        good_streak: 2,
        ..config()
    };
    let mut camera = FakeCamera {
        dark: vec![2],
        ..Default::default()
    };
    // Frame 2 is dark, so the service sees frames 1, 3, 4, ...
    let mut oracle = ScriptedOracle::new(vec![face(0.9, [1.0, 0.0, 0.0]); 9]);
    let mut observer = NoopObserver;
    let cancel = CancelToken::new();
    let mut ctx = SessionContext::new(&mut camera, &mut oracle, &mut observer, &cancel);

    let mut session = CaptureSession::new(&cfg);
    session.run(&mut ctx, &cfg).unwrap();

    // front: 1 good, dark reset, 2 good = 3 calls; 2 more for each remaining pose.
    assert_eq!(oracle.calls, 9);
    assert_eq!(camera.taken, 10);
}

fn verify(
    cfg: &ProtocolConfig,
    store: &MemoryTemplateStore,
    mode: VerificationMode,
    script: Vec<FrameResult>,
) -> (Result<AttemptOutcome, ProtocolError>, ScriptedOracle, u64) {
    let mut camera = FakeCamera::default();
    let mut oracle = ScriptedOracle::new(script);
    let mut observer = NoopObserver;
    let cancel = CancelToken::new();
    let result = {
        let mut ctx = SessionContext::new(&mut camera, &mut oracle, &mut observer, &cancel);
        Verifier::new(cfg).attempt("alice", mode, &mut ctx, store)
    };
    (result, oracle, camera.taken)
}

fn enrolled(values: [f32; 3]) -> MemoryTemplateStore {
    let mut store = MemoryTemplateStore::new();
    store.save("alice", &Embedding::new(values.to_vec())).unwrap();
    store
}

#[test]
fn identical_embedding_matches() {
    let cfg = config();
    let (result, _, _) = verify(
        &cfg,
        &enrolled([1.0, 0.0, 0.0]),
        VerificationMode::Simple,
        vec![face(0.9, [1.0, 0.0, 0.0])],
    );
    match result.unwrap() {
        AttemptOutcome::Matched { similarity } => assert!((similarity - 1.0).abs() < 1e-6),
        other => panic!("expected match, got {other:?}"),
    }
}

#[test]
fn orthogonal_embedding_is_retryable_mismatch() {
    let cfg = config();
    let (result, _, _) = verify(
        &cfg,
        &enrolled([1.0, 0.0, 0.0]),
        VerificationMode::Simple,
        vec![face(0.9, [0.0, 1.0, 0.0])],
    );
    assert_eq!(
        result.unwrap(),
        AttemptOutcome::Rejected {
            reason: RetryReason::DoesNotMatch,
            similarity: Some(0.0),
        }
    );
}

#[test]
fn verification_gates_quality_and_detection() {
    let cfg = config();
    let store = enrolled([1.0, 0.0, 0.0]);

    let (result, _, _) = verify(&cfg, &store, VerificationMode::Simple, vec![FrameResult::undetected()]);
    assert_eq!(
        result.unwrap(),
        AttemptOutcome::Rejected { reason: RetryReason::NoFaceDetected, similarity: None }
    );

    let (result, _, _) = verify(&cfg, &store, VerificationMode::Simple, vec![face(0.29, [1.0, 0.0, 0.0])]);
    assert_eq!(
        result.unwrap(),
        AttemptOutcome::Rejected { reason: RetryReason::QualityTooLow { quality: 0.29 }, similarity: None }
    );
}

#[test]
fn not_enrolled_fails_before_capturing() {
    let cfg = config();
    let (result, oracle, taken) = verify(
        &cfg,
        &MemoryTemplateStore::new(),
        VerificationMode::Simple,
        vec![face(0.9, [1.0, 0.0, 0.0])],
    );
    assert_eq!(result, Err(ProtocolError::NotEnrolled("alice".into())));
    assert_eq!(oracle.calls, 0);
    assert_eq!(taken, 0);
}

#[test]
fn liveness_left_turn_too_small_short_circuits() {
    let cfg = config();
    let (result, oracle, _) = verify(
        &cfg,
        &enrolled([1.0, 0.0, 0.0]),
        VerificationMode::Challenged,
        vec![
            face(0.9, [1.0, 0.0, 0.0]).with_offset(-0.02),
            face(0.9, [1.0, 0.0, 0.0]).with_offset(0.2),
        ],
    );
    assert_eq!(
        result.unwrap(),
        AttemptOutcome::Rejected {
            reason: RetryReason::TurnFurther { direction: TurnDirection::Left, offset: -0.02 },
            similarity: None,
        }
    );
    assert_eq!(oracle.calls, 1);
}

#[test]
fn liveness_compares_right_turn_frame() {
    let cfg = config();
    let store = enrolled([1.0, 0.0, 0.0]);

    // LEFT frame matches the template, RIGHT frame does not: must reject.
    let (result, oracle, _) = verify(
        &cfg,
        &store,
        VerificationMode::Challenged,
        vec![
            face(0.9, [1.0, 0.0, 0.0]).with_offset(-0.2),
            face(0.9, [0.0, 1.0, 0.0]).with_offset(0.2),
        ],
    );
    assert_eq!(
        result.unwrap(),
        AttemptOutcome::Rejected { reason: RetryReason::DoesNotMatch, similarity: Some(0.0) }
    );
    assert_eq!(oracle.hints, vec![true, true]);

    // And the reverse: RIGHT frame matches.
    let (result, _, _) = verify(
        &cfg,
        &store,
        VerificationMode::Challenged,
        vec![
            face(0.9, [0.0, 1.0, 0.0]).with_offset(-0.2),
            face(0.9, [1.0, 0.0, 0.0]).with_offset(0.2),
        ],
    );
    assert!(result.unwrap().is_match());
}

#[test]
fn liveness_right_turn_too_small() {
    let cfg = config();
    let (result, _, _) = verify(
        &cfg,
        &enrolled([1.0, 0.0, 0.0]),
        VerificationMode::Challenged,
        vec![
            face(0.9, [1.0, 0.0, 0.0]).with_offset(-0.2),
            face(0.9, [1.0, 0.0, 0.0]).with_offset(0.05),
        ],
    );
    assert_eq!(
        result.unwrap(),
        AttemptOutcome::Rejected {
            reason: RetryReason::TurnFurther { direction: TurnDirection::Right, offset: 0.05 },
            similarity: None,
        }
    );
}

#[test]
fn challenge_without_offset_signal_is_an_error() {
    let cfg = config();
    let (result, _, _) = verify(
        &cfg,
        &enrolled([1.0, 0.0, 0.0]),
        VerificationMode::Challenged,
        vec![face(0.9, [1.0, 0.0, 0.0])],
    );
    assert_eq!(result, Err(ProtocolError::LivenessUnavailable));
}

#[test]
fn stored_template_of_wrong_dimension_is_rejected() {
    let cfg = config();
    let mut store = MemoryTemplateStore::new();
    store.save("alice", &Embedding::new(vec![1.0; 128])).unwrap();
    let (result, _, _) = verify(&cfg, &store, VerificationMode::Simple, vec![face(0.9, [1.0, 0.0, 0.0])]);
    assert_eq!(result, Err(ProtocolError::DimensionMismatch { expected: 3, actual: 128 }));
}

#[test]
fn third_consecutive_failure_is_terminal() {
    let cfg = config();
    let store = enrolled([1.0, 0.0, 0.0]);
    let mut tracker = AttemptTracker::new(cfg.max_attempts);
    let mut decisions = Vec::new();

    for _ in 0..cfg.max_attempts {
        tracker.ensure_open().unwrap();
        let (result, _, _) = verify(&cfg, &store, VerificationMode::Simple, vec![face(0.9, [0.0, 1.0, 0.0])]);
        decisions.push(tracker.record(result.unwrap()));
    }

    assert!(matches!(decisions[1], Decision::Retry { attempt: 2, .. }));
    assert!(matches!(
        decisions[2],
        Decision::MaxAttemptsReached { attempts: 3, reason: RetryReason::DoesNotMatch, .. }
    ));
    assert_eq!(
        tracker.ensure_open(),
        Err(ProtocolError::MaxAttemptsReached { attempts: 3 })
    );
}

#[test]
fn cancel_between_challenge_frames_consumes_no_attempt() {
    let cfg = config();
    let store = enrolled([1.0, 0.0, 0.0]);
    let tracker = AttemptTracker::new(cfg.max_attempts);
    let cancel = CancelToken::new();
    let mut camera = FakeCamera::default();
    let mut oracle = ScriptedOracle::new(vec![
        face(0.9, [1.0, 0.0, 0.0]).with_offset(-0.2),
        face(0.9, [1.0, 0.0, 0.0]).with_offset(0.2),
    ]);
    let mut observer = CancelOnChallenge {
        direction: TurnDirection::Right,
        token: cancel.clone(),
    };

    let result = {
        let mut ctx = SessionContext::new(&mut camera, &mut oracle, &mut observer, &cancel);
        Verifier::new(&cfg).attempt("alice", VerificationMode::Challenged, &mut ctx, &store)
    };

    assert_eq!(result, Err(ProtocolError::Cancelled));
    // Only the LEFT frame reached the service.
    assert_eq!(oracle.calls, 1);
    assert_eq!(camera.taken, 1);
    // Nothing was recorded, so the next attempt is still the first.
    assert_eq!(tracker.next_attempt(), 1);
    assert_eq!(tracker.failures(), 0);
    assert!(tracker.ensure_open().is_ok());
}
