use chrono::Utc;
use rollcall_core::{
    AffectClassifier, AffectRequest, AffectToken, ClassifyError, Direction, Effect, EmotionLabel, FrameResult,
    Identity, RecognitionSession, SessionConfig, SessionError, SessionStatus, TimerToken,
};
use rollcall_store::{Enrollment, RecordStore, StoreError, StoredEvent, TherapistNote};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("engine must be spawned from within a tokio runtime")]
    NoRuntime,
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub session: SessionConfig,
    /// Classifier calls running longer than this resolve as a timeout.
    pub affect_timeout: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            affect_timeout: Duration::from_secs(8),
        }
    }
}

/// Messages sent to the engine thread.
///
/// The first group comes from D-Bus handlers and carries a reply channel.
/// `CooldownElapsed` and `AffectResolved` are posted back by tasks the
/// engine itself spawned.
enum EngineRequest {
    Frame {
        frame: Box<FrameResult>,
        reply: oneshot::Sender<SessionStatus>,
    },
    Commit {
        direction: Direction,
        reply: oneshot::Sender<Result<StoredEvent, EngineError>>,
    },
    Reset {
        reply: oneshot::Sender<SessionStatus>,
    },
    Status {
        reply: oneshot::Sender<SessionStatus>,
    },
    SetEmotionAnalysis {
        enabled: bool,
        reply: oneshot::Sender<SessionStatus>,
    },
    Enroll {
        enrollment: Enrollment,
        reply: oneshot::Sender<Result<Identity, EngineError>>,
    },
    AddNote {
        identity_id: String,
        author: String,
        text: String,
        reply: oneshot::Sender<Result<TherapistNote, EngineError>>,
    },
    ListEvents {
        identity_id: Option<String>,
        reply: oneshot::Sender<Result<Vec<StoredEvent>, EngineError>>,
    },
    CooldownElapsed(TimerToken),
    AffectResolved {
        token: AffectToken,
        result: Result<EmotionLabel, ClassifyError>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> EngineRequest) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Feed one detector result into the recognition session.
    pub async fn submit_frame(&self, frame: FrameResult) -> Result<SessionStatus, EngineError> {
        self.request(|reply| EngineRequest::Frame {
            frame: Box::new(frame),
            reply,
        })
        .await
    }

    /// Commit the recognized identity and append the event to the store.
    pub async fn commit(&self, direction: Direction) -> Result<StoredEvent, EngineError> {
        self.request(|reply| EngineRequest::Commit { direction, reply })
            .await?
    }

    pub async fn reset(&self) -> Result<SessionStatus, EngineError> {
        self.request(|reply| EngineRequest::Reset { reply }).await
    }

    pub async fn status(&self) -> Result<SessionStatus, EngineError> {
        self.request(|reply| EngineRequest::Status { reply }).await
    }

    pub async fn set_emotion_analysis(&self, enabled: bool) -> Result<SessionStatus, EngineError> {
        self.request(|reply| EngineRequest::SetEmotionAnalysis { enabled, reply })
            .await
    }

    pub async fn enroll(&self, enrollment: Enrollment) -> Result<Identity, EngineError> {
        self.request(|reply| EngineRequest::Enroll { enrollment, reply })
            .await?
    }

    pub async fn add_note(&self, identity_id: String, author: String, text: String) -> Result<TherapistNote, EngineError> {
        self.request(|reply| EngineRequest::AddNote {
            identity_id,
            author,
            text,
            reply,
        })
        .await?
    }

    pub async fn list_events(&self, identity_id: Option<String>) -> Result<Vec<StoredEvent>, EngineError> {
        self.request(|reply| EngineRequest::ListEvents { identity_id, reply })
            .await?
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The thread owns the store and the recognition session. Cooldown timers
/// and classifier calls run as tasks on the calling tokio runtime and post
/// their outcome back through the request channel. Must be called from
/// within a runtime.
pub fn spawn_engine<S, C>(settings: EngineSettings, store: S, classifier: C) -> Result<EngineHandle, EngineError>
where
    S: RecordStore + 'static,
    C: AffectClassifier,
{
    let runtime = Handle::try_current().map_err(|_| EngineError::NoRuntime)?;
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(32);

    let mut engine = Engine {
        session: RecognitionSession::new(settings.session),
        store,
        classifier: Arc::new(classifier),
        affect_timeout: settings.affect_timeout,
        runtime,
        loopback: tx.downgrade(),
        classify_task: None,
    };

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                engine.handle(req);
                engine.abort_stale_classification();
                engine.dispatch_effects();
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

struct Engine<S, C> {
    session: RecognitionSession,
    store: S,
    classifier: Arc<C>,
    affect_timeout: Duration,
    runtime: Handle,
    /// Weak so the thread exits once every `EngineHandle` is dropped.
    loopback: mpsc::WeakSender<EngineRequest>,
    /// Classifier call in progress, with the token it was issued under.
    classify_task: Option<(AffectToken, JoinHandle<()>)>,
}

impl<S: RecordStore, C: AffectClassifier> Engine<S, C> {
    fn handle(&mut self, req: EngineRequest) {
        match req {
            EngineRequest::Frame { frame, reply } => {
                self.on_frame(&frame);
                let _ = reply.send(self.session.status());
            }
            EngineRequest::Commit { direction, reply } => {
                let _ = reply.send(self.commit(direction));
            }
            EngineRequest::Reset { reply } => {
                self.session.reset();
                let _ = reply.send(self.session.status());
            }
            EngineRequest::Status { reply } => {
                let _ = reply.send(self.session.status());
            }
            EngineRequest::SetEmotionAnalysis { enabled, reply } => {
                self.session.set_emotion_analysis(enabled);
                let _ = reply.send(self.session.status());
            }
            EngineRequest::Enroll { enrollment, reply } => {
                let _ = reply.send(self.store.enroll(enrollment).map_err(EngineError::from));
            }
            EngineRequest::AddNote {
                identity_id,
                author,
                text,
                reply,
            } => {
                let result = self
                    .store
                    .add_therapist_note(&identity_id, &author, &text)
                    .map_err(EngineError::from);
                let _ = reply.send(result);
            }
            EngineRequest::ListEvents { identity_id, reply } => {
                let result = self
                    .store
                    .list_events(identity_id.as_deref())
                    .map_err(EngineError::from);
                let _ = reply.send(result);
            }
            EngineRequest::CooldownElapsed(token) => {
                self.session.on_cooldown_elapsed(token);
            }
            EngineRequest::AffectResolved { token, result } => {
                if self.session.on_affect_result(token, result) {
                    tracing::debug!(emotion = %self.session.emotion(), "affect label updated");
                }
            }
        }
    }

    fn on_frame(&mut self, frame: &FrameResult) {
        let gallery = if self.session.needs_gallery(frame) {
            self.store.list_enrolled().unwrap_or_else(|e| {
                tracing::warn!(error = %e, "failed to read enrolled templates; matching against none");
                Vec::new()
            })
        } else {
            Vec::new()
        };
        self.session.on_frame(frame, &gallery, Instant::now());
    }

    /// The session returns to idle even when the store rejects the event.
    fn commit(&mut self, direction: Direction) -> Result<StoredEvent, EngineError> {
        let event = self.session.commit(direction, Utc::now())?;
        self.store.append_event(&event).map_err(|e| {
            tracing::error!(error = %e, identity = %event.identity.id, "failed to store attendance event");
            EngineError::from(e)
        })
    }

    fn dispatch_effects(&mut self) {
        while let Some(effect) = self.session.poll_effect() {
            match effect {
                Effect::Transition { from, to } => {
                    tracing::debug!(%from, %to, generation = self.session.generation(), "phase transition");
                }
                Effect::Recognized { identity, similarity } => {
                    tracing::debug!(identity = %identity.id, similarity, "recognition latched until commit or reset");
                }
                Effect::ArmCooldown { token, after } => self.arm_cooldown(token, after),
                Effect::ClassifyAffect(request) => self.classify(request),
            }
        }
    }

    fn arm_cooldown(&self, token: TimerToken, after: Duration) {
        let loopback = self.loopback.clone();
        self.runtime.spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(tx) = loopback.upgrade() {
                let _ = tx.send(EngineRequest::CooldownElapsed(token)).await;
            }
        });
    }

    /// Abort the running classifier call once the session stops waiting for it,
    /// so a reset never leaves two external calls running at once.
    fn abort_stale_classification(&mut self) {
        let Some((token, _)) = &self.classify_task else {
            return;
        };
        if self.session.affect_in_flight() == Some(*token) {
            return;
        }
        if let Some((token, task)) = self.classify_task.take() {
            if !task.is_finished() {
                tracing::debug!(?token, "aborting superseded affect classification");
                task.abort();
            }
        }
    }

    fn classify(&mut self, request: AffectRequest) {
        let loopback = self.loopback.clone();
        let classifier = Arc::clone(&self.classifier);
        let limit = self.affect_timeout;
        let token = request.token;
        let task = self.runtime.spawn(async move {
            let result = match tokio::time::timeout(limit, classifier.classify(&request)).await {
                Ok(result) => result,
                Err(_) => Err(ClassifyError::Timeout),
            };
            if let Some(tx) = loopback.upgrade() {
                let _ = tx.send(EngineRequest::AffectResolved { token, result }).await;
            }
        });
        self.classify_task = Some((token, task));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::{
        AttendanceEvent, CaptureSnapshot, EnrolledTemplate, LandmarkPoint, LandmarkSet, PhaseKind, PixelFormat,
        VideoFrame,
    };
    use rollcall_store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedClassifier(EmotionLabel);

    impl AffectClassifier for FixedClassifier {
        async fn classify(&self, _request: &AffectRequest) -> Result<EmotionLabel, ClassifyError> {
            Ok(self.0)
        }
    }

    struct StalledClassifier;

    impl AffectClassifier for StalledClassifier {
        async fn classify(&self, _request: &AffectRequest) -> Result<EmotionLabel, ClassifyError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(EmotionLabel::HighArousal)
        }
    }

    /// Counts classifier calls still running; a call leaves the count when
    /// it completes or its task is dropped.
    struct TrackedClassifier {
        active: Arc<AtomicUsize>,
    }

    struct ActiveGuard(Arc<AtomicUsize>);

    impl Drop for ActiveGuard {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl AffectClassifier for TrackedClassifier {
        async fn classify(&self, _request: &AffectRequest) -> Result<EmotionLabel, ClassifyError> {
            self.active.fetch_add(1, Ordering::SeqCst);
            let _guard = ActiveGuard(Arc::clone(&self.active));
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(EmotionLabel::HighArousal)
        }
    }

    /// Delegates to a memory store, failing the reads or writes it is told to.
    #[derive(Default)]
    struct FailingStore {
        inner: MemoryStore,
        fail_list: bool,
        fail_append: bool,
    }

    impl RecordStore for FailingStore {
        fn enroll(&self, enrollment: Enrollment) -> Result<Identity, StoreError> {
            self.inner.enroll(enrollment)
        }

        fn list_enrolled(&self) -> Result<Vec<EnrolledTemplate>, StoreError> {
            if self.fail_list {
                return Err(StoreError::Corrupt("template table unreadable".into()));
            }
            self.inner.list_enrolled()
        }

        fn append_event(&self, event: &AttendanceEvent) -> Result<StoredEvent, StoreError> {
            if self.fail_append {
                return Err(StoreError::Corrupt("event log is read-only".into()));
            }
            self.inner.append_event(event)
        }

        fn list_events(&self, identity_id: Option<&str>) -> Result<Vec<StoredEvent>, StoreError> {
            self.inner.list_events(identity_id)
        }

        fn capture_for(&self, event_id: &str) -> Result<Option<CaptureSnapshot>, StoreError> {
            self.inner.capture_for(event_id)
        }

        fn add_therapist_note(&self, identity_id: &str, author: &str, text: &str) -> Result<TherapistNote, StoreError> {
            self.inner.add_therapist_note(identity_id, author, text)
        }

        fn notes_for(&self, identity_id: &str) -> Result<Vec<TherapistNote>, StoreError> {
            self.inner.notes_for(identity_id)
        }
    }

    fn face(values: [f32; 6]) -> LandmarkSet {
        LandmarkSet::new(vec![
            LandmarkPoint::new(values[0], values[1], values[2]),
            LandmarkPoint::new(values[3], values[4], values[5]),
        ])
    }

    fn alice() -> LandmarkSet {
        face([1.0, 0.0, 0.0, 0.0, 1.0, 0.0])
    }

    fn stranger() -> LandmarkSet {
        face([0.0, 0.0, 1.0, 1.0, 0.0, 0.0])
    }

    fn settings() -> EngineSettings {
        EngineSettings {
            session: SessionConfig {
                cooldown: Duration::from_millis(150),
                affect_interval: Duration::from_millis(10),
                ..SessionConfig::default()
            },
            affect_timeout: Duration::from_millis(50),
        }
    }

    async fn enroll_alice(engine: &EngineHandle) -> Identity {
        engine
            .enroll(Enrollment {
                name: "Alice".into(),
                class_group: Some("Turma A".into()),
                template: alice(),
            })
            .await
            .unwrap()
    }

    async fn wait_for(engine: &EngineHandle, pred: impl Fn(&SessionStatus) -> bool) -> SessionStatus {
        for _ in 0..100 {
            let status = engine.status().await.unwrap();
            if pred(&status) {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_recognize_and_commit() {
        let engine = spawn_engine(
            settings(),
            MemoryStore::default(),
            FixedClassifier(EmotionLabel::PositiveAffect),
        )
        .unwrap();
        let identity = enroll_alice(&engine).await;

        let status = engine.submit_frame(FrameResult::with_face(alice())).await.unwrap();
        assert_eq!(status.phase, PhaseKind::Recognized);
        assert_eq!(status.identity.as_ref(), Some(&identity));

        let status = wait_for(&engine, |s| s.emotion == EmotionLabel::PositiveAffect).await;
        assert_eq!(status.engagement_preview, 70);

        let stored = engine.commit(Direction::Arrival).await.unwrap();
        assert_eq!(stored.identity_id, identity.id);
        assert_eq!(stored.emotion, EmotionLabel::PositiveAffect);
        assert_eq!(stored.engagement, 70);

        let status = engine.status().await.unwrap();
        assert_eq!(status.phase, PhaseKind::Idle);
        assert_eq!(engine.list_events(None).await.unwrap().len(), 1);
        assert_eq!(engine.list_events(Some(identity.id)).await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_commit_without_recognition() {
        let engine = spawn_engine(settings(), MemoryStore::default(), FixedClassifier(EmotionLabel::Neutral)).unwrap();
        let err = engine.commit(Direction::Departure).await.unwrap_err();
        assert!(matches!(err, EngineError::Session(SessionError::NotRecognized(PhaseKind::Idle))));
        assert!(engine.list_events(None).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_rejected_face_cools_down() {
        let engine = spawn_engine(settings(), MemoryStore::default(), FixedClassifier(EmotionLabel::Neutral)).unwrap();
        enroll_alice(&engine).await;

        let status = engine.submit_frame(FrameResult::with_face(stranger())).await.unwrap();
        assert_eq!(status.phase, PhaseKind::Cooldown);

        // Same face during cooldown is not re-matched.
        let status = engine.submit_frame(FrameResult::with_face(alice())).await.unwrap();
        assert_eq!(status.phase, PhaseKind::Cooldown);

        wait_for(&engine, |s| s.phase == PhaseKind::Idle).await;
        let status = engine.submit_frame(FrameResult::with_face(alice())).await.unwrap();
        assert_eq!(status.phase, PhaseKind::Recognized);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_classifier_timeout_resolves_neutral() {
        let engine = spawn_engine(settings(), MemoryStore::default(), StalledClassifier).unwrap();
        enroll_alice(&engine).await;

        let status = engine.submit_frame(FrameResult::with_face(alice())).await.unwrap();
        assert_eq!(status.emotion, EmotionLabel::Analyzing);

        wait_for(&engine, |s| s.emotion == EmotionLabel::Neutral).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_reset_and_emotion_toggle() {
        let engine = spawn_engine(settings(), MemoryStore::default(), FixedClassifier(EmotionLabel::LowValence)).unwrap();
        enroll_alice(&engine).await;
        engine.submit_frame(FrameResult::with_face(alice())).await.unwrap();

        let status = engine.set_emotion_analysis(false).await.unwrap();
        assert!(!status.emotion_analysis);
        assert_eq!(status.emotion, EmotionLabel::Neutral);

        let status = engine.reset().await.unwrap();
        assert_eq!(status.phase, PhaseKind::Idle);
        assert!(status.identity.is_none());
        assert!(matches!(
            engine.commit(Direction::Arrival).await,
            Err(EngineError::Session(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_notes_require_enrolled_identity() {
        let engine = spawn_engine(settings(), MemoryStore::default(), FixedClassifier(EmotionLabel::Neutral)).unwrap();
        let identity = enroll_alice(&engine).await;

        let note = engine
            .add_note(identity.id.clone(), "Dr. Santos".into(), "calmer this week".into())
            .await
            .unwrap();
        assert_eq!(note.identity_id, identity.id);

        let err = engine
            .add_note("nobody".into(), "Dr. Santos".into(), "text".into())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Store(StoreError::NotFound(_))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unreadable_gallery_cools_down() {
        let store = FailingStore {
            fail_list: true,
            ..FailingStore::default()
        };
        let engine = spawn_engine(settings(), store, FixedClassifier(EmotionLabel::Neutral)).unwrap();
        enroll_alice(&engine).await;

        let status = engine.submit_frame(FrameResult::with_face(alice())).await.unwrap();
        assert_eq!(status.phase, PhaseKind::Cooldown);
        assert!(status.identity.is_none());

        wait_for(&engine, |s| s.phase == PhaseKind::Idle).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failed_append_still_resets() {
        let store = FailingStore {
            fail_append: true,
            ..FailingStore::default()
        };
        let engine = spawn_engine(settings(), store, FixedClassifier(EmotionLabel::Neutral)).unwrap();
        enroll_alice(&engine).await;

        let status = engine.submit_frame(FrameResult::with_face(alice())).await.unwrap();
        assert_eq!(status.phase, PhaseKind::Recognized);

        let err = engine.commit(Direction::Arrival).await.unwrap_err();
        assert!(matches!(err, EngineError::Store(StoreError::Corrupt(_))));

        let status = engine.status().await.unwrap();
        assert_eq!(status.phase, PhaseKind::Idle);
        assert!(status.identity.is_none());
        assert!(engine.list_events(None).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_reset_aborts_running_classification() {
        let active = Arc::new(AtomicUsize::new(0));
        let mut settings = settings();
        settings.affect_timeout = Duration::from_secs(30);
        let classifier = TrackedClassifier {
            active: Arc::clone(&active),
        };
        let engine = spawn_engine(settings, MemoryStore::default(), classifier).unwrap();
        enroll_alice(&engine).await;

        engine.submit_frame(FrameResult::with_face(alice())).await.unwrap();
        for _ in 0..100 {
            if active.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(active.load(Ordering::SeqCst), 1);

        engine.reset().await.unwrap();
        for _ in 0..100 {
            if active.load(Ordering::SeqCst) == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_oversized_frame_commits_without_image() {
        let engine = spawn_engine(settings(), MemoryStore::default(), FixedClassifier(EmotionLabel::Neutral)).unwrap();
        enroll_alice(&engine).await;

        let mut frame = FrameResult::with_face(alice());
        frame.frame = Some(VideoFrame {
            width: 1_431_693_603,
            height: 4_294_853_786,
            format: PixelFormat::Rgb8,
            data: vec![0; 64],
        });
        let status = engine.submit_frame(frame).await.unwrap();
        assert_eq!(status.phase, PhaseKind::Recognized);

        let stored = engine.commit(Direction::Arrival).await.unwrap();
        assert!(!stored.has_image);
        assert_eq!(engine.status().await.unwrap().phase, PhaseKind::Idle);
    }
}
