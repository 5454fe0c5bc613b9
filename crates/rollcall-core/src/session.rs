//! Streaming recognition session.
//!
//! Turns a stream of per-frame detector results into at most one
//! recognition per presentation:
//!
//! ```text
//! Idle --face--> FaceDetected --match--> Recognized (latched until commit/reset)
//!                     |
//!                     +--no match--> Cooldown --timer / face lost--> Idle
//! ```
//!
//! The session does no I/O. Timers and classifier calls are requested as
//! [`Effect`]s and their outcomes are fed back in with the token they were
//! issued under. Returning to `Idle` bumps the session generation, which
//! turns every outstanding token stale.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::affect::{AffectRefresh, AffectRequest, AffectToken, ClassifyError, DEFAULT_AFFECT_INTERVAL};
use crate::engagement::{engagement_index, EmotionLabel, COMMIT_ENGAGEMENT_BASE};
use crate::matcher::{CosineMatcher, Matcher, SIMILARITY_THRESHOLD};
use crate::snapshot::{CaptureSnapshot, Snapshotter, DEFAULT_JPEG_QUALITY};
use crate::types::{Direction, EnrolledTemplate, FrameResult, Identity, LandmarkSet};

/// How long a rejected presentation blocks re-matching.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(2);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("no recognized identity to commit (phase: {0})")]
    NotRecognized(PhaseKind),
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub similarity_threshold: f32,
    pub cooldown: Duration,
    pub affect_enabled: bool,
    pub affect_interval: Duration,
    /// Baseline the engagement index is computed from at commit.
    pub engagement_base: i32,
    pub jpeg_quality: u8,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: SIMILARITY_THRESHOLD,
            cooldown: DEFAULT_COOLDOWN,
            affect_enabled: true,
            affect_interval: DEFAULT_AFFECT_INTERVAL,
            engagement_base: COMMIT_ENGAGEMENT_BASE,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

/// Observable phase of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseKind {
    Idle,
    FaceDetected,
    Recognized,
    Cooldown,
}

impl fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PhaseKind::Idle => "idle",
            PhaseKind::FaceDetected => "face_detected",
            PhaseKind::Recognized => "recognized",
            PhaseKind::Cooldown => "cooldown",
        })
    }
}

/// Identifies one armed cooldown timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken {
    pub generation: u64,
    pub seq: u64,
}

/// The latched outcome of a successful match.
#[derive(Debug, Clone)]
pub struct Recognition {
    pub identity: Identity,
    pub similarity: f32,
    pub snapshot: CaptureSnapshot,
}

#[derive(Debug)]
enum Phase {
    Idle,
    FaceDetected,
    Recognized(Box<Recognition>),
    Cooldown(TimerToken),
}

impl Phase {
    fn kind(&self) -> PhaseKind {
        match self {
            Phase::Idle => PhaseKind::Idle,
            Phase::FaceDetected => PhaseKind::FaceDetected,
            Phase::Recognized(_) => PhaseKind::Recognized,
            Phase::Cooldown(_) => PhaseKind::Cooldown,
        }
    }
}

/// Work the driver must carry out on the session's behalf.
#[derive(Debug, Clone)]
pub enum Effect {
    Transition { from: PhaseKind, to: PhaseKind },
    Recognized { identity: Identity, similarity: f32 },
    /// Call [`RecognitionSession::on_cooldown_elapsed`] with `token` after `after`.
    ArmCooldown { token: TimerToken, after: Duration },
    /// Run the classifier and report through [`RecognitionSession::on_affect_result`].
    ClassifyAffect(AffectRequest),
}

/// Snapshot of the observable session state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStatus {
    pub phase: PhaseKind,
    pub identity: Option<Identity>,
    pub similarity: Option<f32>,
    pub emotion: EmotionLabel,
    pub engagement_preview: u8,
    pub emotion_analysis: bool,
    pub generation: u64,
}

/// An attendance record produced by committing a recognized session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttendanceEvent {
    pub identity: Identity,
    pub direction: Direction,
    pub timestamp: DateTime<Utc>,
    pub emotion: EmotionLabel,
    pub engagement: u8,
    pub similarity: f32,
    pub capture: CaptureSnapshot,
}

pub struct RecognitionSession<M = CosineMatcher> {
    config: SessionConfig,
    matcher: M,
    snapshotter: Snapshotter,
    phase: Phase,
    generation: u64,
    next_timer_seq: u64,
    affect: AffectRefresh,
    effects: VecDeque<Effect>,
}

impl RecognitionSession<CosineMatcher> {
    pub fn new(config: SessionConfig) -> Self {
        Self::with_matcher(config, CosineMatcher)
    }
}

impl<M: Matcher> RecognitionSession<M> {
    pub fn with_matcher(config: SessionConfig, matcher: M) -> Self {
        let affect = AffectRefresh::new(config.affect_enabled, config.affect_interval);
        let snapshotter = Snapshotter::new(config.jpeg_quality);
        Self {
            config,
            matcher,
            snapshotter,
            phase: Phase::Idle,
            generation: 0,
            next_timer_seq: 0,
            affect,
            effects: VecDeque::new(),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn matcher(&self) -> &M {
        &self.matcher
    }

    pub fn phase(&self) -> PhaseKind {
        self.phase.kind()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn recognition(&self) -> Option<&Recognition> {
        match &self.phase {
            Phase::Recognized(r) => Some(r),
            _ => None,
        }
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.recognition().map(|r| &r.identity)
    }

    pub fn snapshot(&self) -> Option<&CaptureSnapshot> {
        self.recognition().map(|r| &r.snapshot)
    }

    pub fn emotion(&self) -> EmotionLabel {
        self.affect.label()
    }

    /// Token of the classifier request still awaiting a result.
    pub fn affect_in_flight(&self) -> Option<AffectToken> {
        self.affect.in_flight()
    }

    /// Engagement index a commit would record right now.
    pub fn engagement_preview(&self) -> u8 {
        engagement_index(self.config.engagement_base, self.affect.label())
    }

    pub fn status(&self) -> SessionStatus {
        let recognition = self.recognition();
        SessionStatus {
            phase: self.phase(),
            identity: recognition.map(|r| r.identity.clone()),
            similarity: recognition.map(|r| r.similarity),
            emotion: self.emotion(),
            engagement_preview: self.engagement_preview(),
            emotion_analysis: self.affect.is_enabled(),
            generation: self.generation,
        }
    }

    /// Whether `on_frame` will run the matcher for this frame.
    ///
    /// Lets the driver skip reading the enrolled set for frames that cannot match.
    pub fn needs_gallery(&self, frame: &FrameResult) -> bool {
        frame.face().is_some() && matches!(self.phase, Phase::Idle | Phase::FaceDetected)
    }

    /// Process one detector result.
    ///
    /// `gallery` is only consulted when [`needs_gallery`](Self::needs_gallery)
    /// is true; pass an empty slice otherwise.
    pub fn on_frame(&mut self, frame: &FrameResult, gallery: &[EnrolledTemplate], now: Instant) {
        let Some(landmarks) = frame.face() else {
            match self.phase {
                Phase::Idle | Phase::Recognized(_) => {}
                Phase::FaceDetected | Phase::Cooldown(_) => {
                    tracing::debug!(generation = self.generation, "face lost");
                    self.return_to_idle();
                }
            }
            return;
        };

        if let Some(request) =
            self.affect
                .poll(self.generation, landmarks, frame.coefficients.as_deref(), now)
        {
            self.effects.push_back(Effect::ClassifyAffect(request));
        }

        match self.phase {
            Phase::Idle | Phase::FaceDetected => self.evaluate(frame, landmarks, gallery),
            Phase::Recognized(_) | Phase::Cooldown(_) => {}
        }
    }

    /// Cooldown timer callback. Returns false for a stale token.
    pub fn on_cooldown_elapsed(&mut self, token: TimerToken) -> bool {
        match self.phase {
            Phase::Cooldown(armed) if armed == token => {
                self.return_to_idle();
                true
            }
            _ => {
                tracing::debug!(?token, generation = self.generation, "ignoring stale cooldown timer");
                false
            }
        }
    }

    /// Classifier callback. Returns false for a stale token.
    pub fn on_affect_result(&mut self, token: AffectToken, result: Result<EmotionLabel, ClassifyError>) -> bool {
        self.affect.complete(token, result)
    }

    pub fn set_emotion_analysis(&mut self, enabled: bool) {
        tracing::info!(enabled, "emotion analysis toggled");
        self.affect.set_enabled(enabled);
    }

    /// Turn the latched recognition into an attendance event and end the session.
    pub fn commit(&mut self, direction: Direction, timestamp: DateTime<Utc>) -> Result<AttendanceEvent, SessionError> {
        let recognition = match &self.phase {
            Phase::Recognized(r) => r.as_ref().clone(),
            other => return Err(SessionError::NotRecognized(other.kind())),
        };

        let emotion = self.affect.label();
        let event = AttendanceEvent {
            identity: recognition.identity,
            direction,
            timestamp,
            emotion,
            engagement: engagement_index(self.config.engagement_base, emotion),
            similarity: recognition.similarity,
            capture: recognition.snapshot,
        };

        tracing::info!(
            identity = %event.identity.id,
            direction = %event.direction,
            emotion = %event.emotion,
            engagement = event.engagement,
            "attendance committed"
        );

        self.return_to_idle();
        Ok(event)
    }

    /// Force the session back to idle, discarding any latch, timer or pending classification.
    pub fn reset(&mut self) {
        tracing::debug!(from = %self.phase(), generation = self.generation, "session reset");
        self.return_to_idle();
    }

    pub fn poll_effect(&mut self) -> Option<Effect> {
        self.effects.pop_front()
    }

    pub fn drain_effects(&mut self) -> impl Iterator<Item = Effect> + '_ {
        self.effects.drain(..)
    }

    fn evaluate(&mut self, frame: &FrameResult, landmarks: &LandmarkSet, gallery: &[EnrolledTemplate]) {
        self.set_phase(Phase::FaceDetected);

        let result = self
            .matcher
            .compare(landmarks, gallery, self.config.similarity_threshold);

        match result.accepted() {
            Some((identity, similarity)) => {
                let identity = identity.clone();
                let snapshot = self.snapshotter.capture(
                    frame.frame.as_ref(),
                    landmarks,
                    frame.coefficients.as_deref(),
                );
                tracing::info!(
                    identity = %identity.id,
                    name = %identity.name,
                    similarity,
                    "identity recognized"
                );
                self.set_phase(Phase::Recognized(Box::new(Recognition {
                    identity: identity.clone(),
                    similarity,
                    snapshot,
                })));
                self.effects.push_back(Effect::Recognized { identity, similarity });
            }
            None => {
                tracing::debug!(
                    similarity = result.similarity,
                    eligible = result.eligible,
                    reason = ?result.reject_reason(),
                    "probe rejected"
                );
                let token = TimerToken {
                    generation: self.generation,
                    seq: self.next_timer_seq,
                };
                self.next_timer_seq += 1;
                self.set_phase(Phase::Cooldown(token));
                self.effects.push_back(Effect::ArmCooldown {
                    token,
                    after: self.config.cooldown,
                });
            }
        }
    }

    fn return_to_idle(&mut self) {
        self.generation += 1;
        self.affect.cancel();
        self.set_phase(Phase::Idle);
    }

    fn set_phase(&mut self, to: Phase) {
        let from = self.phase.kind();
        let to_kind = to.kind();
        self.phase = to;
        if from != to_kind {
            tracing::debug!(%from, to = %to_kind, generation = self.generation, "session transition");
            self.effects.push_back(Effect::Transition { from, to: to_kind });
        }
    }
}
