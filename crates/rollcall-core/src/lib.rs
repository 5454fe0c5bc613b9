//! rollcall-core — Landmark template matching and streaming recognition.
//!
//! Compares facial landmark geometry against enrolled templates by cosine
//! similarity and debounces a live stream of detector results into at most
//! one recognition per presentation.

pub mod affect;
pub mod engagement;
pub mod matcher;
pub mod session;
pub mod snapshot;
pub mod types;

pub use affect::{AffectClassifier, AffectRequest, AffectToken, ClassifyError, DEFAULT_AFFECT_INTERVAL};
pub use engagement::{engagement_index, modifier_for_label, EmotionLabel, COMMIT_ENGAGEMENT_BASE};
pub use matcher::{CosineMatcher, MatchResult, Matcher, RejectReason, SIMILARITY_THRESHOLD};
pub use session::{
    AttendanceEvent, Effect, PhaseKind, RecognitionSession, SessionConfig, SessionError, SessionStatus,
    TimerToken, DEFAULT_COOLDOWN,
};
pub use snapshot::{
    CaptureSnapshot, PixelFormat, Snapshotter, StillImage, VideoFrame, DEFAULT_JPEG_QUALITY,
    MAX_FRAME_DIMENSION,
};
pub use types::{
    Direction, EnrolledTemplate, FeatureVector, FrameResult, Identity, LandmarkPoint, LandmarkSet, NamedScore,
    ScoreError,
};
