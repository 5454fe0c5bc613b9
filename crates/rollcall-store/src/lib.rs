//! rollcall-store — Record store for enrolled templates and the attendance log.
//!
//! The recognition engine only sees the [`RecordStore`] trait. Two
//! implementations ship: [`MemoryStore`] for tests and demos, and
//! [`SqliteStore`] for a persistent deployment.

pub mod memory;
pub mod schedule;
pub mod sqlite;

use chrono::{DateTime, Utc};
use rollcall_core::{AttendanceEvent, CaptureSnapshot, Direction, EmotionLabel, EnrolledTemplate, Identity, LandmarkSet};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use memory::MemoryStore;
pub use schedule::{AcademicContext, Period, Schedule, ScheduleSlot};
pub use sqlite::SqliteStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sql(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error("store lock poisoned")]
    Poisoned,
}

/// A new identity to register.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Enrollment {
    pub name: String,
    #[serde(default)]
    pub class_group: Option<String>,
    /// May be empty to register without biometrics.
    #[serde(default)]
    pub template: LandmarkSet,
}

/// An attendance event as recorded in the log, without the raw capture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub id: String,
    pub identity_id: String,
    pub identity_name: String,
    pub direction: Direction,
    pub timestamp: DateTime<Utc>,
    pub emotion: EmotionLabel,
    pub engagement: u8,
    pub similarity: f32,
    pub subject: String,
    pub period: Period,
    pub has_image: bool,
}

impl StoredEvent {
    fn from_event(id: String, event: &AttendanceEvent, context: AcademicContext) -> Self {
        Self {
            id,
            identity_id: event.identity.id.clone(),
            identity_name: event.identity.name.clone(),
            direction: event.direction,
            timestamp: event.timestamp,
            emotion: event.emotion,
            engagement: event.engagement,
            similarity: event.similarity,
            subject: context.subject,
            period: context.period,
            has_image: event.capture.image.is_some(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TherapistNote {
    pub id: String,
    pub identity_id: String,
    pub author: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

/// Persistence contract consumed by the recognition engine.
///
/// `list_enrolled` returns records in enrollment order; the matcher's
/// tie-break depends on it.
pub trait RecordStore: Send {
    fn enroll(&self, enrollment: Enrollment) -> Result<Identity, StoreError>;

    fn list_enrolled(&self) -> Result<Vec<EnrolledTemplate>, StoreError>;

    fn append_event(&self, event: &AttendanceEvent) -> Result<StoredEvent, StoreError>;

    /// Events in insertion order, optionally for one identity.
    fn list_events(&self, identity_id: Option<&str>) -> Result<Vec<StoredEvent>, StoreError>;

    fn capture_for(&self, event_id: &str) -> Result<Option<CaptureSnapshot>, StoreError>;

    fn add_therapist_note(&self, identity_id: &str, author: &str, text: &str) -> Result<TherapistNote, StoreError>;

    fn notes_for(&self, identity_id: &str) -> Result<Vec<TherapistNote>, StoreError>;
}

impl<S: RecordStore + ?Sized> RecordStore for Box<S> {
    fn enroll(&self, enrollment: Enrollment) -> Result<Identity, StoreError> {
        (**self).enroll(enrollment)
    }

    fn list_enrolled(&self) -> Result<Vec<EnrolledTemplate>, StoreError> {
        (**self).list_enrolled()
    }

    fn append_event(&self, event: &AttendanceEvent) -> Result<StoredEvent, StoreError> {
        (**self).append_event(event)
    }

    fn list_events(&self, identity_id: Option<&str>) -> Result<Vec<StoredEvent>, StoreError> {
        (**self).list_events(identity_id)
    }

    fn capture_for(&self, event_id: &str) -> Result<Option<CaptureSnapshot>, StoreError> {
        (**self).capture_for(event_id)
    }

    fn add_therapist_note(&self, identity_id: &str, author: &str, text: &str) -> Result<TherapistNote, StoreError> {
        (**self).add_therapist_note(identity_id, author, text)
    }

    fn notes_for(&self, identity_id: &str) -> Result<Vec<TherapistNote>, StoreError> {
        (**self).notes_for(identity_id)
    }
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
