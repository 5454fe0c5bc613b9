//! SQLite-backed record store.

use chrono::{DateTime, Utc};
use rollcall_core::{
    AttendanceEvent, CaptureSnapshot, Direction, EmotionLabel, EnrolledTemplate, Identity, LandmarkSet, NamedScore,
    StillImage,
};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

use crate::{new_id, Enrollment, Period, RecordStore, Schedule, StoreError, StoredEvent, TherapistNote};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS identities (
    id          TEXT PRIMARY KEY,
    name        TEXT NOT NULL,
    class_group TEXT,
    template    TEXT NOT NULL,
    enrolled_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS attendance_events (
    id                   TEXT PRIMARY KEY,
    identity_id          TEXT NOT NULL REFERENCES identities(id),
    identity_name        TEXT NOT NULL,
    direction            TEXT NOT NULL,
    timestamp            TEXT NOT NULL,
    emotion              TEXT NOT NULL,
    engagement           INTEGER NOT NULL,
    similarity           REAL NOT NULL,
    subject              TEXT NOT NULL,
    period               TEXT NOT NULL,
    capture_jpeg         BLOB,
    capture_width        INTEGER,
    capture_height       INTEGER,
    capture_landmarks    TEXT NOT NULL,
    capture_coefficients TEXT,
    captured_at          TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_events_identity ON attendance_events(identity_id);

CREATE TABLE IF NOT EXISTS therapist_notes (
    id          TEXT PRIMARY KEY,
    identity_id TEXT NOT NULL REFERENCES identities(id),
    author      TEXT NOT NULL,
    text        TEXT NOT NULL,
    created_at  TEXT NOT NULL
);
";

const EVENT_COLUMNS: &str = "id, identity_id, identity_name, direction, timestamp, emotion, engagement, \
                             similarity, subject, period, capture_jpeg IS NOT NULL";

pub struct SqliteStore {
    conn: Connection,
    schedule: Schedule,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(path: P, schedule: Schedule) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let mode: String = conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        tracing::debug!(journal_mode = %mode, "sqlite store opened");
        Self::init(conn, schedule)
    }

    pub fn open_in_memory(schedule: Schedule) -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?, schedule)
    }

    fn init(conn: Connection, schedule: Schedule) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn, schedule })
    }

    fn class_group_of(&self, identity_id: &str) -> Result<Option<String>, StoreError> {
        self.conn
            .query_row(
                "SELECT class_group FROM identities WHERE id = ?1",
                params![identity_id],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("identity {identity_id}")))
    }
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp {raw:?}: {e}")))
}

type EventRow = (String, String, String, String, String, String, u8, f64, String, String, bool);

fn event_from_row(row: EventRow) -> Result<StoredEvent, StoreError> {
    let (id, identity_id, identity_name, direction, timestamp, emotion, engagement, similarity, subject, period, has_image) =
        row;
    Ok(StoredEvent {
        direction: direction
            .parse::<Direction>()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?,
        timestamp: parse_time(&timestamp)?,
        emotion: EmotionLabel::parse(&emotion)
            .ok_or_else(|| StoreError::Corrupt(format!("emotion {emotion:?}")))?,
        period: period.parse::<Period>().map_err(StoreError::Corrupt)?,
        id,
        identity_id,
        identity_name,
        engagement,
        similarity: similarity as f32,
        subject,
        has_image,
    })
}

impl RecordStore for SqliteStore {
    fn enroll(&self, enrollment: Enrollment) -> Result<Identity, StoreError> {
        let identity = Identity {
            id: new_id(),
            name: enrollment.name,
            class_group: enrollment.class_group,
        };
        self.conn.execute(
            "INSERT INTO identities (id, name, class_group, template, enrolled_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                identity.id,
                identity.name,
                identity.class_group,
                serde_json::to_string(&enrollment.template)?,
                Utc::now().to_rfc3339(),
            ],
        )?;
        tracing::info!(identity = %identity.id, name = %identity.name, points = enrollment.template.len(), "identity enrolled");
        Ok(identity)
    }

    fn list_enrolled(&self) -> Result<Vec<EnrolledTemplate>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, class_group, template, enrolled_at FROM identities ORDER BY rowid")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut enrolled = Vec::new();
        for row in rows {
            let (id, name, class_group, template, enrolled_at) = row?;
            enrolled.push(EnrolledTemplate {
                identity: Identity { id, name, class_group },
                template: serde_json::from_str::<LandmarkSet>(&template)?,
                enrolled_at: parse_time(&enrolled_at)?,
            });
        }
        Ok(enrolled)
    }

    fn append_event(&self, event: &AttendanceEvent) -> Result<StoredEvent, StoreError> {
        let class_group = self.class_group_of(&event.identity.id)?;
        let context = self.schedule.context_for(class_group.as_deref(), event.timestamp);
        let stored = StoredEvent::from_event(new_id(), event, context);

        let capture = &event.capture;
        let coefficients = capture
            .coefficients
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        self.conn.execute(
            "INSERT INTO attendance_events (
                id, identity_id, identity_name, direction, timestamp, emotion, engagement, similarity,
                subject, period, capture_jpeg, capture_width, capture_height, capture_landmarks,
                capture_coefficients, captured_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                stored.id,
                stored.identity_id,
                stored.identity_name,
                stored.direction.as_str(),
                stored.timestamp.to_rfc3339(),
                stored.emotion.as_str(),
                stored.engagement,
                f64::from(stored.similarity),
                stored.subject,
                stored.period.as_str(),
                capture.image.as_ref().map(|i| i.jpeg.as_slice()),
                capture.image.as_ref().map(|i| i.width),
                capture.image.as_ref().map(|i| i.height),
                serde_json::to_string(&capture.landmarks)?,
                coefficients,
                capture.captured_at.to_rfc3339(),
            ],
        )?;

        tracing::debug!(event = %stored.id, subject = %stored.subject, period = %stored.period, "attendance event stored");
        Ok(stored)
    }

    fn list_events(&self, identity_id: Option<&str>) -> Result<Vec<StoredEvent>, StoreError> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM attendance_events \
             WHERE (?1 IS NULL OR identity_id = ?1) ORDER BY rowid"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![identity_id], |row| -> rusqlite::Result<EventRow> {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
                row.get(6)?,
                row.get(7)?,
                row.get(8)?,
                row.get(9)?,
                row.get(10)?,
            ))
        })?;

        let mut events = Vec::new();
        for row in rows {
            events.push(event_from_row(row?)?);
        }
        Ok(events)
    }

    fn capture_for(&self, event_id: &str) -> Result<Option<CaptureSnapshot>, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT capture_jpeg, capture_width, capture_height, capture_landmarks,
                        capture_coefficients, captured_at
                 FROM attendance_events WHERE id = ?1",
                params![event_id],
                |row| {
                    Ok((
                        row.get::<_, Option<Vec<u8>>>(0)?,
                        row.get::<_, Option<u32>>(1)?,
                        row.get::<_, Option<u32>>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()?;

        let Some((jpeg, width, height, landmarks, coefficients, captured_at)) = row else {
            return Ok(None);
        };

        let image = match (jpeg, width, height) {
            (Some(jpeg), Some(width), Some(height)) => Some(StillImage { width, height, jpeg }),
            _ => None,
        };
        let coefficients = coefficients
            .map(|raw| serde_json::from_str::<Vec<NamedScore>>(&raw))
            .transpose()?;

        Ok(Some(CaptureSnapshot {
            image,
            landmarks: serde_json::from_str(&landmarks)?,
            coefficients,
            captured_at: parse_time(&captured_at)?,
        }))
    }

    fn add_therapist_note(&self, identity_id: &str, author: &str, text: &str) -> Result<TherapistNote, StoreError> {
        self.class_group_of(identity_id)?;
        let note = TherapistNote {
            id: new_id(),
            identity_id: identity_id.to_string(),
            author: author.to_string(),
            text: text.to_string(),
            created_at: Utc::now(),
        };
        self.conn.execute(
            "INSERT INTO therapist_notes (id, identity_id, author, text, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![note.id, note.identity_id, note.author, note.text, note.created_at.to_rfc3339()],
        )?;
        Ok(note)
    }

    fn notes_for(&self, identity_id: &str) -> Result<Vec<TherapistNote>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, identity_id, author, text, created_at FROM therapist_notes
             WHERE identity_id = ?1 ORDER BY rowid",
        )?;
        let rows = stmt.query_map(params![identity_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut notes = Vec::new();
        for row in rows {
            let (id, identity_id, author, text, created_at) = row?;
            notes.push(TherapistNote {
                id,
                identity_id,
                author,
                text,
                created_at: parse_time(&created_at)?,
            });
        }
        Ok(notes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ScheduleSlot;
    use rollcall_core::{LandmarkPoint, PixelFormat, Snapshotter, VideoFrame};
    use tempfile::NamedTempFile;

    fn template() -> LandmarkSet {
        LandmarkSet::new(vec![
            LandmarkPoint::new(0.51, 0.42, -0.02),
            LandmarkPoint::new(0.48, 0.55, 0.01),
        ])
    }

    fn enroll(store: &SqliteStore, name: &str) -> Identity {
        store
            .enroll(Enrollment {
                name: name.into(),
                class_group: Some("Turma A".into()),
                template: template(),
            })
            .unwrap()
    }

    fn event_for(identity: Identity, with_image: bool) -> AttendanceEvent {
        let frame = VideoFrame {
            width: 8,
            height: 8,
            format: PixelFormat::Gray8,
            data: vec![120; 64],
        };
        let coefficients = vec![NamedScore { name: "mouthSmileLeft".into(), score: 0.8 }];
        AttendanceEvent {
            identity,
            direction: Direction::Departure,
            timestamp: Utc::now(),
            emotion: EmotionLabel::LowArousal,
            engagement: 25,
            similarity: 0.93,
            capture: Snapshotter::default().capture(
                with_image.then_some(&frame),
                &template(),
                Some(&coefficients),
            ),
        }
    }

    #[test]
    fn test_enroll_and_list_in_order() {
        let store = SqliteStore::open_in_memory(Schedule::default()).unwrap();
        let alice = enroll(&store, "Alice");
        let bruno = enroll(&store, "Bruno");

        let enrolled = store.list_enrolled().unwrap();
        assert_eq!(enrolled.len(), 2);
        assert_eq!(enrolled[0].identity, alice);
        assert_eq!(enrolled[1].identity, bruno);
        assert_eq!(enrolled[0].template, template());
    }

    #[test]
    fn test_append_event_with_capture() {
        let store = SqliteStore::open_in_memory(Schedule::default()).unwrap();
        let alice = enroll(&store, "Alice");

        let stored = store.append_event(&event_for(alice.clone(), true)).unwrap();
        assert!(stored.has_image);
        assert_eq!(stored.direction, Direction::Departure);

        let listed = store.list_events(Some(&alice.id)).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, stored.id);
        assert_eq!(listed[0].emotion, EmotionLabel::LowArousal);
        assert_eq!(listed[0].engagement, 25);
        assert_eq!(listed[0].subject, stored.subject);

        let capture = store.capture_for(&stored.id).unwrap().unwrap();
        let image = capture.image.unwrap();
        assert_eq!((image.width, image.height), (8, 8));
        assert_eq!(&image.jpeg[..2], &[0xFF, 0xD8]);
        assert_eq!(capture.landmarks, template());
        assert_eq!(capture.coefficients.unwrap()[0].name, "mouthSmileLeft");

        assert!(store.capture_for("missing").unwrap().is_none());
    }

    #[test]
    fn test_list_events_filter() {
        let store = SqliteStore::open_in_memory(Schedule::default()).unwrap();
        let alice = enroll(&store, "Alice");
        let bruno = enroll(&store, "Bruno");
        store.append_event(&event_for(alice.clone(), false)).unwrap();
        store.append_event(&event_for(bruno.clone(), false)).unwrap();
        store.append_event(&event_for(alice.clone(), false)).unwrap();

        assert_eq!(store.list_events(None).unwrap().len(), 3);
        assert_eq!(store.list_events(Some(&alice.id)).unwrap().len(), 2);
        assert_eq!(store.list_events(Some(&bruno.id)).unwrap().len(), 1);
        assert!(!store.list_events(None).unwrap()[0].has_image);
    }

    #[test]
    fn test_event_context_uses_schedule() {
        let slots = (0..12).map(|hour| ScheduleSlot {
            class_group: "Turma A".into(),
            start_hour: hour,
            end_hour: hour + 1,
            subject: "Algoritmos".into(),
        });
        let store = SqliteStore::open_in_memory(Schedule::new(slots)).unwrap();
        let alice = enroll(&store, "Alice");

        let stored = store.append_event(&event_for(alice, false)).unwrap();
        match stored.period {
            Period::Morning => assert_eq!(stored.subject, "Algoritmos"),
            Period::Afternoon => assert_eq!(stored.subject, crate::schedule::GENERAL_ACTIVITY),
        }
    }

    #[test]
    fn test_unknown_identity_is_rejected() {
        let store = SqliteStore::open_in_memory(Schedule::default()).unwrap();
        let ghost = Identity { id: "ghost".into(), name: "Ghost".into(), class_group: None };
        assert!(matches!(store.append_event(&event_for(ghost, false)), Err(StoreError::NotFound(_))));
        assert!(matches!(
            store.add_therapist_note("ghost", "Dr. Santos", "text"),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_therapist_notes_roundtrip() {
        let store = SqliteStore::open_in_memory(Schedule::default()).unwrap();
        let alice = enroll(&store, "Alice");
        let note = store
            .add_therapist_note(&alice.id, "Dr. Santos", "more engaged in group work")
            .unwrap();
        let notes = store.notes_for(&alice.id).unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].id, note.id);
        assert_eq!(notes[0].text, "more engaged in group work");
    }

    #[test]
    fn test_persists_across_reopen() {
        let tf = NamedTempFile::new().unwrap();
        let path = tf.path().to_path_buf();

        let alice = {
            let store = SqliteStore::open(&path, Schedule::default()).unwrap();
            let alice = enroll(&store, "Alice");
            store.append_event(&event_for(alice.clone(), true)).unwrap();
            alice
        };

        let store = SqliteStore::open(&path, Schedule::default()).unwrap();
        assert_eq!(store.list_enrolled().unwrap()[0].identity, alice);
        assert_eq!(store.list_events(None).unwrap().len(), 1);
    }
}
