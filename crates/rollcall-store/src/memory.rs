//! In-memory record store.

use chrono::Utc;
use rollcall_core::{AttendanceEvent, CaptureSnapshot, EnrolledTemplate, Identity};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::{new_id, Enrollment, RecordStore, Schedule, StoreError, StoredEvent, TherapistNote};

#[derive(Default)]
struct Records {
    enrolled: Vec<EnrolledTemplate>,
    events: Vec<StoredEvent>,
    captures: HashMap<String, CaptureSnapshot>,
    notes: Vec<TherapistNote>,
}

/// Process-local store. Contents are lost on drop.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<Records>,
    schedule: Schedule,
}

impl MemoryStore {
    pub fn new(schedule: Schedule) -> Self {
        Self {
            records: Mutex::default(),
            schedule,
        }
    }

    fn records(&self) -> Result<MutexGuard<'_, Records>, StoreError> {
        self.records.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl RecordStore for MemoryStore {
    fn enroll(&self, enrollment: Enrollment) -> Result<Identity, StoreError> {
        let identity = Identity {
            id: new_id(),
            name: enrollment.name,
            class_group: enrollment.class_group,
        };
        self.records()?.enrolled.push(EnrolledTemplate {
            identity: identity.clone(),
            template: enrollment.template,
            enrolled_at: Utc::now(),
        });
        Ok(identity)
    }

    fn list_enrolled(&self) -> Result<Vec<EnrolledTemplate>, StoreError> {
        Ok(self.records()?.enrolled.clone())
    }

    fn append_event(&self, event: &AttendanceEvent) -> Result<StoredEvent, StoreError> {
        let mut records = self.records()?;
        let class_group = records
            .enrolled
            .iter()
            .find(|r| r.identity.id == event.identity.id)
            .map(|r| r.identity.class_group.clone())
            .ok_or_else(|| StoreError::NotFound(format!("identity {}", event.identity.id)))?;

        let context = self.schedule.context_for(class_group.as_deref(), event.timestamp);
        let stored = StoredEvent::from_event(new_id(), event, context);
        records.captures.insert(stored.id.clone(), event.capture.clone());
        records.events.push(stored.clone());
        Ok(stored)
    }

    fn list_events(&self, identity_id: Option<&str>) -> Result<Vec<StoredEvent>, StoreError> {
        Ok(self
            .records()?
            .events
            .iter()
            .filter(|e| identity_id.map_or(true, |id| e.identity_id == id))
            .cloned()
            .collect())
    }

    fn capture_for(&self, event_id: &str) -> Result<Option<CaptureSnapshot>, StoreError> {
        Ok(self.records()?.captures.get(event_id).cloned())
    }

    fn add_therapist_note(&self, identity_id: &str, author: &str, text: &str) -> Result<TherapistNote, StoreError> {
        let mut records = self.records()?;
        if !records.enrolled.iter().any(|r| r.identity.id == identity_id) {
            return Err(StoreError::NotFound(format!("identity {identity_id}")));
        }
        let note = TherapistNote {
            id: new_id(),
            identity_id: identity_id.to_string(),
            author: author.to_string(),
            text: text.to_string(),
            created_at: Utc::now(),
        };
        records.notes.push(note.clone());
        Ok(note)
    }

    fn notes_for(&self, identity_id: &str) -> Result<Vec<TherapistNote>, StoreError> {
        Ok(self
            .records()?
            .notes
            .iter()
            .filter(|n| n.identity_id == identity_id)
            .cloned()
            .collect())
    }
}
