use rollcall_core::{Direction, FrameResult, LandmarkSet};
use rollcall_store::Enrollment;
use serde::Serialize;
use zbus::interface;

use crate::engine::{EngineError, EngineHandle};

pub const BUS_NAME: &str = "org.rollcall.Attendance1";
pub const OBJECT_PATH: &str = "/org/rollcall/Attendance1";

/// D-Bus interface for the attendance daemon.
///
/// Structured values cross the bus as JSON strings.
pub struct RollcallService {
    engine: EngineHandle,
}

impl RollcallService {
    pub fn new(engine: EngineHandle) -> Self {
        Self { engine }
    }
}

fn engine_error(e: EngineError) -> zbus::fdo::Error {
    match e {
        EngineError::Session(e) => zbus::fdo::Error::Failed(e.to_string()),
        EngineError::Store(rollcall_store::StoreError::NotFound(what)) => {
            zbus::fdo::Error::InvalidArgs(format!("not found: {what}"))
        }
        other => zbus::fdo::Error::Failed(other.to_string()),
    }
}

fn to_json<T: Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

fn from_json<'a, T: serde::Deserialize<'a>>(what: &str, raw: &'a str) -> zbus::fdo::Result<T> {
    serde_json::from_str(raw).map_err(|e| zbus::fdo::Error::InvalidArgs(format!("invalid {what}: {e}")))
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

#[interface(name = "org.rollcall.Attendance1")]
impl RollcallService {
    /// Feed one detector result (JSON `FrameResult`). Returns the session status.
    async fn submit_frame(&self, frame: &str) -> zbus::fdo::Result<String> {
        let frame: FrameResult = from_json("frame", frame)?;
        let status = self.engine.submit_frame(frame).await.map_err(engine_error)?;
        to_json(&status)
    }

    /// Record the recognized identity's arrival or departure. Returns the stored event.
    async fn commit(&self, direction: &str) -> zbus::fdo::Result<String> {
        let direction: Direction = direction
            .parse()
            .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("{e}")))?;
        tracing::info!(%direction, "commit requested");
        let event = self.engine.commit(direction).await.map_err(engine_error)?;
        to_json(&event)
    }

    /// Discard the current recognition and return to idle.
    async fn reset(&self) -> zbus::fdo::Result<String> {
        let status = self.engine.reset().await.map_err(engine_error)?;
        to_json(&status)
    }

    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = self.engine.status().await.map_err(engine_error)?;
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "session": status,
        })
        .to_string())
    }

    async fn set_emotion_analysis(&self, enabled: bool) -> zbus::fdo::Result<String> {
        let status = self.engine.set_emotion_analysis(enabled).await.map_err(engine_error)?;
        to_json(&status)
    }

    /// Register an identity. An empty class group means none; the template
    /// is a JSON landmark array and may be empty. Returns the new identity ID.
    async fn enroll(&self, name: &str, class_group: &str, template: &str) -> zbus::fdo::Result<String> {
        let name = non_empty(name).ok_or_else(|| zbus::fdo::Error::InvalidArgs("name must not be empty".into()))?;
        let template: LandmarkSet = if template.trim().is_empty() {
            LandmarkSet::default()
        } else {
            from_json("template", template)?
        };
        tracing::info!(name = %name, points = template.len(), "enroll requested");

        let identity = self
            .engine
            .enroll(Enrollment {
                name,
                class_group: non_empty(class_group),
                template,
            })
            .await
            .map_err(engine_error)?;
        Ok(identity.id)
    }

    async fn add_note(&self, identity_id: &str, author: &str, text: &str) -> zbus::fdo::Result<String> {
        let note = self
            .engine
            .add_note(identity_id.to_string(), author.to_string(), text.to_string())
            .await
            .map_err(engine_error)?;
        to_json(&note)
    }

    /// Attendance log as JSON, for one identity or (empty ID) everyone.
    async fn list_events(&self, identity_id: &str) -> zbus::fdo::Result<String> {
        let events = self
            .engine
            .list_events(non_empty(identity_id))
            .await
            .map_err(engine_error)?;
        to_json(&events)
    }
}
