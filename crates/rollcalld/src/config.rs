use rollcall_core::{
    SessionConfig, COMMIT_ENGAGEMENT_BASE, DEFAULT_AFFECT_INTERVAL, DEFAULT_COOLDOWN, DEFAULT_JPEG_QUALITY,
    SIMILARITY_THRESHOLD,
};
use rollcall_store::{Schedule, ScheduleSlot};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::engine::EngineSettings;

pub const DEFAULT_INSIGHT_ENDPOINT: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_INSIGHT_MODEL: &str = "gemini-2.5-flash";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read schedule {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid schedule file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Keep records in memory only (demo mode).
    pub in_memory: bool,
    /// Optional TOML timetable used to tag events with a subject.
    pub schedule_path: Option<PathBuf>,
    pub similarity_threshold: f32,
    pub cooldown: Duration,
    pub affect_enabled: bool,
    pub affect_interval: Duration,
    /// Upper bound on a single classifier call.
    pub affect_timeout: Duration,
    pub engagement_base: i32,
    pub snapshot_quality: u8,
    pub insight_endpoint: String,
    pub insight_model: String,
    /// Without a key the daemon classifies everything as neutral.
    pub insight_api_key: Option<String>,
    /// Register on the system bus instead of the session bus.
    pub system_bus: bool,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        let db_path = std::env::var("ROLLCALL_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("attendance.db"));

        let insight_api_key = std::env::var("ROLLCALL_INSIGHT_API_KEY")
            .or_else(|_| std::env::var("API_KEY"))
            .ok()
            .filter(|k| !k.trim().is_empty());

        Self {
            db_path,
            in_memory: env_flag("ROLLCALL_IN_MEMORY", false),
            schedule_path: std::env::var("ROLLCALL_SCHEDULE_PATH").map(PathBuf::from).ok(),
            similarity_threshold: env_f32("ROLLCALL_SIMILARITY_THRESHOLD", SIMILARITY_THRESHOLD),
            cooldown: env_millis("ROLLCALL_COOLDOWN_MS", DEFAULT_COOLDOWN),
            affect_enabled: env_flag("ROLLCALL_AFFECT_ENABLED", true),
            affect_interval: env_millis("ROLLCALL_AFFECT_INTERVAL_MS", DEFAULT_AFFECT_INTERVAL),
            affect_timeout: env_millis("ROLLCALL_AFFECT_TIMEOUT_MS", Duration::from_secs(8)),
            engagement_base: env_parse("ROLLCALL_ENGAGEMENT_BASE", COMMIT_ENGAGEMENT_BASE),
            snapshot_quality: env_parse("ROLLCALL_SNAPSHOT_QUALITY", DEFAULT_JPEG_QUALITY).clamp(1, 100),
            insight_endpoint: std::env::var("ROLLCALL_INSIGHT_ENDPOINT")
                .unwrap_or_else(|_| DEFAULT_INSIGHT_ENDPOINT.to_string()),
            insight_model: std::env::var("ROLLCALL_INSIGHT_MODEL")
                .unwrap_or_else(|_| DEFAULT_INSIGHT_MODEL.to_string()),
            insight_api_key,
            system_bus: env_flag("ROLLCALL_SYSTEM_BUS", false),
        }
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            session: SessionConfig {
                similarity_threshold: self.similarity_threshold,
                cooldown: self.cooldown,
                affect_enabled: self.affect_enabled,
                affect_interval: self.affect_interval,
                engagement_base: self.engagement_base,
                jpeg_quality: self.snapshot_quality,
            },
            affect_timeout: self.affect_timeout,
        }
    }

    /// Read the configured timetable, or an empty one when none is set.
    pub fn load_schedule(&self) -> Result<Schedule, ConfigError> {
        match &self.schedule_path {
            Some(path) => read_schedule(path),
            None => Ok(Schedule::default()),
        }
    }
}

#[derive(Deserialize)]
struct ScheduleFile {
    #[serde(default)]
    slot: Vec<ScheduleSlot>,
}

fn read_schedule(path: &Path) -> Result<Schedule, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let schedule = parse_schedule(&text)?;
    tracing::info!(path = %path.display(), "schedule loaded");
    Ok(schedule)
}

/// Parse a timetable of `[[slot]]` tables.
pub fn parse_schedule(text: &str) -> Result<Schedule, ConfigError> {
    let file: ScheduleFile = toml::from_str(text)?;
    Ok(Schedule::new(file.slot))
}

fn env_f32(key: &str, default: f32) -> f32 {
    env_parse(key, default)
}

fn env_millis(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key).map(|v| parse_flag(&v)).unwrap_or(default)
}

fn parse_flag(value: &str) -> bool {
    !matches!(value.trim().to_ascii_lowercase().as_str(), "0" | "false" | "no" | "off" | "")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_schedule() {
        let schedule = parse_schedule(
            r#"
            [[slot]]
            class_group = "Turma A"
            start_hour = 8
            end_hour = 10
            subject = "Cálculo I"

            [[slot]]
            class_group = "Turma B"
            start_hour = 8
            end_hour = 12
            subject = "Física"
            "#,
        )
        .unwrap();

        assert_eq!(schedule.resolve(Some("Turma A"), 9).subject, "Cálculo I");
        assert_eq!(schedule.resolve(Some("Turma B"), 11).subject, "Física");
    }

    #[test]
    fn test_empty_schedule_file() {
        assert!(parse_schedule("").unwrap().is_empty());
    }

    #[test]
    fn test_malformed_schedule() {
        assert!(matches!(
            parse_schedule("[[slot]]\nclass_group = 3"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_parse_flag() {
        assert!(parse_flag("1"));
        assert!(parse_flag("yes"));
        assert!(!parse_flag("0"));
        assert!(!parse_flag("Off"));
    }
}
