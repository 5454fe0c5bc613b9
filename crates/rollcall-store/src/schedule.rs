//! Academic context attached to stored attendance events.
//!
//! A class group has hour slots in the morning, each bound to a subject.
//! Afternoon events and unknown groups fall under a general activity;
//! a morning hour outside every slot is a break.

use chrono::{DateTime, Local, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

pub const GENERAL_ACTIVITY: &str = "General Activity";
pub const BREAK: &str = "Break";

const AFTERNOON_STARTS_AT: u32 = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Period {
    Morning,
    Afternoon,
}

impl Period {
    pub fn for_hour(hour: u32) -> Self {
        if hour < AFTERNOON_STARTS_AT {
            Period::Morning
        } else {
            Period::Afternoon
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Period::Morning => "morning",
            Period::Afternoon => "afternoon",
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Period {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "morning" => Ok(Period::Morning),
            "afternoon" => Ok(Period::Afternoon),
            other => Err(format!("unknown period: {other}")),
        }
    }
}

/// One `[start_hour, end_hour)` slot of a class group's timetable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleSlot {
    pub class_group: String,
    pub start_hour: u32,
    pub end_hour: u32,
    pub subject: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcademicContext {
    pub subject: String,
    pub period: Period,
}

/// Per-class-group timetable.
#[derive(Debug, Clone, Default)]
pub struct Schedule {
    slots: HashMap<String, Vec<ScheduleSlot>>,
}

impl Schedule {
    pub fn new(slots: impl IntoIterator<Item = ScheduleSlot>) -> Self {
        let mut schedule = Self::default();
        for slot in slots {
            schedule.add_slot(slot);
        }
        schedule
    }

    pub fn add_slot(&mut self, slot: ScheduleSlot) {
        self.slots.entry(slot.class_group.clone()).or_default().push(slot);
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Resolve the context for a local wall-clock hour.
    pub fn resolve(&self, class_group: Option<&str>, hour: u32) -> AcademicContext {
        let period = Period::for_hour(hour);
        let general = || AcademicContext {
            subject: GENERAL_ACTIVITY.to_string(),
            period,
        };

        if period == Period::Afternoon {
            return general();
        }
        let Some(slots) = class_group.and_then(|g| self.slots.get(g)) else {
            return general();
        };

        let subject = slots
            .iter()
            .find(|s| hour >= s.start_hour && hour < s.end_hour)
            .map(|s| s.subject.clone())
            .unwrap_or_else(|| BREAK.to_string());
        AcademicContext { subject, period }
    }

    /// Resolve the context for an event timestamp in the local timezone.
    pub fn context_for(&self, class_group: Option<&str>, timestamp: DateTime<Utc>) -> AcademicContext {
        self.resolve(class_group, timestamp.with_timezone(&Local).hour())
    }
}
