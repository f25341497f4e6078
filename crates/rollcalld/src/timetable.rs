//! Timetable import from a TOML file.
//!
//! ```toml
//! [[slot]]
//! id = 1
//! course_id = 7
//! day = "mon"
//! start = "08:00"
//! end = "10:00"
//! room = "B12"
//! ```

use chrono::{NaiveTime, Weekday};
use rollcall_attendance::{AttendanceStore, ScheduleError, StoreError, TimetableSlot};
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TimetableError {
    #[error("reading timetable: {0}")]
    Io(#[from] std::io::Error),
    #[error("parsing timetable: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("slot {slot_id}: unknown day {value:?}")]
    Day { slot_id: i64, value: String },
    #[error("slot {slot_id}: invalid time {value:?}, expected HH:MM")]
    Time { slot_id: i64, value: String },
    #[error(transparent)]
    Slot(#[from] ScheduleError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Deserialize)]
struct TimetableFile {
    #[serde(default)]
    slot: Vec<SlotEntry>,
}

#[derive(Debug, Deserialize)]
struct SlotEntry {
    id: i64,
    course_id: i64,
    day: String,
    start: String,
    end: String,
    room: Option<String>,
}

fn parse_time(slot_id: i64, value: &str) -> Result<NaiveTime, TimetableError> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M").map_err(|_| TimetableError::Time {
        slot_id,
        value: value.to_string(),
    })
}

pub fn parse_timetable(text: &str) -> Result<Vec<TimetableSlot>, TimetableError> {
    let file: TimetableFile = toml::from_str(text)?;
    file.slot
        .into_iter()
        .map(|entry| {
            let day: Weekday = entry.day.trim().parse().map_err(|_| TimetableError::Day {
                slot_id: entry.id,
                value: entry.day.clone(),
            })?;
            let start = parse_time(entry.id, &entry.start)?;
            let end = parse_time(entry.id, &entry.end)?;
            let slot = TimetableSlot::new(entry.id, entry.course_id, day, start, end)?;
            Ok(match entry.room {
                Some(room) => slot.with_room(room),
                None => slot,
            })
        })
        .collect()
}

/// Upsert every slot in the file. Nothing is written if any entry is invalid.
pub fn import<S: AttendanceStore + ?Sized>(path: &Path, store: &S) -> Result<usize, TimetableError> {
    let slots = parse_timetable(&std::fs::read_to_string(path)?)?;
    for slot in &slots {
        store.upsert_slot(slot)?;
    }
    tracing::info!(path = %path.display(), slots = slots.len(), "timetable imported");
    Ok(slots.len())
}
