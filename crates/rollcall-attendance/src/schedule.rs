//! Timetable windows.
//!
//! Slots are weekly wall-clock ranges in the institution's zone. All
//! instants entering or leaving this module are `DateTime<Utc>`; the
//! conversion to wall-clock happens only here, with one fixed offset.
//! A slot whose end is before its start runs past midnight into the next day.

use chrono::{
    DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Offset, TimeZone, Utc, Weekday,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScheduleError {
    #[error("slot {slot_id}: start and end are both {time}")]
    InvalidSlot { slot_id: i64, time: NaiveTime },
    #[error("invalid UTC offset: {0} minutes")]
    InvalidOffset(i32),
}

/// A recurring weekly meeting of a course.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimetableSlot {
    pub slot_id: i64,
    pub course_id: i64,
    pub day: Weekday,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub room: Option<String>,
}

impl TimetableSlot {
    pub fn new(
        slot_id: i64,
        course_id: i64,
        day: Weekday,
        start_time: NaiveTime,
        end_time: NaiveTime,
    ) -> Result<Self, ScheduleError> {
        if start_time == end_time {
            return Err(ScheduleError::InvalidSlot {
                slot_id,
                time: start_time,
            });
        }
        Ok(Self {
            slot_id,
            course_id,
            day,
            start_time,
            end_time,
            room: None,
        })
    }

    pub fn with_room(mut self, room: impl Into<String>) -> Self {
        self.room = Some(room.into());
        self
    }

    pub fn spans_midnight(&self) -> bool {
        self.end_time < self.start_time
    }

    pub fn duration(&self) -> Duration {
        let raw = self.end_time - self.start_time;
        if self.spans_midnight() { raw + Duration::days(1) } else { raw }
    }
}

/// One dated instance of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotOccurrence {
    pub slot_id: i64,
    /// Local date on which the slot starts.
    pub date: NaiveDate,
    pub start: DateTime<Utc>,
    /// Effective end; the following day for midnight-spanning slots.
    pub end: DateTime<Utc>,
}

impl SlotOccurrence {
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        self.start <= now && now < self.end
    }
}

/// Evaluates slots against instants in a single fixed zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleWindow {
    offset: FixedOffset,
}

impl Default for ScheduleWindow {
    fn default() -> Self {
        Self::utc()
    }
}

impl ScheduleWindow {
    pub fn new(offset: FixedOffset) -> Self {
        Self { offset }
    }

    pub fn utc() -> Self {
        Self { offset: Utc.fix() }
    }

    /// Zone at `minutes` east of UTC.
    pub fn from_offset_minutes(minutes: i32) -> Result<Self, ScheduleError> {
        FixedOffset::east_opt(minutes.saturating_mul(60))
            .map(Self::new)
            .ok_or(ScheduleError::InvalidOffset(minutes))
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// Wall-clock date of `now` in the schedule zone.
    pub fn local_date(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.offset).date_naive()
    }

    fn to_utc(&self, local: NaiveDateTime) -> DateTime<Utc> {
        Utc.from_utc_datetime(&(local - Duration::seconds(self.offset.local_minus_utc() as i64)))
    }

    /// The instance of `slot` starting on local `date`, regardless of weekday.
    pub fn occurrence_on(&self, slot: &TimetableSlot, date: NaiveDate) -> SlotOccurrence {
        let start = self.to_utc(date.and_time(slot.start_time));
        let end_date = if slot.spans_midnight() { date + Duration::days(1) } else { date };
        let end = self.to_utc(end_date.and_time(slot.end_time));
        SlotOccurrence {
            slot_id: slot.slot_id,
            date,
            start,
            end,
        }
    }

    /// The instance of `slot` that contains `now`, if any.
    ///
    /// Checks the instance starting today and, for midnight-spanning slots,
    /// the one that started yesterday.
    pub fn live_occurrence(&self, slot: &TimetableSlot, now: DateTime<Utc>) -> Option<SlotOccurrence> {
        let today = self.local_date(now);
        let yesterday = today - Duration::days(1);
        [today, yesterday]
            .into_iter()
            .filter(|d| d.weekday() == slot.day)
            .map(|d| self.occurrence_on(slot, d))
            .find(|occ| occ.contains(now))
    }

    pub fn is_live(&self, slot: &TimetableSlot, now: DateTime<Utc>) -> bool {
        self.live_occurrence(slot, now).is_some()
    }

    /// Next instance of `slot` starting at or after `now`.
    pub fn next_occurrence(&self, slot: &TimetableSlot, now: DateTime<Utc>) -> SlotOccurrence {
        let today = self.local_date(now);
        (0..=7)
            .map(|d| today + Duration::days(d))
            .filter(|d| d.weekday() == slot.day)
            .map(|d| self.occurrence_on(slot, d))
            .find(|occ| occ.start >= now)
            // Day 7 always repeats today's weekday and lies in the future.
            .unwrap_or_else(|| self.occurrence_on(slot, today + Duration::days(7)))
    }

    /// Zero while the slot is live, otherwise the wait until its next start.
    pub fn time_until_start(&self, slot: &TimetableSlot, now: DateTime<Utc>) -> Duration {
        if self.is_live(slot, now) {
            return Duration::zero();
        }
        self.next_occurrence(slot, now).start - now
    }
}
