use chrono::{DateTime, NaiveDate, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a stored session. `Ended` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Ended,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Ended => "ended",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "ended" => Some(Self::Ended),
            _ => None,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What moved a session to `Ended`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// Face-verified checkout.
    Checkout,
    /// Re-recognized inside the closing window of its slot.
    Recognition,
    /// Reclaimed by the expiry sweep.
    Expired,
    /// Closed with the rest of its course.
    CourseClosed,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Checkout => "checkout",
            Self::Recognition => "recognition",
            Self::Expired => "expired",
            Self::CourseClosed => "course_closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "checkout" => Some(Self::Checkout),
            "recognition" => Some(Self::Recognition),
            "expired" => Some(Self::Expired),
            "course_closed" => Some(Self::CourseClosed),
            _ => None,
        }
    }
}

/// One attendance record.
///
/// `end_time` and `end_reason` are set exactly when `status` is `Ended`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceSession {
    pub session_id: String,
    pub identity_id: String,
    pub slot_id: i64,
    /// Local date on which the slot occurrence started.
    pub date: NaiveDate,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: SessionStatus,
    pub end_reason: Option<EndReason>,
}

impl AttendanceSession {
    /// A fresh active session with a random id.
    ///
    /// Timestamps are kept at microsecond precision, the precision they are
    /// stored at.
    pub fn start(identity_id: &str, slot_id: i64, date: NaiveDate, start_time: DateTime<Utc>) -> Self {
        let start_time = start_time.trunc_subsecs(6);
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            identity_id: identity_id.to_string(),
            slot_id,
            date,
            start_time,
            end_time: None,
            status: SessionStatus::Active,
            end_reason: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    /// Mark ended. The end is never earlier than the start.
    pub fn close(&mut self, at: DateTime<Utc>, reason: EndReason) {
        self.end_time = Some(at.trunc_subsecs(6).max(self.start_time));
        self.status = SessionStatus::Ended;
        self.end_reason = Some(reason);
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        self.end_time.map(|end| end - self.start_time)
    }
}
