//! Persistence seam for identities, timetable slots and sessions.

use crate::schedule::TimetableSlot;
use crate::session::{AttendanceSession, EndReason};
use chrono::{DateTime, Utc, Weekday};
use rollcall_core::{Gallery, Identity, IdentityStatus};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("session {0} is not active")]
    NotActive(String),
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error("storage backend: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl StoreError {
    pub fn backend(e: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Backend(Box::new(e))
    }
}

/// Durable state behind the session manager.
///
/// Implementations must serialize their own writes. Two rules are enforced
/// here rather than trusted to callers: `create_session` refuses a second
/// active session for the same identity, and `end_session` only moves an
/// active session to ended.
pub trait AttendanceStore: Send + Sync {
    /// Approved identities with their embeddings, in enrollment order.
    fn load_gallery(&self) -> Result<Gallery, StoreError>;

    /// Insert a new identity together with its embeddings.
    fn save_identity(&self, identity: &Identity) -> Result<(), StoreError>;

    fn get_identity(&self, identity_id: &str) -> Result<Option<Identity>, StoreError>;

    fn set_identity_status(&self, identity_id: &str, status: IdentityStatus) -> Result<(), StoreError>;

    fn get_active_session(&self, identity_id: &str) -> Result<Option<AttendanceSession>, StoreError>;

    fn get_session(&self, session_id: &str) -> Result<Option<AttendanceSession>, StoreError>;

    fn create_session(&self, session: &AttendanceSession) -> Result<(), StoreError>;

    /// Close an active session and return the stored result.
    fn end_session(
        &self,
        session_id: &str,
        end_time: DateTime<Utc>,
        reason: EndReason,
    ) -> Result<AttendanceSession, StoreError>;

    fn list_active_sessions(&self) -> Result<Vec<AttendanceSession>, StoreError>;

    /// All sessions of an identity, newest first.
    fn sessions_for_identity(&self, identity_id: &str) -> Result<Vec<AttendanceSession>, StoreError>;

    /// Slots of `course_id` that start on `day`.
    fn slots_on(&self, course_id: i64, day: Weekday) -> Result<Vec<TimetableSlot>, StoreError>;

    fn slots_for_course(&self, course_id: i64) -> Result<Vec<TimetableSlot>, StoreError>;

    fn get_slot(&self, slot_id: i64) -> Result<Option<TimetableSlot>, StoreError>;

    fn upsert_slot(&self, slot: &TimetableSlot) -> Result<(), StoreError>;
}
