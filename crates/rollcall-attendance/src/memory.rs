//! In-process store for tests and ephemeral deployments.

use crate::schedule::TimetableSlot;
use crate::session::{AttendanceSession, EndReason};
use crate::store::{AttendanceStore, StoreError};
use chrono::{DateTime, Utc, Weekday};
use rollcall_core::{Gallery, Identity, IdentityStatus};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
struct Tables {
    identities: Vec<Identity>,
    slots: BTreeMap<i64, TimetableSlot>,
    sessions: Vec<AttendanceSession>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl AttendanceStore for MemoryStore {
    fn load_gallery(&self) -> Result<Gallery, StoreError> {
        Ok(self
            .tables()
            .identities
            .iter()
            .filter(|i| i.status == IdentityStatus::Approved)
            .map(|i| (i.identity_id.clone(), i.embeddings.clone()))
            .collect())
    }

    fn save_identity(&self, identity: &Identity) -> Result<(), StoreError> {
        let mut t = self.tables();
        if t.identities.iter().any(|i| i.identity_id == identity.identity_id) {
            return Err(StoreError::Conflict(format!(
                "identity {} already enrolled",
                identity.identity_id
            )));
        }
        t.identities.push(identity.clone());
        Ok(())
    }

    fn get_identity(&self, identity_id: &str) -> Result<Option<Identity>, StoreError> {
        Ok(self
            .tables()
            .identities
            .iter()
            .find(|i| i.identity_id == identity_id)
            .cloned())
    }

    fn set_identity_status(&self, identity_id: &str, status: IdentityStatus) -> Result<(), StoreError> {
        let mut t = self.tables();
        let identity = t
            .identities
            .iter_mut()
            .find(|i| i.identity_id == identity_id)
            .ok_or_else(|| StoreError::NotFound {
                kind: "identity",
                id: identity_id.to_string(),
            })?;
        identity.status = status;
        Ok(())
    }

    fn get_active_session(&self, identity_id: &str) -> Result<Option<AttendanceSession>, StoreError> {
        Ok(self
            .tables()
            .sessions
            .iter()
            .find(|s| s.identity_id == identity_id && s.is_active())
            .cloned())
    }

    fn get_session(&self, session_id: &str) -> Result<Option<AttendanceSession>, StoreError> {
        Ok(self
            .tables()
            .sessions
            .iter()
            .find(|s| s.session_id == session_id)
            .cloned())
    }

    fn create_session(&self, session: &AttendanceSession) -> Result<(), StoreError> {
        let mut t = self.tables();
        if let Some(existing) = t
            .sessions
            .iter()
            .find(|s| s.identity_id == session.identity_id && s.is_active())
        {
            return Err(StoreError::Conflict(format!(
                "identity {} already has active session {}",
                session.identity_id, existing.session_id
            )));
        }
        t.sessions.push(session.clone());
        Ok(())
    }

    fn end_session(
        &self,
        session_id: &str,
        end_time: DateTime<Utc>,
        reason: EndReason,
    ) -> Result<AttendanceSession, StoreError> {
        let mut t = self.tables();
        let session = t
            .sessions
            .iter_mut()
            .find(|s| s.session_id == session_id)
            .ok_or_else(|| StoreError::NotFound {
                kind: "session",
                id: session_id.to_string(),
            })?;
        if !session.is_active() {
            return Err(StoreError::NotActive(session_id.to_string()));
        }
        session.close(end_time, reason);
        Ok(session.clone())
    }

    fn list_active_sessions(&self) -> Result<Vec<AttendanceSession>, StoreError> {
        Ok(self.tables().sessions.iter().filter(|s| s.is_active()).cloned().collect())
    }

    fn sessions_for_identity(&self, identity_id: &str) -> Result<Vec<AttendanceSession>, StoreError> {
        let mut sessions: Vec<_> = self
            .tables()
            .sessions
            .iter()
            .filter(|s| s.identity_id == identity_id)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        Ok(sessions)
    }

    fn slots_on(&self, course_id: i64, day: Weekday) -> Result<Vec<TimetableSlot>, StoreError> {
        Ok(self
            .tables()
            .slots
            .values()
            .filter(|s| s.course_id == course_id && s.day == day)
            .cloned()
            .collect())
    }

    fn slots_for_course(&self, course_id: i64) -> Result<Vec<TimetableSlot>, StoreError> {
        Ok(self
            .tables()
            .slots
            .values()
            .filter(|s| s.course_id == course_id)
            .cloned()
            .collect())
    }

    fn get_slot(&self, slot_id: i64) -> Result<Option<TimetableSlot>, StoreError> {
        Ok(self.tables().slots.get(&slot_id).cloned())
    }

    fn upsert_slot(&self, slot: &TimetableSlot) -> Result<(), StoreError> {
        self.tables().slots.insert(slot.slot_id, slot.clone());
        Ok(())
    }
}
