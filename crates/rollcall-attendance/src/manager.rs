//! Attendance session state machine.
//!
//! Per identity: no session, then `Active` once a recognition lands inside a
//! live slot of the identity's course, then `Ended` through a face-verified
//! checkout, the expiry sweep, or a course-wide close. Every read-then-write
//! on an identity's sessions runs under that identity's lock.

use crate::locks::IdentityLocks;
use crate::schedule::{ScheduleWindow, SlotOccurrence};
use crate::session::{AttendanceSession, EndReason};
use crate::store::{AttendanceStore, StoreError};
use chrono::{DateTime, Datelike, Duration, Utc};
use rollcall_core::{Embedding, FaceMatcher, Gallery, Identity, IdentityStatus, MatchError, MatchOutcome};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AttendanceError {
    #[error("session {0} has already ended")]
    AlreadyEnded(String),
    #[error("identity {identity_id} already has active session {session_id}")]
    AlreadyActive { identity_id: String, session_id: String },
    #[error("face does not match the holder of session {0}")]
    FaceMismatch(String),
    #[error("unknown identity: {0}")]
    UnknownIdentity(String),
    #[error("unknown session: {0}")]
    UnknownSession(String),
    #[error("identity {identity_id} is {}, not approved", .status.as_str())]
    NotApproved { identity_id: String, status: IdentityStatus },
    #[error("identity {0} has no embeddings")]
    NoEmbeddings(String),
    #[error("face already enrolled as {existing} (distance {distance:.3})")]
    DuplicateIdentity { existing: String, distance: f32 },
    #[error(transparent)]
    Match(#[from] MatchError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Session-level tunables.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionPolicy {
    /// Added to a slot's end before the sweep reclaims its sessions.
    pub grace: Duration,
    /// Cosine-distance threshold for checkout confirmation.
    pub checkout_threshold: f32,
    /// Looser threshold used to spot an already-enrolled face.
    pub duplicate_threshold: f32,
    /// When set, a recognition this close to the slot end checks out.
    pub recognition_checkout: Option<Duration>,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            grace: Duration::minutes(30),
            checkout_threshold: 0.6,
            duplicate_threshold: 0.7,
            recognition_checkout: None,
        }
    }
}

/// Next class of a course, reported when nothing is live.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpcomingClass {
    pub slot_id: i64,
    pub course_id: i64,
    pub room: Option<String>,
    pub starts_at: DateTime<Utc>,
    pub starts_in_secs: i64,
}

/// Result of a check-in recognition.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CheckIn {
    Started { session: AttendanceSession },
    /// Closed an active session inside its recognition-checkout window.
    CheckedOut { session: AttendanceSession },
    /// No slot of the identity's course is live. Nothing was written.
    NoActiveSlot { upcoming: Option<UpcomingClass> },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub examined: usize,
    pub expired: Vec<AttendanceSession>,
    pub failed: usize,
}

pub struct AttendanceSessionManager<S> {
    store: Arc<S>,
    schedule: ScheduleWindow,
    policy: SessionPolicy,
    verifier: FaceMatcher,
    locks: IdentityLocks,
    /// Serializes the duplicate check with the write that depends on it.
    registry: Mutex<()>,
}

impl<S: AttendanceStore> AttendanceSessionManager<S> {
    pub fn new(store: Arc<S>, schedule: ScheduleWindow, policy: SessionPolicy) -> Self {
        Self {
            store,
            schedule,
            verifier: FaceMatcher::new(policy.checkout_threshold),
            policy,
            locks: IdentityLocks::new(),
            registry: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn schedule(&self) -> &ScheduleWindow {
        &self.schedule
    }

    pub fn policy(&self) -> &SessionPolicy {
        &self.policy
    }

    /// Persist a freshly enrolled identity as `pending`.
    ///
    /// Refused when any of its embeddings lands within the duplicate
    /// threshold of a different approved identity.
    pub fn register(&self, mut identity: Identity) -> Result<Identity, AttendanceError> {
        if identity.embeddings.is_empty() {
            return Err(AttendanceError::NoEmbeddings(identity.identity_id));
        }
        let _registry = self.registry();
        self.refuse_duplicate(&identity, "enrollment")?;

        identity.status = IdentityStatus::Pending;
        self.store.save_identity(&identity)?;
        tracing::info!(
            identity = %identity.identity_id,
            course = identity.course_id,
            embeddings = identity.embeddings.len(),
            "identity registered, pending approval"
        );
        Ok(identity)
    }

    fn registry(&self) -> MutexGuard<'_, ()> {
        self.registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn refuse_duplicate(&self, identity: &Identity, action: &'static str) -> Result<(), AttendanceError> {
        match self.closest_other(identity)? {
            Some((existing, distance)) => {
                tracing::warn!(
                    identity = %identity.identity_id,
                    existing = %existing,
                    distance,
                    action,
                    "refused: face already enrolled"
                );
                Err(AttendanceError::DuplicateIdentity { existing, distance })
            }
            None => Ok(()),
        }
    }

    /// Nearest approved identity other than `identity` within the duplicate
    /// threshold.
    fn closest_other(&self, identity: &Identity) -> Result<Option<(String, f32)>, AttendanceError> {
        let gallery: Gallery = self
            .store
            .load_gallery()?
            .iter()
            .filter(|e| e.identity_id != identity.identity_id)
            .map(|e| (e.identity_id.clone(), e.embeddings.clone()))
            .collect();
        let matcher = FaceMatcher::new(self.policy.duplicate_threshold);
        let mut best: Option<(String, f32)> = None;
        for embedding in &identity.embeddings {
            if let MatchOutcome::Matched { identity_id, distance } = matcher.find_match(embedding, &gallery)? {
                if best.as_ref().map_or(true, |(_, d)| distance < *d) {
                    best = Some((identity_id, distance));
                }
            }
        }
        Ok(best)
    }

    /// Admit an identity to the recognition gallery.
    ///
    /// The duplicate check is repeated here: two pending enrollments of one
    /// face can both pass at registration, but only one may be approved.
    pub fn approve(&self, identity_id: &str) -> Result<(), AttendanceError> {
        let _registry = self.registry();
        let identity = self.identity(identity_id)?;
        if identity.embeddings.is_empty() {
            return Err(AttendanceError::NoEmbeddings(identity_id.to_string()));
        }
        self.refuse_duplicate(&identity, "approval")?;
        self.store.set_identity_status(identity_id, IdentityStatus::Approved)?;
        tracing::info!(identity = identity_id, "identity approved");
        Ok(())
    }

    pub fn reject(&self, identity_id: &str) -> Result<(), AttendanceError> {
        self.identity(identity_id)?;
        self.store.set_identity_status(identity_id, IdentityStatus::Rejected)?;
        tracing::info!(identity = identity_id, "identity rejected");
        Ok(())
    }

    fn identity(&self, identity_id: &str) -> Result<Identity, AttendanceError> {
        self.store
            .get_identity(identity_id)?
            .ok_or_else(|| AttendanceError::UnknownIdentity(identity_id.to_string()))
    }

    /// Handle a successful recognition of `identity_id` at `now`.
    pub fn check_in(&self, identity_id: &str, now: DateTime<Utc>) -> Result<CheckIn, AttendanceError> {
        let identity = self.identity(identity_id)?;
        if identity.status != IdentityStatus::Approved {
            return Err(AttendanceError::NotApproved {
                identity_id: identity_id.to_string(),
                status: identity.status,
            });
        }
        self.locks.with(identity_id, || self.check_in_locked(&identity, now))
    }

    fn check_in_locked(&self, identity: &Identity, now: DateTime<Utc>) -> Result<CheckIn, AttendanceError> {
        let id = identity.identity_id.as_str();

        if let Some(active) = self.store.get_active_session(id)? {
            if self.in_checkout_window(&active, now)? {
                let session = self.end(&active, now, EndReason::Recognition)?;
                tracing::info!(identity = id, session = %session.session_id, "session ended by recognition");
                return Ok(CheckIn::CheckedOut { session });
            }
            return Err(AttendanceError::AlreadyActive {
                identity_id: id.to_string(),
                session_id: active.session_id,
            });
        }

        let Some(occurrence) = self.live_occurrence(identity.course_id, now)? else {
            let upcoming = self.upcoming_class(identity.course_id, now)?;
            tracing::info!(
                identity = id,
                course = identity.course_id,
                next_slot = upcoming.as_ref().map(|u| u.slot_id),
                "no live slot"
            );
            return Ok(CheckIn::NoActiveSlot { upcoming });
        };

        let session = AttendanceSession::start(id, occurrence.slot_id, occurrence.date, now);
        match self.store.create_session(&session) {
            Ok(()) => {}
            // Another writer on the same store got there first.
            Err(StoreError::Conflict(_)) => {
                let session_id = self
                    .store
                    .get_active_session(id)?
                    .map(|s| s.session_id)
                    .unwrap_or_default();
                return Err(AttendanceError::AlreadyActive {
                    identity_id: id.to_string(),
                    session_id,
                });
            }
            Err(e) => return Err(e.into()),
        }

        tracing::info!(
            identity = id,
            session = %session.session_id,
            slot = session.slot_id,
            "session started"
        );
        Ok(CheckIn::Started { session })
    }

    /// The live occurrence among the course's slots. Overlaps bind to the
    /// most recently started slot.
    fn live_occurrence(&self, course_id: i64, now: DateTime<Utc>) -> Result<Option<SlotOccurrence>, StoreError> {
        let weekday = self.schedule.local_date(now).weekday();
        let mut best: Option<SlotOccurrence> = None;
        for day in [weekday, weekday.pred()] {
            for slot in self.store.slots_on(course_id, day)? {
                if let Some(occ) = self.schedule.live_occurrence(&slot, now) {
                    if best.map_or(true, |b| occ.start > b.start) {
                        best = Some(occ);
                    }
                }
            }
        }
        Ok(best)
    }

    /// Earliest upcoming class of `course_id` within the coming week.
    pub fn upcoming_class(&self, course_id: i64, now: DateTime<Utc>) -> Result<Option<UpcomingClass>, StoreError> {
        let upcoming = self
            .store
            .slots_for_course(course_id)?
            .into_iter()
            .map(|slot| {
                let occ = self.schedule.next_occurrence(&slot, now);
                UpcomingClass {
                    slot_id: slot.slot_id,
                    course_id: slot.course_id,
                    room: slot.room,
                    starts_at: occ.start,
                    starts_in_secs: (occ.start - now).num_seconds(),
                }
            })
            .filter(|u| u.starts_in_secs <= Duration::days(7).num_seconds())
            .min_by_key(|u| (u.starts_at, u.slot_id));
        Ok(upcoming)
    }

    fn in_checkout_window(&self, session: &AttendanceSession, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let Some(window) = self.policy.recognition_checkout else {
            return Ok(false);
        };
        let Some(slot) = self.store.get_slot(session.slot_id)? else {
            return Ok(false);
        };
        let end = self.schedule.occurrence_on(&slot, session.date).end;
        Ok(now >= end - window)
    }

    /// End `session_id` after confirming `probe` belongs to its holder.
    ///
    /// A mismatch leaves the session active.
    pub fn check_out(
        &self,
        session_id: &str,
        probe: &Embedding,
        now: DateTime<Utc>,
    ) -> Result<AttendanceSession, AttendanceError> {
        let session = self.session(session_id)?;
        self.locks.with(&session.identity_id, || {
            // Re-read under the lock; the sweep may have closed it.
            let session = self.session(session_id)?;
            if !session.is_active() {
                return Err(AttendanceError::AlreadyEnded(session_id.to_string()));
            }
            let holder = self.identity(&session.identity_id)?;
            if !self.verifier.verify(probe, &holder.embeddings)? {
                tracing::warn!(session = session_id, identity = %holder.identity_id, "checkout face mismatch");
                return Err(AttendanceError::FaceMismatch(session_id.to_string()));
            }
            let ended = self.end(&session, now, EndReason::Checkout)?;
            tracing::info!(session = session_id, identity = %ended.identity_id, "session checked out");
            Ok(ended)
        })
    }

    fn session(&self, session_id: &str) -> Result<AttendanceSession, AttendanceError> {
        self.store
            .get_session(session_id)?
            .ok_or_else(|| AttendanceError::UnknownSession(session_id.to_string()))
    }

    fn end(
        &self,
        session: &AttendanceSession,
        at: DateTime<Utc>,
        reason: EndReason,
    ) -> Result<AttendanceSession, AttendanceError> {
        match self.store.end_session(&session.session_id, at.max(session.start_time), reason) {
            Ok(ended) => Ok(ended),
            Err(StoreError::NotActive(id)) => Err(AttendanceError::AlreadyEnded(id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Slot end plus grace for the occurrence `session` is bound to.
    pub fn deadline(&self, session: &AttendanceSession) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self
            .store
            .get_slot(session.slot_id)?
            .map(|slot| self.schedule.occurrence_on(&slot, session.date).end + self.policy.grace))
    }

    /// Force-end every active session whose deadline has passed.
    ///
    /// Sessions end at their deadline, not at `now`. A session whose slot
    /// no longer exists ends at `now`. Per-session failures are logged and
    /// counted; the sweep carries on with the rest.
    pub fn expire_sessions(&self, now: DateTime<Utc>) -> Result<SweepReport, AttendanceError> {
        let active = self.store.list_active_sessions()?;
        let mut report = SweepReport {
            examined: active.len(),
            ..SweepReport::default()
        };

        for candidate in active {
            let result = self
                .locks
                .with(&candidate.identity_id, || self.expire_locked(&candidate.session_id, now));
            match result {
                Ok(Some(ended)) => report.expired.push(ended),
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(session = %candidate.session_id, error = %e, "failed to expire session");
                    report.failed += 1;
                }
            }
        }

        if !report.expired.is_empty() {
            tracing::info!(
                examined = report.examined,
                expired = report.expired.len(),
                failed = report.failed,
                "expiry sweep ended sessions"
            );
        }
        Ok(report)
    }

    fn expire_locked(&self, session_id: &str, now: DateTime<Utc>) -> Result<Option<AttendanceSession>, AttendanceError> {
        let Some(session) = self.store.get_session(session_id)? else {
            return Ok(None);
        };
        if !session.is_active() {
            return Ok(None);
        }
        let end_at = match self.deadline(&session)? {
            Some(deadline) if now > deadline => deadline,
            Some(_) => return Ok(None),
            None => {
                tracing::warn!(session = session_id, slot = session.slot_id, "session bound to unknown slot, ending now");
                now
            }
        };
        self.end(&session, end_at, EndReason::Expired).map(Some)
    }

    /// End every active session bound to a slot of `course_id` at `now`.
    pub fn end_course_sessions(
        &self,
        course_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<AttendanceSession>, AttendanceError> {
        let slots: HashSet<i64> = self
            .store
            .slots_for_course(course_id)?
            .into_iter()
            .map(|s| s.slot_id)
            .collect();

        let mut ended = Vec::new();
        for candidate in self.store.list_active_sessions()? {
            if !slots.contains(&candidate.slot_id) {
                continue;
            }
            let result = self.locks.with(&candidate.identity_id, || {
                let session = self.session(&candidate.session_id)?;
                self.end(&session, now, EndReason::CourseClosed)
            });
            match result {
                Ok(session) => ended.push(session),
                // Checked out or swept since the listing.
                Err(AttendanceError::AlreadyEnded(_)) => {}
                Err(e) => return Err(e),
            }
        }

        tracing::info!(course = course_id, ended = ended.len(), "course sessions closed");
        Ok(ended)
    }

    pub fn active_sessions(&self) -> Result<Vec<AttendanceSession>, AttendanceError> {
        Ok(self.store.list_active_sessions()?)
    }

    /// Every session of `identity_id`, newest first.
    pub fn history(&self, identity_id: &str) -> Result<Vec<AttendanceSession>, AttendanceError> {
        Ok(self.store.sessions_for_identity(identity_id)?)
    }
}
