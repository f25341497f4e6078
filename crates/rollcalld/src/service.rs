//! Daemon operations behind the D-Bus surface.
//!
//! Engine work (decode, detect, embed) runs on the engine thread; store and
//! session-manager calls run on the blocking pool. Nothing is persisted
//! until the engine has returned a complete result.

use crate::engine::{EngineError, EngineHandle};
use chrono::Utc;
use rollcall_attendance::{AttendanceError, AttendanceSession, AttendanceSessionManager, AttendanceStore, CheckIn};
use rollcall_core::{FaceMatcher, Gallery, Identity, IdentityStatus, MatchOutcome, RejectedImage};
use serde::Serialize;
use std::sync::{Arc, RwLock};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Attendance(#[from] AttendanceError),
    #[error("worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Serialize)]
pub struct EnrollReport {
    pub identity_id: String,
    pub status: IdentityStatus,
    pub embeddings: usize,
    pub accepted: Vec<usize>,
    pub rejected: Vec<RejectedImage>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recognition {
    pub identity_id: String,
    pub distance: f32,
}

/// Check-in result. `recognized` is absent when the probe matched nobody.
#[derive(Debug, Serialize)]
pub struct CheckInReport {
    pub recognized: Option<Recognition>,
    pub attendance: Option<CheckIn>,
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub version: &'static str,
    pub identities: usize,
    pub embeddings: usize,
    pub active_sessions: usize,
    pub recognition_threshold: f32,
}

pub struct AttendanceService<S> {
    engine: EngineHandle,
    manager: Arc<AttendanceSessionManager<S>>,
    gallery: RwLock<Arc<Gallery>>,
    recognizer: FaceMatcher,
}

impl<S: AttendanceStore + 'static> AttendanceService<S> {
    /// Build the service and take the first gallery snapshot.
    pub fn new(
        engine: EngineHandle,
        manager: Arc<AttendanceSessionManager<S>>,
        recognition_threshold: f32,
    ) -> Result<Self, AttendanceError> {
        let gallery = manager.store().load_gallery()?;
        tracing::info!(
            identities = gallery.len(),
            embeddings = gallery.embedding_count(),
            "gallery loaded"
        );
        Ok(Self {
            engine,
            manager,
            gallery: RwLock::new(Arc::new(gallery)),
            recognizer: FaceMatcher::new(recognition_threshold),
        })
    }

    pub fn manager(&self) -> &Arc<AttendanceSessionManager<S>> {
        &self.manager
    }

    /// Current read-only gallery snapshot.
    pub fn gallery(&self) -> Arc<Gallery> {
        self.gallery.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, ServiceError>
    where
        T: Send + 'static,
        F: FnOnce(&AttendanceSessionManager<S>) -> Result<T, AttendanceError> + Send + 'static,
    {
        let manager = Arc::clone(&self.manager);
        Ok(tokio::task::spawn_blocking(move || f(&manager)).await??)
    }

    /// Reload approved identities from the store.
    pub async fn refresh_gallery(&self) -> Result<usize, ServiceError> {
        let gallery = self.blocking(|m| Ok(m.store().load_gallery()?)).await?;
        let count = gallery.len();
        *self.gallery.write().unwrap_or_else(|p| p.into_inner()) = Arc::new(gallery);
        tracing::debug!(identities = count, "gallery refreshed");
        Ok(count)
    }

    pub async fn enroll(
        &self,
        identity_id: &str,
        name: &str,
        course_id: i64,
        images: Vec<Vec<u8>>,
    ) -> Result<EnrollReport, ServiceError> {
        let enrollment = self.engine.enroll(identity_id, images).await?;
        let identity = Identity {
            identity_id: identity_id.to_string(),
            name: name.to_string(),
            course_id,
            status: IdentityStatus::Pending,
            embeddings: enrollment.embeddings,
        };
        let registered = self.blocking(move |m| m.register(identity)).await?;
        Ok(EnrollReport {
            identity_id: registered.identity_id,
            status: registered.status,
            embeddings: registered.embeddings.len(),
            accepted: enrollment.accepted,
            rejected: enrollment.rejected,
        })
    }

    pub async fn approve(&self, identity_id: &str) -> Result<(), ServiceError> {
        let id = identity_id.to_string();
        self.blocking(move |m| m.approve(&id)).await?;
        self.refresh_gallery().await?;
        Ok(())
    }

    pub async fn reject(&self, identity_id: &str) -> Result<(), ServiceError> {
        let id = identity_id.to_string();
        self.blocking(move |m| m.reject(&id)).await?;
        self.refresh_gallery().await?;
        Ok(())
    }

    /// Recognize the face in `image` and run the check-in transition.
    pub async fn check_in(&self, image: Vec<u8>) -> Result<CheckInReport, ServiceError> {
        let probe = self.engine.probe(image).await?;
        let outcome = self
            .recognizer
            .find_match(&probe, &self.gallery())
            .map_err(AttendanceError::from)?;

        let MatchOutcome::Matched { identity_id, distance } = outcome else {
            tracing::info!("check-in probe matched no identity");
            return Ok(CheckInReport {
                recognized: None,
                attendance: None,
            });
        };
        tracing::info!(identity = %identity_id, distance, "probe recognized");

        let now = Utc::now();
        let id = identity_id.clone();
        let attendance = self.blocking(move |m| m.check_in(&id, now)).await?;
        Ok(CheckInReport {
            recognized: Some(Recognition { identity_id, distance }),
            attendance: Some(attendance),
        })
    }

    pub async fn check_out(&self, session_id: &str, image: Vec<u8>) -> Result<AttendanceSession, ServiceError> {
        let probe = self.engine.probe(image).await?;
        let now = Utc::now();
        let id = session_id.to_string();
        self.blocking(move |m| m.check_out(&id, &probe, now)).await
    }

    pub async fn active_sessions(&self) -> Result<Vec<AttendanceSession>, ServiceError> {
        self.blocking(|m| m.active_sessions()).await
    }

    pub async fn history(&self, identity_id: &str) -> Result<Vec<AttendanceSession>, ServiceError> {
        let id = identity_id.to_string();
        self.blocking(move |m| m.history(&id)).await
    }

    pub async fn end_course_sessions(&self, course_id: i64) -> Result<Vec<AttendanceSession>, ServiceError> {
        let now = Utc::now();
        self.blocking(move |m| m.end_course_sessions(course_id, now)).await
    }

    pub async fn status(&self) -> Result<StatusReport, ServiceError> {
        let gallery = self.gallery();
        let active = self.active_sessions().await?.len();
        Ok(StatusReport {
            version: env!("CARGO_PKG_VERSION"),
            identities: gallery.len(),
            embeddings: gallery.embedding_count(),
            active_sessions: active,
            recognition_threshold: self.recognizer.threshold(),
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::engine::tests::{png, stub_engine};
    use chrono::Duration as ChronoDuration;
    use rollcall_attendance::{MemoryStore, ScheduleWindow, SessionPolicy, TimetableSlot};
    use std::time::Duration;

    pub const COURSE: i64 = 7;

    /// A two-hour slot of `COURSE` centred on the current instant.
    pub fn live_slot() -> TimetableSlot {
        let now = Utc::now();
        let start = now - ChronoDuration::hours(1);
        let end = now + ChronoDuration::hours(1);
        TimetableSlot::new(1, COURSE, chrono::Datelike::weekday(&start), start.time(), end.time()).unwrap()
    }

    pub fn service() -> AttendanceService<MemoryStore> {
        let store = MemoryStore::new();
        store.upsert_slot(&live_slot()).unwrap();
        let manager = AttendanceSessionManager::new(Arc::new(store), ScheduleWindow::utc(), SessionPolicy::default());
        AttendanceService::new(
            stub_engine(Duration::ZERO, Duration::from_secs(5)),
            Arc::new(manager),
            0.6,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_enroll_approve_check_in_check_out() {
        let svc = service();
        let report = svc.enroll("S1", "Ada", COURSE, vec![png(120, 20), png(120, 24)]).await.unwrap();
        assert_eq!(report.status, IdentityStatus::Pending);
        assert_eq!(report.accepted, vec![0, 1]);
        assert_eq!(svc.gallery().len(), 0);

        svc.approve("S1").await.unwrap();
        assert_eq!(svc.gallery().len(), 1);

        let checked_in = svc.check_in(png(120, 22)).await.unwrap();
        assert_eq!(checked_in.recognized.as_ref().unwrap().identity_id, "S1");
        let session = match checked_in.attendance {
            Some(CheckIn::Started { session }) => session,
            other => panic!("unexpected: {other:?}"),
        };
        assert_eq!(svc.active_sessions().await.unwrap().len(), 1);

        let ended = svc.check_out(&session.session_id, png(120, 20)).await.unwrap();
        assert!(!ended.is_active());
        assert_eq!(svc.history("S1").await.unwrap().len(), 1);
        assert_eq!(svc.status().await.unwrap().active_sessions, 0);
    }

    #[tokio::test]
    async fn test_unknown_face_is_not_an_error() {
        let svc = service();
        svc.enroll("S1", "Ada", COURSE, vec![png(120, 20)]).await.unwrap();
        svc.approve("S1").await.unwrap();

        let report = svc.check_in(png(120, 250)).await.unwrap();
        assert!(report.recognized.is_none());
        assert!(report.attendance.is_none());
        assert!(svc.active_sessions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_face_enrollment_refused() {
        let svc = service();
        svc.enroll("S1", "Ada", COURSE, vec![png(120, 20)]).await.unwrap();
        svc.approve("S1").await.unwrap();

        let err = svc.enroll("S2", "Bob", COURSE, vec![png(120, 21)]).await.unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Attendance(AttendanceError::DuplicateIdentity { ref existing, .. }) if existing == "S1"
        ));
        assert!(svc.manager().store().get_identity("S2").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_enrollment_persists_nothing() {
        let svc = service();
        let err = svc.enroll("S1", "Ada", COURSE, vec![png(4, 20)]).await.unwrap_err();
        assert!(matches!(err, ServiceError::Engine(EngineError::Enroll(_))));
        assert!(svc.manager().store().get_identity("S1").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_end_course_sessions() {
        let svc = service();
        svc.enroll("S1", "Ada", COURSE, vec![png(120, 20)]).await.unwrap();
        svc.approve("S1").await.unwrap();
        svc.check_in(png(120, 20)).await.unwrap();

        assert_eq!(svc.end_course_sessions(COURSE).await.unwrap().len(), 1);
        assert!(svc.active_sessions().await.unwrap().is_empty());
    }
}
