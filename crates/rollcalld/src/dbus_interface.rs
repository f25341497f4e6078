use crate::engine::EngineError;
use crate::service::{AttendanceService, ServiceError};
use rollcall_attendance::AttendanceError;
use rollcall_core::{EnrollError, FaceError};
use rollcall_store::SqliteStore;
use serde::Serialize;
use std::sync::Arc;
use zbus::interface;

pub const BUS_NAME: &str = "org.rollcall.Attendance1";
pub const OBJECT_PATH: &str = "/org/rollcall/Attendance1";

/// D-Bus interface for the rollcall attendance daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
pub struct AttendanceBus {
    service: Arc<AttendanceService<SqliteStore>>,
}

impl AttendanceBus {
    pub fn new(service: Arc<AttendanceService<SqliteStore>>) -> Self {
        Self { service }
    }
}

impl From<ServiceError> for zbus::fdo::Error {
    fn from(e: ServiceError) -> Self {
        use zbus::fdo::Error as Fdo;
        let msg = e.to_string();
        match e {
            ServiceError::Engine(EngineError::Timeout(_)) => Fdo::TimedOut(msg),
            ServiceError::Engine(
                EngineError::Decode { .. }
                | EngineError::Face(FaceError::Rejected(_))
                | EngineError::Enroll(EnrollError::NoUsableFaces { .. }),
            ) => Fdo::InvalidArgs(msg),
            ServiceError::Attendance(
                AttendanceError::UnknownIdentity(_) | AttendanceError::UnknownSession(_),
            ) => Fdo::InvalidArgs(msg),
            ServiceError::Attendance(AttendanceError::FaceMismatch(_)) => Fdo::AccessDenied(msg),
            _ => Fdo::Failed(msg),
        }
    }
}

fn to_json<T: Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(format!("encoding reply: {e}")))
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceBus {
    /// Enroll an identity from encoded photos. The identity starts pending.
    async fn enroll(
        &self,
        identity_id: &str,
        name: &str,
        course_id: i64,
        images: Vec<Vec<u8>>,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(identity = identity_id, course = course_id, photos = images.len(), "enroll requested");
        let report = self.service.enroll(identity_id, name, course_id, images).await?;
        to_json(&report)
    }

    async fn approve(&self, identity_id: &str) -> zbus::fdo::Result<()> {
        tracing::info!(identity = identity_id, "approve requested");
        Ok(self.service.approve(identity_id).await?)
    }

    async fn reject(&self, identity_id: &str) -> zbus::fdo::Result<()> {
        tracing::info!(identity = identity_id, "reject requested");
        Ok(self.service.reject(identity_id).await?)
    }

    /// Recognize the captured face and open (or close) its session.
    async fn check_in(&self, image: Vec<u8>) -> zbus::fdo::Result<String> {
        tracing::debug!(bytes = image.len(), "check-in requested");
        let report = self.service.check_in(image).await?;
        to_json(&report)
    }

    /// End a session after confirming the captured face is its holder.
    async fn check_out(&self, session_id: &str, image: Vec<u8>) -> zbus::fdo::Result<String> {
        tracing::debug!(session = session_id, bytes = image.len(), "check-out requested");
        let session = self.service.check_out(session_id, image).await?;
        to_json(&session)
    }

    async fn active_sessions(&self) -> zbus::fdo::Result<String> {
        to_json(&self.service.active_sessions().await?)
    }

    async fn history(&self, identity_id: &str) -> zbus::fdo::Result<String> {
        to_json(&self.service.history(identity_id).await?)
    }

    /// End every active session of a course now. Returns how many ended.
    async fn end_course_sessions(&self, course_id: i64) -> zbus::fdo::Result<u32> {
        tracing::info!(course = course_id, "end course sessions requested");
        let ended = self.service.end_course_sessions(course_id).await?;
        Ok(ended.len() as u32)
    }

    async fn status(&self) -> zbus::fdo::Result<String> {
        to_json(&self.service.status().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::ImageRejection;
    use std::time::Duration;

    #[test]
    fn test_error_mapping() {
        let fdo = |e: ServiceError| zbus::fdo::Error::from(e);

        assert!(matches!(
            fdo(ServiceError::Engine(EngineError::Timeout(Duration::from_secs(15)))),
            zbus::fdo::Error::TimedOut(_)
        ));
        assert!(matches!(
            fdo(ServiceError::Engine(EngineError::Face(FaceError::Rejected(
                ImageRejection::AmbiguousFaceCount(2)
            )))),
            zbus::fdo::Error::InvalidArgs(_)
        ));
        assert!(matches!(
            fdo(ServiceError::Attendance(AttendanceError::FaceMismatch("s".into()))),
            zbus::fdo::Error::AccessDenied(_)
        ));
        match fdo(ServiceError::Attendance(AttendanceError::AlreadyEnded("abc".into()))) {
            zbus::fdo::Error::Failed(msg) => assert!(msg.contains("abc")),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
