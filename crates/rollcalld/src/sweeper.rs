use chrono::Utc;
use rollcall_attendance::{AttendanceSessionManager, AttendanceStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Run the expiry sweep every `period` until the task is aborted.
///
/// The first sweep happens immediately so sessions left open while the
/// daemon was down are closed at startup.
pub fn spawn_sweeper<S: AttendanceStore + 'static>(
    manager: Arc<AttendanceSessionManager<S>>,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(period_secs = period.as_secs(), "expiry sweeper started");

        loop {
            interval.tick().await;
            let manager = Arc::clone(&manager);
            match tokio::task::spawn_blocking(move || manager.expire_sessions(Utc::now())).await {
                Ok(Ok(report)) => tracing::debug!(
                    examined = report.examined,
                    expired = report.expired.len(),
                    failed = report.failed,
                    "expiry sweep finished"
                ),
                Ok(Err(e)) => tracing::error!(error = %e, "expiry sweep failed"),
                Err(e) => tracing::error!(error = %e, "expiry sweep task panicked"),
            }
        }
    })
}
