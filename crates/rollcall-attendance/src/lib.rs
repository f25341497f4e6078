//! rollcall-attendance: Attendance sessions bound to a weekly timetable.
//!
//! A recognized identity opens a session when one of its course's slots is
//! live; the session closes on a face-verified checkout or is reclaimed by
//! the periodic expiry sweep once the slot end plus a grace period passes.

pub mod locks;
pub mod manager;
pub mod memory;
pub mod schedule;
pub mod session;
pub mod store;

pub use manager::{AttendanceError, AttendanceSessionManager, CheckIn, SessionPolicy, SweepReport, UpcomingClass};
pub use memory::MemoryStore;
pub use schedule::{ScheduleError, ScheduleWindow, SlotOccurrence, TimetableSlot};
pub use session::{AttendanceSession, EndReason, SessionStatus};
pub use store::{AttendanceStore, StoreError};
