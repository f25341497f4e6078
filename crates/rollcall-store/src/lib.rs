//! rollcall-store: SQLite persistence for rollcall.
//!
//! Embeddings are stored as little-endian f32 blobs, timestamps as UTC
//! RFC 3339 text. The single-active-session rule is enforced by a partial
//! unique index, so it holds even across processes sharing one database.

mod helpers;
mod migrations;

use chrono::{DateTime, Utc, Weekday};
use helpers::*;
use rollcall_attendance::{AttendanceSession, AttendanceStore, EndReason, StoreError, TimetableSlot};
use rollcall_core::{Embedding, Gallery, Identity, IdentityStatus};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SqliteError {
    #[error(transparent)]
    Sql(#[from] rusqlite::Error),
    #[error("schema: {0}")]
    Schema(String),
    #[error("corrupt {field}: {value:?}")]
    Corrupt { field: &'static str, value: String },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
    #[error("session {0} is not active")]
    NotActive(String),
}

impl From<SqliteError> for StoreError {
    fn from(e: SqliteError) -> Self {
        match e {
            SqliteError::Conflict(msg) => StoreError::Conflict(msg),
            SqliteError::NotFound { kind, id } => StoreError::NotFound { kind, id },
            SqliteError::NotActive(id) => StoreError::NotActive(id),
            SqliteError::Corrupt { field, value } => StoreError::Corrupt(format!("{field}: {value:?}")),
            other => StoreError::backend(other),
        }
    }
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(e, rusqlite::Error::SqliteFailure(f, _) if f.code == ErrorCode::ConstraintViolation)
}

const SESSION_COLUMNS: &str = "session_id, identity_id, slot_id, date, start_time, end_time, status, end_reason";
const SLOT_COLUMNS: &str = "slot_id, course_id, day, start_time, end_time, room";

fn row_to_session(row: &Row) -> Result<AttendanceSession, SqliteError> {
    let date: String = row.get("date")?;
    let start_time: String = row.get("start_time")?;
    let end_time: Option<String> = row.get("end_time")?;
    let status: String = row.get("status")?;
    let end_reason: Option<String> = row.get("end_reason")?;

    Ok(AttendanceSession {
        session_id: row.get("session_id")?,
        identity_id: row.get("identity_id")?,
        slot_id: row.get("slot_id")?,
        date: parse_date(&date)?,
        start_time: parse_datetime(&start_time, "start_time")?,
        end_time: parse_optional_datetime(end_time, "end_time")?,
        status: parse_session_status(&status)?,
        end_reason: parse_end_reason(end_reason)?,
    })
}

fn row_to_slot(row: &Row) -> Result<TimetableSlot, SqliteError> {
    let start: String = row.get("start_time")?;
    let end: String = row.get("end_time")?;
    Ok(TimetableSlot {
        slot_id: row.get("slot_id")?,
        course_id: row.get("course_id")?,
        day: weekday_from_i64(row.get("day")?)?,
        start_time: parse_time(&start, "start_time")?,
        end_time: parse_time(&end, "end_time")?,
        room: row.get("room")?,
    })
}

/// Run `sql` and decode every row with `decode`.
fn query_all<T>(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
    decode: fn(&Row) -> Result<T, SqliteError>,
) -> Result<Vec<T>, SqliteError> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(decode(row)?);
    }
    Ok(out)
}

fn query_one<T>(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
    decode: fn(&Row) -> Result<T, SqliteError>,
) -> Result<Option<T>, SqliteError> {
    Ok(query_all(conn, sql, params, decode)?.into_iter().next())
}

fn load_embeddings(conn: &Connection, identity_id: &str) -> Result<Vec<Embedding>, SqliteError> {
    let mut stmt = conn.prepare(
        "SELECT dimension, model_version, vector FROM embeddings
         WHERE identity_id = ?1
         ORDER BY position",
    )?;
    let mut rows = stmt.query(params![identity_id])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let dimension: i64 = row.get("dimension")?;
        let model_version: Option<String> = row.get("model_version")?;
        let blob: Vec<u8> = row.get("vector")?;
        let embedding = Embedding::from_le_bytes(&blob, model_version)
            .filter(|e| e.dimension() as i64 == dimension)
            .ok_or_else(|| SqliteError::Corrupt {
                field: "embedding",
                value: format!("{identity_id}: {} bytes for dimension {dimension}", blob.len()),
            })?;
        out.push(embedding);
    }
    Ok(out)
}

/// SQLite-backed [`AttendanceStore`].
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SqliteError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| SqliteError::Schema(format!("{}: {e}", parent.display())))?;
            }
        }
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        tracing::info!(path = %path.display(), "opened attendance database");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, SqliteError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(mut conn: Connection) -> Result<Self, SqliteError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations::run_migrations(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn with<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T, SqliteError>) -> Result<T, StoreError> {
        let mut conn = self.conn();
        Ok(f(&mut conn)?)
    }
}

impl AttendanceStore for SqliteStore {
    fn load_gallery(&self) -> Result<Gallery, StoreError> {
        self.with(|conn| {
            let ids: Vec<String> = {
                let mut stmt = conn.prepare(
                    "SELECT identity_id FROM identities WHERE status = ?1 ORDER BY rowid",
                )?;
                let rows = stmt.query_map(params![IdentityStatus::Approved.as_str()], |row| row.get(0))?;
                rows.collect::<Result<Vec<String>, rusqlite::Error>>()?
            };
            let mut gallery = Gallery::new();
            for id in ids {
                let embeddings = load_embeddings(conn, &id)?;
                gallery.insert(id, embeddings);
            }
            Ok(gallery)
        })
    }

    fn save_identity(&self, identity: &Identity) -> Result<(), StoreError> {
        self.with(|conn| {
            let tx = conn.transaction()?;
            let inserted = tx.execute(
                "INSERT INTO identities (identity_id, name, course_id, status) VALUES (?1, ?2, ?3, ?4)",
                params![
                    identity.identity_id,
                    identity.name,
                    identity.course_id,
                    identity.status.as_str(),
                ],
            );
            match inserted {
                Err(e) if is_constraint_violation(&e) => {
                    return Err(SqliteError::Conflict(format!(
                        "identity {} already enrolled",
                        identity.identity_id
                    )));
                }
                other => {
                    other?;
                }
            }
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO embeddings (identity_id, position, dimension, model_version, vector)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )?;
                for (position, embedding) in identity.embeddings.iter().enumerate() {
                    stmt.execute(params![
                        identity.identity_id,
                        position as i64,
                        embedding.dimension() as i64,
                        embedding.model_version,
                        embedding.to_le_bytes(),
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    fn get_identity(&self, identity_id: &str) -> Result<Option<Identity>, StoreError> {
        self.with(|conn| {
            let row = conn
                .query_row(
                    "SELECT name, course_id, status FROM identities WHERE identity_id = ?1",
                    params![identity_id],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?, row.get::<_, String>(2)?)),
                )
                .optional()?;
            let Some((name, course_id, status)) = row else {
                return Ok(None);
            };
            Ok(Some(Identity {
                identity_id: identity_id.to_string(),
                name,
                course_id,
                status: parse_identity_status(&status)?,
                embeddings: load_embeddings(conn, identity_id)?,
            }))
        })
    }

    fn set_identity_status(&self, identity_id: &str, status: IdentityStatus) -> Result<(), StoreError> {
        self.with(|conn| {
            let changed = conn.execute(
                "UPDATE identities SET status = ?1 WHERE identity_id = ?2",
                params![status.as_str(), identity_id],
            )?;
            if changed == 0 {
                return Err(SqliteError::NotFound {
                    kind: "identity",
                    id: identity_id.to_string(),
                });
            }
            Ok(())
        })
    }

    fn get_active_session(&self, identity_id: &str) -> Result<Option<AttendanceSession>, StoreError> {
        self.with(|conn| {
            query_one(
                conn,
                &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE identity_id = ?1 AND status = 'active'"),
                params![identity_id],
                row_to_session,
            )
        })
    }

    fn get_session(&self, session_id: &str) -> Result<Option<AttendanceSession>, StoreError> {
        self.with(|conn| {
            query_one(
                conn,
                &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE session_id = ?1"),
                params![session_id],
                row_to_session,
            )
        })
    }

    fn create_session(&self, session: &AttendanceSession) -> Result<(), StoreError> {
        self.with(|conn| {
            let result = conn.execute(
                &format!("INSERT INTO sessions ({SESSION_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
                params![
                    session.session_id,
                    session.identity_id,
                    session.slot_id,
                    session.date.to_string(),
                    format_datetime(&session.start_time),
                    session.end_time.as_ref().map(format_datetime),
                    session.status.as_str(),
                    session.end_reason.map(|r| r.as_str()),
                ],
            );
            match result {
                Ok(_) => Ok(()),
                Err(e) if is_constraint_violation(&e) => Err(SqliteError::Conflict(format!(
                    "identity {} already has an active session",
                    session.identity_id
                ))),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn end_session(
        &self,
        session_id: &str,
        end_time: DateTime<Utc>,
        reason: EndReason,
    ) -> Result<AttendanceSession, StoreError> {
        self.with(|conn| {
            let tx = conn.transaction()?;
            let mut session = query_one(
                &tx,
                &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE session_id = ?1"),
                params![session_id],
                row_to_session,
            )?
            .ok_or_else(|| SqliteError::NotFound {
                kind: "session",
                id: session_id.to_string(),
            })?;
            if !session.is_active() {
                return Err(SqliteError::NotActive(session_id.to_string()));
            }

            session.close(end_time, reason);
            let changed = tx.execute(
                "UPDATE sessions
                 SET status = ?1,
                     end_time = ?2,
                     end_reason = ?3
                 WHERE session_id = ?4 AND status = 'active'",
                params![
                    session.status.as_str(),
                    session.end_time.as_ref().map(format_datetime),
                    reason.as_str(),
                    session_id,
                ],
            )?;
            if changed == 0 {
                return Err(SqliteError::NotActive(session_id.to_string()));
            }
            tx.commit()?;
            Ok(session)
        })
    }

    fn list_active_sessions(&self) -> Result<Vec<AttendanceSession>, StoreError> {
        self.with(|conn| {
            query_all(
                conn,
                &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE status = 'active' ORDER BY start_time"),
                [],
                row_to_session,
            )
        })
    }

    fn sessions_for_identity(&self, identity_id: &str) -> Result<Vec<AttendanceSession>, StoreError> {
        self.with(|conn| {
            query_all(
                conn,
                &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE identity_id = ?1 ORDER BY start_time DESC"),
                params![identity_id],
                row_to_session,
            )
        })
    }

    fn slots_on(&self, course_id: i64, day: Weekday) -> Result<Vec<TimetableSlot>, StoreError> {
        self.with(|conn| {
            query_all(
                conn,
                &format!("SELECT {SLOT_COLUMNS} FROM timetable_slots WHERE course_id = ?1 AND day = ?2 ORDER BY start_time"),
                params![course_id, weekday_to_i64(day)],
                row_to_slot,
            )
        })
    }

    fn slots_for_course(&self, course_id: i64) -> Result<Vec<TimetableSlot>, StoreError> {
        self.with(|conn| {
            query_all(
                conn,
                &format!("SELECT {SLOT_COLUMNS} FROM timetable_slots WHERE course_id = ?1 ORDER BY day, start_time"),
                params![course_id],
                row_to_slot,
            )
        })
    }

    fn get_slot(&self, slot_id: i64) -> Result<Option<TimetableSlot>, StoreError> {
        self.with(|conn| {
            query_one(
                conn,
                &format!("SELECT {SLOT_COLUMNS} FROM timetable_slots WHERE slot_id = ?1"),
                params![slot_id],
                row_to_slot,
            )
        })
    }

    fn upsert_slot(&self, slot: &TimetableSlot) -> Result<(), StoreError> {
        self.with(|conn| {
            conn.execute(
                &format!(
                    "INSERT INTO timetable_slots ({SLOT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT (slot_id) DO UPDATE SET
                         course_id = excluded.course_id,
                         day = excluded.day,
                         start_time = excluded.start_time,
                         end_time = excluded.end_time,
                         room = excluded.room"
                ),
                params![
                    slot.slot_id,
                    slot.course_id,
                    weekday_to_i64(slot.day),
                    format_time(&slot.start_time),
                    format_time(&slot.end_time),
                    slot.room,
                ],
            )?;
            Ok(())
        })
    }
}
