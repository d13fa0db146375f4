//! Durable grant history and audit trail backed by `SQLite`.
//!
//! Two tables:
//!
//! - `permissions`: one row per `(file_path, task_id)` grant with its current
//!   status (`active`, `expired`, `revoked`).
//! - `access_log`: append-only audit rows. Rows are never updated or deleted.

use crate::error::Result;
use crate::types::{AuditAction, AuditEvent, Grant, GrantStatus};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, Row};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS permissions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    file_path TEXT NOT NULL,
    task_id TEXT NOT NULL,
    granted_at TEXT NOT NULL,
    expires_at TEXT NOT NULL,
    agent_name TEXT NOT NULL,
    permission_type TEXT NOT NULL DEFAULT 'write',
    status TEXT NOT NULL DEFAULT 'active',
    UNIQUE(file_path, task_id)
);
CREATE TABLE IF NOT EXISTS access_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    file_path TEXT NOT NULL,
    action TEXT NOT NULL,
    task_id TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    success INTEGER NOT NULL,
    error_msg TEXT
);
CREATE INDEX IF NOT EXISTS idx_access_log_path ON access_log(file_path);
";

/// The system of record for every grant, revoke, expiry and lockdown.
#[derive(Debug)]
pub struct PermissionLedger {
    conn: Mutex<Connection>,
}

impl PermissionLedger {
    /// Open (or create) the ledger file at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                debug!("Creating ledger directory {:?}", parent);
                fs::create_dir_all(parent)?;
            }
        }

        info!("Opening permission ledger at {:?}", path);
        Self::from_connection(Connection::open(path)?)
    }

    /// A ledger that lives only as long as the process.
    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Commit a grant in one transaction: close the row of the grant it
    /// supersedes (if any), upsert the new active row and append `events`.
    /// Either all of it lands or none of it does. A repeat grant for the same
    /// path and task reactivates the existing row with the new window.
    pub fn record_grant(
        &self,
        grant: &Grant,
        superseded: Option<&Grant>,
        events: &[AuditEvent],
    ) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        if let Some(prior) = superseded {
            close_row(&tx, &prior.canonical_path, &prior.task_id, GrantStatus::Revoked)?;
        }
        tx.execute(
            "INSERT INTO permissions
                 (file_path, task_id, granted_at, expires_at, agent_name, permission_type, status)
             VALUES (?1, ?2, ?3, ?4, ?5, 'write', ?6)
             ON CONFLICT(file_path, task_id) DO UPDATE SET
                 granted_at = excluded.granted_at,
                 expires_at = excluded.expires_at,
                 agent_name = excluded.agent_name,
                 status = excluded.status",
            params![
                path_key(&grant.canonical_path),
                grant.task_id,
                grant.granted_at,
                grant.expires_at,
                grant.agent_name,
                GrantStatus::Active.as_str(),
            ],
        )?;
        for event in events {
            insert_event(&tx, event)?;
        }
        tx.commit()?;
        debug!(
            "Recorded grant for {:?} (task {})",
            grant.canonical_path, grant.task_id
        );
        Ok(())
    }

    /// Move an active grant row to a terminal status. Returns whether a row
    /// was updated.
    pub fn close_grant(&self, path: &Path, task_id: &str, status: GrantStatus) -> Result<bool> {
        let conn = self.conn.lock();
        let closed = close_row(&conn, path, task_id, status)?;
        if !closed {
            warn!(
                "No active ledger row for {:?} (task {}) to mark {}",
                path, task_id, status
            );
        }
        Ok(closed)
    }

    /// Mark every row still `active` as `revoked`. Used at startup, when the
    /// whole tree has just been re-locked and no grant survives.
    pub fn revoke_all_active(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE permissions SET status = 'revoked' WHERE status = 'active'",
            [],
        )?;
        Ok(updated)
    }

    pub fn append(&self, event: &AuditEvent) -> Result<()> {
        let conn = self.conn.lock();
        insert_event(&conn, event)?;
        Ok(())
    }

    /// Most recent audit rows, newest first.
    pub fn recent_events(&self, limit: usize) -> Result<Vec<AuditEvent>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT file_path, action, task_id, timestamp, success, error_msg
             FROM access_log ORDER BY id DESC LIMIT ?1",
        )?;
        let events = stmt
            .query_map(params![limit as i64], audit_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(events)
    }

    /// Audit rows for one file, oldest first.
    pub fn events_for_path(&self, path: &Path) -> Result<Vec<AuditEvent>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT file_path, action, task_id, timestamp, success, error_msg
             FROM access_log WHERE file_path = ?1 ORDER BY id ASC",
        )?;
        let events = stmt
            .query_map(params![path_key(path)], audit_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(events)
    }

    pub fn events_with_action(&self, action: AuditAction) -> Result<Vec<AuditEvent>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT file_path, action, task_id, timestamp, success, error_msg
             FROM access_log WHERE action = ?1 ORDER BY id ASC",
        )?;
        let events = stmt
            .query_map(params![action.as_str()], audit_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(events)
    }

    /// Every grant ever recorded for one file.
    pub fn grants_for_path(&self, path: &Path) -> Result<Vec<Grant>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT file_path, task_id, agent_name, granted_at, expires_at, status
             FROM permissions WHERE file_path = ?1 ORDER BY id ASC",
        )?;
        let grants = stmt
            .query_map(params![path_key(path)], grant_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(grants)
    }

    pub fn event_count(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM access_log", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

fn close_row(
    conn: &Connection,
    path: &Path,
    task_id: &str,
    status: GrantStatus,
) -> rusqlite::Result<bool> {
    let updated = conn.execute(
        "UPDATE permissions SET status = ?1
         WHERE file_path = ?2 AND task_id = ?3 AND status = 'active'",
        params![status.as_str(), path_key(path), task_id],
    )?;
    Ok(updated > 0)
}

fn insert_event(conn: &Connection, event: &AuditEvent) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO access_log (file_path, action, task_id, timestamp, success, error_msg)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            event.file_path,
            event.action.as_str(),
            event.task_id,
            event.timestamp,
            event.success,
            event.error_message,
        ],
    )?;
    Ok(())
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn parse_column<T>(idx: usize, value: String) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    value
        .parse()
        .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

fn audit_from_row(row: &Row<'_>) -> rusqlite::Result<AuditEvent> {
    let action: String = row.get(1)?;
    let timestamp: DateTime<Utc> = row.get(3)?;
    Ok(AuditEvent {
        file_path: row.get(0)?,
        action: parse_column(1, action)?,
        task_id: row.get(2)?,
        timestamp,
        success: row.get(4)?,
        error_message: row.get(5)?,
    })
}

fn grant_from_row(row: &Row<'_>) -> rusqlite::Result<Grant> {
    let path: String = row.get(0)?;
    let status: String = row.get(5)?;
    Ok(Grant {
        canonical_path: PathBuf::from(path),
        task_id: row.get(1)?,
        agent_name: row.get(2)?,
        granted_at: row.get(3)?,
        expires_at: row.get(4)?,
        status: parse_column(5, status)?,
    })
}
