//! Execution history: one row per handler invocation.
//!
//! An execution is inserted as `running` when an occurrence is claimed (or a
//! retry starts) and moves to a terminal status exactly once.

use crate::storage::{decode_time, decode_uuid, encode_time};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A record of a single handler invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Execution {
    pub id: Uuid,
    pub job_id: Uuid,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub error: Option<String>,
    /// 0 for the scheduled attempt, then 1..=retry_count.
    pub retry_attempt: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Success,
    Failed,
    Timeout,
}

impl ExecutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Timeout => "timeout",
        }
    }

    pub fn is_terminal(self) -> bool {
        self != ExecutionStatus::Running
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(ExecutionStatus::Running),
            "success" => Ok(ExecutionStatus::Success),
            "failed" => Ok(ExecutionStatus::Failed),
            "timeout" => Ok(ExecutionStatus::Timeout),
            other => Err(format!("unknown execution status: {other}")),
        }
    }
}

pub(crate) const EXECUTION_COLUMNS: &str =
    "id, job_id, status, started_at, finished_at, duration_ms, error, retry_attempt";

pub(crate) fn execution_from_row(row: &Row<'_>) -> rusqlite::Result<Execution> {
    let status: String = row.get(2)?;
    let status = status.parse::<ExecutionStatus>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, e.into())
    })?;
    let finished_at = match row.get::<_, Option<String>>(4)? {
        Some(raw) => Some(decode_time(4, &raw)?),
        None => None,
    };

    Ok(Execution {
        id: decode_uuid(0, &row.get::<_, String>(0)?)?,
        job_id: decode_uuid(1, &row.get::<_, String>(1)?)?,
        status,
        started_at: decode_time(3, &row.get::<_, String>(3)?)?,
        finished_at,
        duration_ms: row.get(5)?,
        error: row.get(6)?,
        retry_attempt: row.get(7)?,
    })
}

/// Insert a new `running` execution.
pub(crate) fn insert_running(
    conn: &Connection,
    job_id: Uuid,
    retry_attempt: u32,
    now: DateTime<Utc>,
) -> rusqlite::Result<Execution> {
    let execution = Execution {
        id: Uuid::new_v4(),
        job_id,
        status: ExecutionStatus::Running,
        started_at: now,
        finished_at: None,
        duration_ms: None,
        error: None,
        retry_attempt,
    };
    conn.execute(
        "INSERT INTO executions (id, job_id, status, started_at, retry_attempt)
         VALUES (?1, ?2, 'running', ?3, ?4)",
        params![
            execution.id.to_string(),
            job_id.to_string(),
            encode_time(now),
            retry_attempt
        ],
    )?;
    Ok(execution)
}

/// Move a `running` execution to a terminal status.
///
/// Returns `false` when the row is missing or already terminal; in that case
/// nothing is written.
pub(crate) fn mark_terminal(
    conn: &Connection,
    execution_id: Uuid,
    status: ExecutionStatus,
    error: Option<&str>,
    now: DateTime<Utc>,
) -> rusqlite::Result<bool> {
    debug_assert!(status.is_terminal());
    let Some(execution) = get(conn, execution_id)? else {
        return Ok(false);
    };
    if execution.status.is_terminal() {
        return Ok(false);
    }

    let duration_ms = (now - execution.started_at).num_milliseconds().max(0);
    let changed = conn.execute(
        "UPDATE executions
         SET status = ?1, finished_at = ?2, duration_ms = ?3, error = ?4
         WHERE id = ?5 AND status = 'running'",
        params![
            status.as_str(),
            encode_time(now),
            duration_ms,
            error,
            execution_id.to_string()
        ],
    )?;
    Ok(changed == 1)
}

pub(crate) fn get(conn: &Connection, execution_id: Uuid) -> rusqlite::Result<Option<Execution>> {
    conn.query_row(
        &format!("SELECT {EXECUTION_COLUMNS} FROM executions WHERE id = ?1"),
        [execution_id.to_string()],
        execution_from_row,
    )
    .optional()
}

/// Executions of a job, newest first.
pub(crate) fn list_for_job(
    conn: &Connection,
    job_id: Uuid,
    limit: usize,
) -> rusqlite::Result<Vec<Execution>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {EXECUTION_COLUMNS} FROM executions
         WHERE job_id = ?1
         ORDER BY started_at DESC, retry_attempt DESC
         LIMIT ?2"
    ))?;
    let rows = stmt.query_map(params![job_id.to_string(), limit as i64], execution_from_row)?;
    rows.collect()
}

/// Cap a persisted error message at `max_chars` characters.
pub fn truncate_error(message: &str, max_chars: usize) -> String {
    const MARKER: &str = "...";
    if message.chars().count() <= max_chars {
        return message.to_string();
    }
    let keep = max_chars.saturating_sub(MARKER.len());
    let mut out: String = message.chars().take(keep).collect();
    out.push_str(&MARKER[..max_chars.min(MARKER.len())]);
    out
}
