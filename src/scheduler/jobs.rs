use super::history::{self, Execution, ExecutionStatus};
use super::schedule::{compute_next_run, next_occurrence_across_years, parse_timezone};
use super::{Result, SchedulerError};
use crate::cron;
use crate::storage::{decode_time, decode_uuid, encode_time, Pool};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

pub const MIN_TIMEOUT_SECONDS: u32 = 1;
pub const MAX_TIMEOUT_SECONDS: u32 = 300;
pub const DEFAULT_TIMEOUT_SECONDS: u32 = 30;
pub const MAX_RETRY_COUNT: u32 = 5;

/// A persisted job definition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobDefinition {
    pub id: Uuid,
    pub project_id: String,
    pub name: String,
    /// Raw five-field cron expression.
    pub schedule: String,
    /// IANA timezone the schedule is evaluated in.
    pub timezone: String,
    /// Handler target, always starting with `/`.
    pub path: String,
    pub enabled: bool,
    pub timeout_seconds: u32,
    pub retry_count: u32,
    /// Next scheduled occurrence; `None` exactly when the job is disabled.
    pub next_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for [`JobStore::create`].
#[derive(Debug, Clone, Deserialize)]
pub struct NewJob {
    pub project_id: String,
    pub name: String,
    pub schedule: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    pub path: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub timeout_seconds: Option<u32>,
    #[serde(default)]
    pub retry_count: Option<u32>,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_enabled() -> bool {
    true
}

/// Partial update for [`JobStore::update`]. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobPatch {
    pub name: Option<String>,
    pub schedule: Option<String>,
    pub timezone: Option<String>,
    pub path: Option<String>,
    pub enabled: Option<bool>,
    pub timeout_seconds: Option<u32>,
    pub retry_count: Option<u32>,
}

/// Result of an attempt to claim a due occurrence.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// This caller owns the occurrence; `execution` is its `running` record.
    Claimed {
        job: JobDefinition,
        execution: Execution,
    },
    /// Another tick or instance already advanced `next_run_at`.
    Lost,
    /// The occurrence was consumed but skipped because an earlier invocation
    /// of the same job is still running.
    Overlapping,
}

fn clamp_timeout(value: u32) -> u32 {
    value.clamp(MIN_TIMEOUT_SECONDS, MAX_TIMEOUT_SECONDS)
}

fn clamp_retries(value: u32) -> u32 {
    value.min(MAX_RETRY_COUNT)
}

/// Check user-editable fields. Returns the next run after `now`, which also
/// proves the schedule can fire at all.
fn validate_definition(
    name: &str,
    schedule: &str,
    timezone: &str,
    path: &str,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>> {
    if name.trim().is_empty() {
        return Err(SchedulerError::EmptyName);
    }
    if !path.starts_with('/') {
        return Err(SchedulerError::InvalidPath(path.to_string()));
    }
    compute_next_run(schedule, timezone, now)
}

const JOB_COLUMNS: &str = "id, project_id, name, schedule, timezone, path, enabled, \
     timeout_seconds, retry_count, next_run_at, created_at, updated_at";

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<JobDefinition> {
    let next_run_at = match row.get::<_, Option<String>>(9)? {
        Some(raw) => Some(decode_time(9, &raw)?),
        None => None,
    };
    Ok(JobDefinition {
        id: decode_uuid(0, &row.get::<_, String>(0)?)?,
        project_id: row.get(1)?,
        name: row.get(2)?,
        schedule: row.get(3)?,
        timezone: row.get(4)?,
        path: row.get(5)?,
        enabled: row.get::<_, i64>(6)? != 0,
        timeout_seconds: row.get(7)?,
        retry_count: row.get(8)?,
        next_run_at,
        created_at: decode_time(10, &row.get::<_, String>(10)?)?,
        updated_at: decode_time(11, &row.get::<_, String>(11)?)?,
    })
}

fn load_job(conn: &Connection, id: Uuid) -> Result<JobDefinition> {
    conn.query_row(
        &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
        [id.to_string()],
        job_from_row,
    )
    .optional()?
    .ok_or(SchedulerError::JobNotFound(id))
}

/// Durable store for job definitions and their executions.
///
/// All coordination between dispatchers goes through conditional writes on
/// `jobs.next_run_at`, so several processes can share one database file.
#[derive(Clone)]
pub struct JobStore {
    pool: Pool,
}

impl JobStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Create a job. When enabled, `next_run_at` is computed from `now`.
    pub fn create(&self, new: NewJob, now: DateTime<Utc>) -> Result<JobDefinition> {
        let next = validate_definition(&new.name, &new.schedule, &new.timezone, &new.path, now)?;

        let job = JobDefinition {
            id: Uuid::new_v4(),
            project_id: new.project_id,
            name: new.name.trim().to_string(),
            schedule: new.schedule.trim().to_string(),
            timezone: new.timezone,
            path: new.path,
            enabled: new.enabled,
            timeout_seconds: clamp_timeout(new.timeout_seconds.unwrap_or(DEFAULT_TIMEOUT_SECONDS)),
            retry_count: clamp_retries(new.retry_count.unwrap_or(0)),
            next_run_at: new.enabled.then_some(next),
            created_at: now,
            updated_at: now,
        };

        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO jobs (id, project_id, name, schedule, timezone, path, enabled,
                               timeout_seconds, retry_count, next_run_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
            params![
                job.id.to_string(),
                job.project_id,
                job.name,
                job.schedule,
                job.timezone,
                job.path,
                job.enabled,
                job.timeout_seconds,
                job.retry_count,
                job.next_run_at.map(encode_time),
                encode_time(now),
            ],
        )?;

        info!(job_id = %job.id, name = %job.name, schedule = %job.schedule, next_run_at = ?job.next_run_at, "job created");
        Ok(job)
    }

    pub fn get(&self, id: Uuid) -> Result<JobDefinition> {
        let conn = self.pool.get()?;
        load_job(&conn, id)
    }

    /// List jobs, optionally for one project, oldest first.
    pub fn list(&self, project_id: Option<&str>) -> Result<Vec<JobDefinition>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE ?1 IS NULL OR project_id = ?1
             ORDER BY created_at, id"
        ))?;
        let rows = stmt.query_map([project_id], job_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Apply a partial update.
    ///
    /// `next_run_at` is recomputed from `now` whenever the schedule or timezone
    /// changes or the job is re-enabled, and cleared when it is disabled.
    pub fn update(&self, id: Uuid, patch: JobPatch, now: DateTime<Utc>) -> Result<JobDefinition> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = load_job(&tx, id)?;

        let mut job = current.clone();
        if let Some(name) = patch.name {
            job.name = name.trim().to_string();
        }
        if let Some(schedule) = patch.schedule {
            job.schedule = schedule.trim().to_string();
        }
        if let Some(timezone) = patch.timezone {
            job.timezone = timezone;
        }
        if let Some(path) = patch.path {
            job.path = path;
        }
        if let Some(enabled) = patch.enabled {
            job.enabled = enabled;
        }
        if let Some(timeout) = patch.timeout_seconds {
            job.timeout_seconds = clamp_timeout(timeout);
        }
        if let Some(retries) = patch.retry_count {
            job.retry_count = clamp_retries(retries);
        }

        let next = validate_definition(&job.name, &job.schedule, &job.timezone, &job.path, now)?;
        let schedule_changed = job.schedule != current.schedule || job.timezone != current.timezone;
        let re_enabled = job.enabled && !current.enabled;

        job.next_run_at = if !job.enabled {
            None
        } else if schedule_changed || re_enabled || current.next_run_at.is_none() {
            Some(next)
        } else {
            current.next_run_at
        };
        job.updated_at = now;

        tx.execute(
            "UPDATE jobs SET name = ?1, schedule = ?2, timezone = ?3, path = ?4, enabled = ?5,
                             timeout_seconds = ?6, retry_count = ?7, next_run_at = ?8, updated_at = ?9
             WHERE id = ?10",
            params![
                job.name,
                job.schedule,
                job.timezone,
                job.path,
                job.enabled,
                job.timeout_seconds,
                job.retry_count,
                job.next_run_at.map(encode_time),
                encode_time(now),
                id.to_string(),
            ],
        )?;
        tx.commit()?;

        info!(job_id = %id, enabled = job.enabled, next_run_at = ?job.next_run_at, "job updated");
        Ok(job)
    }

    pub fn set_enabled(&self, id: Uuid, enabled: bool, now: DateTime<Utc>) -> Result<JobDefinition> {
        self.update(
            id,
            JobPatch {
                enabled: Some(enabled),
                ..JobPatch::default()
            },
            now,
        )
    }

    /// Delete a job and its execution history.
    pub fn delete(&self, id: Uuid) -> Result<()> {
        let conn = self.pool.get()?;
        let changed = conn.execute("DELETE FROM jobs WHERE id = ?1", [id.to_string()])?;
        if changed == 0 {
            return Err(SchedulerError::JobNotFound(id));
        }
        info!(job_id = %id, "job deleted");
        Ok(())
    }

    /// Enabled jobs whose `next_run_at` has arrived, oldest occurrence first.
    /// A null `next_run_at` is never due.
    pub fn due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<JobDefinition>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE enabled = 1 AND next_run_at IS NOT NULL AND next_run_at <= ?1
             ORDER BY next_run_at"
        ))?;
        let rows = stmt.query_map([encode_time(now)], job_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Atomically claim the occurrence `job.next_run_at`.
    ///
    /// In one transaction: push `next_run_at` to the schedule's next
    /// occurrence after `now` (only if it still holds the value this caller
    /// observed) and insert the `running` execution for attempt 0.
    pub fn claim(&self, job: &JobDefinition, now: DateTime<Utc>) -> Result<ClaimOutcome> {
        let Some(observed) = job.next_run_at else {
            return Ok(ClaimOutcome::Lost);
        };

        let next = match cron::parse(&job.schedule)
            .map_err(SchedulerError::from)
            .and_then(|expr| {
                let tz = parse_timezone(&job.timezone)?;
                Ok(next_occurrence_across_years(&expr, tz, now)?)
            }) {
            Ok(next) => Some(next),
            Err(e) => {
                // The job is disabled below rather than left permanently due.
                error!(job_id = %job.id, schedule = %job.schedule, "cannot compute next run, disabling job: {}", e);
                None
            }
        };

        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let changed = tx.execute(
            "UPDATE jobs
             SET next_run_at = ?1,
                 enabled = CASE WHEN ?1 IS NULL THEN 0 ELSE enabled END
             WHERE id = ?2 AND enabled = 1 AND next_run_at = ?3 AND next_run_at <= ?4",
            params![
                next.map(encode_time),
                job.id.to_string(),
                encode_time(observed),
                encode_time(now),
            ],
        )?;
        if changed == 0 {
            return Ok(ClaimOutcome::Lost);
        }

        let in_flight: i64 = tx.query_row(
            "SELECT COUNT(*) FROM executions WHERE job_id = ?1 AND status = 'running'",
            [job.id.to_string()],
            |row| row.get(0),
        )?;
        if in_flight > 0 {
            tx.commit()?;
            return Ok(ClaimOutcome::Overlapping);
        }

        let execution = history::insert_running(&tx, job.id, 0, now)?;
        let job = load_job(&tx, job.id)?;
        tx.commit()?;

        Ok(ClaimOutcome::Claimed { job, execution })
    }

    /// Record the terminal outcome of an execution. Returns `false` if it was
    /// already terminal, in which case nothing changes.
    pub fn finish(
        &self,
        execution_id: Uuid,
        status: ExecutionStatus,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.pool.get()?;
        Ok(history::mark_terminal(&conn, execution_id, status, error, now)?)
    }

    /// Record a failed attempt and start the next one in the same transaction,
    /// so the job never appears idle between attempts.
    ///
    /// Returns `None` (and starts nothing) when the execution was already
    /// terminal or the job has since been disabled or deleted.
    pub fn finish_and_retry(
        &self,
        execution: &Execution,
        status: ExecutionStatus,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<Execution>> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if !history::mark_terminal(&tx, execution.id, status, error, now)? {
            return Ok(None);
        }

        let enabled: Option<bool> = tx
            .query_row(
                "SELECT enabled FROM jobs WHERE id = ?1",
                [execution.job_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        let retry = match enabled {
            Some(true) => Some(history::insert_running(
                &tx,
                execution.job_id,
                execution.retry_attempt + 1,
                now,
            )?),
            _ => None,
        };

        tx.commit()?;
        Ok(retry)
    }

    pub fn execution(&self, execution_id: Uuid) -> Result<Option<Execution>> {
        let conn = self.pool.get()?;
        Ok(history::get(&conn, execution_id)?)
    }

    /// Execution history of a job, newest first.
    pub fn executions(&self, job_id: Uuid, limit: usize) -> Result<Vec<Execution>> {
        let conn = self.pool.get()?;
        load_job(&conn, job_id)?;
        Ok(history::list_for_job(&conn, job_id, limit)?)
    }

    /// Fail `running` executions that outlived their job's timeout by more
    /// than `grace`. These belong to a dispatcher that stopped mid-invocation.
    pub fn reap_abandoned(&self, now: DateTime<Utc>, grace: Duration) -> Result<usize> {
        let conn = self.pool.get()?;
        let stale: Vec<(Uuid, DateTime<Utc>, i64)> = {
            let mut stmt = conn.prepare_cached(
                "SELECT e.id, e.started_at, j.timeout_seconds
                 FROM executions e JOIN jobs j ON j.id = e.job_id
                 WHERE e.status = 'running'",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    decode_uuid(0, &row.get::<_, String>(0)?)?,
                    decode_time(1, &row.get::<_, String>(1)?)?,
                    row.get::<_, i64>(2)?,
                ))
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        let mut reaped = 0;
        for (id, started_at, timeout_seconds) in stale {
            if started_at + Duration::seconds(timeout_seconds) + grace >= now {
                continue;
            }
            if history::mark_terminal(
                &conn,
                id,
                ExecutionStatus::Failed,
                Some("abandoned: dispatcher stopped before the invocation finished"),
                now,
            )? {
                warn!(execution_id = %id, %started_at, "abandoned execution marked failed");
                reaped += 1;
            }
        }
        Ok(reaped)
    }
}
