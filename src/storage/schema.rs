//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

const SCHEMA_VERSION: i64 = 1;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS jobs (
            id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL,
            name TEXT NOT NULL,
            schedule TEXT NOT NULL,
            timezone TEXT NOT NULL DEFAULT 'UTC',
            path TEXT NOT NULL,
            enabled INTEGER NOT NULL DEFAULT 1,
            timeout_seconds INTEGER NOT NULL DEFAULT 30,
            retry_count INTEGER NOT NULL DEFAULT 0,
            next_run_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS executions (
            id TEXT PRIMARY KEY,
            job_id TEXT NOT NULL,
            status TEXT NOT NULL,
            started_at TEXT NOT NULL,
            finished_at TEXT,
            duration_ms INTEGER,
            error TEXT,
            retry_attempt INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY (job_id) REFERENCES jobs(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_jobs_due ON jobs(enabled, next_run_at);
        CREATE INDEX IF NOT EXISTS idx_jobs_project ON jobs(project_id);
        CREATE INDEX IF NOT EXISTS idx_executions_job ON executions(job_id, started_at);
        CREATE INDEX IF NOT EXISTS idx_executions_status ON executions(status);

        -- Terminal executions are audit records.
        CREATE TRIGGER IF NOT EXISTS executions_terminal_immutable
        BEFORE UPDATE ON executions
        WHEN OLD.status != 'running'
        BEGIN
            SELECT RAISE(ABORT, 'execution is terminal');
        END;",
    )?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        [SCHEMA_VERSION],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed_job(conn: &Connection) {
        conn.execute(
            "INSERT INTO jobs (id, project_id, name, schedule, path, created_at, updated_at)
             VALUES ('j1', 'p1', 'nightly', '0 0 * * *', '/cron/nightly', 'now', 'now')",
            [],
        )
        .unwrap();
    }

    #[test]
    fn test_migrate_creates_tables() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();

        // Verify tables exist by querying them
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM jobs", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM executions", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap(); // Should not error

        let version: i64 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_terminal_execution_rejects_updates() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        seed_job(&conn);
        conn.execute(
            "INSERT INTO executions (id, job_id, status, started_at) VALUES ('e1', 'j1', 'running', 'now')",
            [],
        )
        .unwrap();

        // running -> success is allowed once
        conn.execute("UPDATE executions SET status = 'success' WHERE id = 'e1'", [])
            .unwrap();
        let err = conn
            .execute("UPDATE executions SET status = 'failed' WHERE id = 'e1'", [])
            .unwrap_err();
        assert!(err.to_string().contains("execution is terminal"));
    }

    #[test]
    fn test_deleting_job_cascades_executions() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
        migrate(&conn).unwrap();
        seed_job(&conn);
        conn.execute(
            "INSERT INTO executions (id, job_id, status, started_at) VALUES ('e1', 'j1', 'success', 'now')",
            [],
        )
        .unwrap();

        conn.execute("DELETE FROM jobs WHERE id = 'j1'", []).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM executions", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
