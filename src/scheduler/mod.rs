//! Scheduled-job engine: job store, execution history, handler invocation and
//! the dispatcher loop.

pub mod engine;
pub mod handler;
pub mod history;
pub mod jobs;
pub mod schedule;

// Re-export common types
pub use self::engine::{Dispatcher, TickReport};
pub use self::handler::{HttpHandler, InvocationError, JobHandler};
pub use self::history::{Execution, ExecutionStatus};
pub use self::jobs::{ClaimOutcome, JobDefinition, JobPatch, JobStore, NewJob};
pub use self::schedule::{
    compute_next_run, describe_cron_schedule, parse_next_run, upcoming_runs,
    validate_cron_expression, Validation,
};

use crate::cron::CronError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Cron(#[from] CronError),

    #[error("invalid timezone {0:?}: expected an IANA timezone name")]
    InvalidTimezone(String),

    #[error("invalid path {0:?}: must start with '/'")]
    InvalidPath(String),

    #[error("job name must not be empty")]
    EmptyName,

    #[error("job not found: {0}")]
    JobNotFound(Uuid),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
}

impl SchedulerError {
    /// True when the caller supplied bad input, as opposed to an internal failure.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            SchedulerError::Cron(_)
                | SchedulerError::InvalidTimezone(_)
                | SchedulerError::InvalidPath(_)
                | SchedulerError::EmptyName
        )
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
