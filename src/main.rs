use anyhow::{bail, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use taskpilot::config::Config;
use taskpilot::scheduler::{self, JobStore, NewJob};
use taskpilot::storage;
use uuid::Uuid;

#[derive(Parser)]
#[command(
    name = "taskpilot",
    about = "Durable cron jobs for a self-hosted deployment platform",
    version,
    long_about = None
)]
struct Cli {
    /// Path to a TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (admin API + dispatcher)
    Serve {
        /// Bind address, overriding the config file
        #[arg(long)]
        bind: Option<String>,
    },

    /// Check that a cron expression is valid and can fire
    Validate {
        /// Five-field cron expression
        expression: String,
    },

    /// Describe a cron expression in English
    Describe {
        /// Five-field cron expression
        expression: String,
    },

    /// Preview upcoming runs of a cron expression
    NextRuns {
        /// Five-field cron expression
        expression: String,

        /// IANA timezone the expression is evaluated in
        #[arg(long, default_value = "UTC")]
        timezone: String,

        /// Number of runs to show (at most 100)
        #[arg(long, default_value = "5")]
        count: usize,
    },

    /// Manage scheduled jobs
    Job {
        #[command(subcommand)]
        action: JobAction,
    },

    /// Show the execution history of a job
    History {
        /// Job ID
        job_id: Uuid,

        /// Maximum number of executions to show
        #[arg(long, default_value = "20")]
        limit: usize,
    },
}

#[derive(Subcommand)]
enum JobAction {
    /// List jobs
    List {
        /// Only jobs of this project
        #[arg(long)]
        project: Option<String>,
    },

    /// Add a new job
    Add {
        #[arg(long)]
        project: String,

        #[arg(long)]
        name: String,

        /// Cron expression (5-field)
        #[arg(long)]
        schedule: String,

        /// Handler path, starting with '/'
        #[arg(long)]
        path: String,

        #[arg(long, default_value = "UTC")]
        timezone: String,

        /// Seconds before an invocation times out (1-300)
        #[arg(long)]
        timeout: Option<u32>,

        /// Retries after a failed invocation (0-5)
        #[arg(long)]
        retries: Option<u32>,

        /// Create the job disabled
        #[arg(long)]
        disabled: bool,
    },

    /// Remove a job and its history
    Remove { id: Uuid },

    /// Enable a job
    Enable { id: Uuid },

    /// Disable a job
    Disable { id: Uuid },
}

fn open_store(config: &Config) -> Result<JobStore> {
    Ok(JobStore::new(storage::open_pool(&config.storage.db_path)?))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::resolve(cli.config.as_deref())?;
    taskpilot::init_tracing(&config.logging);

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            tracing::info!(bind = %config.server.bind, "Starting taskpilot daemon");
            taskpilot::serve(config).await?;
        }
        Commands::Validate { expression } => {
            let validation = scheduler::validate_cron_expression(&expression);
            match validation.error {
                None => println!("valid: {}", scheduler::describe_cron_schedule(&expression)),
                Some(error) => bail!("invalid cron expression: {error}"),
            }
        }
        Commands::Describe { expression } => {
            println!("{}", scheduler::describe_cron_schedule(&expression));
        }
        Commands::NextRuns {
            expression,
            timezone,
            count,
        } => {
            let runs = scheduler::upcoming_runs(&expression, &timezone, Utc::now(), count)?;
            let tz = scheduler::schedule::parse_timezone(&timezone)?;
            for run in runs {
                println!("{}  ({})", run.to_rfc3339(), run.with_timezone(&tz).format("%Y-%m-%d %H:%M %Z"));
            }
        }
        Commands::Job { action } => {
            let store = open_store(&config)?;
            match action {
                JobAction::List { project } => {
                    let jobs = store.list(project.as_deref())?;
                    if jobs.is_empty() {
                        println!("No jobs found.");
                    } else {
                        println!(
                            "{:<36} | {:<20} | {:<15} | {:<7} | Next run",
                            "ID", "Name", "Schedule", "Enabled"
                        );
                        println!("{:-<36}-|-{:-<20}-|-{:-<15}-|-{:-<7}-|-{:-<25}", "", "", "", "", "");
                        for job in jobs {
                            let next = job
                                .next_run_at
                                .map(|t| t.to_rfc3339())
                                .unwrap_or_else(|| "-".to_string());
                            println!(
                                "{:<36} | {:<20} | {:<15} | {:<7} | {}",
                                job.id, job.name, job.schedule, job.enabled, next
                            );
                        }
                    }
                }
                JobAction::Add {
                    project,
                    name,
                    schedule,
                    path,
                    timezone,
                    timeout,
                    retries,
                    disabled,
                } => {
                    let job = store.create(
                        NewJob {
                            project_id: project,
                            name,
                            schedule,
                            timezone,
                            path,
                            enabled: !disabled,
                            timeout_seconds: timeout,
                            retry_count: retries,
                        },
                        Utc::now(),
                    )?;
                    println!("Job '{}' added with id {}.", job.name, job.id);
                }
                JobAction::Remove { id } => {
                    store.delete(id)?;
                    println!("Job {} removed.", id);
                }
                JobAction::Enable { id } => {
                    let job = store.set_enabled(id, true, Utc::now())?;
                    println!("Job {} enabled, next run {:?}.", id, job.next_run_at);
                }
                JobAction::Disable { id } => {
                    store.set_enabled(id, false, Utc::now())?;
                    println!("Job {} disabled.", id);
                }
            }
        }
        Commands::History { job_id, limit } => {
            let store = open_store(&config)?;
            let executions = store.executions(job_id, limit.max(1))?;
            if executions.is_empty() {
                println!("No executions recorded.");
            }
            for e in executions {
                println!(
                    "{} | {:<8} | attempt {} | {} ms | {}",
                    e.started_at.to_rfc3339(),
                    e.status,
                    e.retry_attempt,
                    e.duration_ms.map(|d| d.to_string()).unwrap_or_else(|| "-".to_string()),
                    e.error.unwrap_or_default()
                );
            }
        }
    }

    Ok(())
}
