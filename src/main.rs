use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use queuectl::config::EngineConfig;
use queuectl::scheduler::{DeadLetterRecord, Job, JobState};
use queuectl::shutdown::install_shutdown_handler;
use queuectl::{JobEngine, QueueError, StatusSummary};

#[derive(Parser, Debug)]
#[command(name = "queuectl")]
#[command(version)]
#[command(about = "Manage a durable background job queue")]
#[command(propagate_version = true)]
struct Args {
    /// Path to the queue database
    #[arg(long, global = true, env = "QUEUECTL_DB", default_value = "queuectl.db")]
    db: PathBuf,

    /// Output format
    #[arg(long, short = 'o', global = true, default_value = "table")]
    output: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Add a job, given as JSON: '{"id":"job1","command":"echo hi","max_retries":3}'
    Enqueue {
        job_json: String,
    },

    /// Start or stop workers
    Worker {
        #[command(subcommand)]
        command: WorkerCommands,
    },

    /// Show job counts per state and active workers
    Status,

    /// List jobs in a given state, oldest first
    List {
        /// pending, processing, completed, failed or dead
        #[arg(long)]
        state: String,
    },

    /// Dead-letter queue commands
    Dlq {
        #[command(subcommand)]
        command: DlqCommands,
    },

    /// Configuration commands
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

// =============================================================================
// Subcommands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum WorkerCommands {
    /// Run workers in the foreground until SIGINT/SIGTERM or `worker stop`
    Start {
        /// Number of workers to start
        #[arg(long, default_value = "1")]
        count: usize,
    },
    /// Ask all running workers to finish their current job and exit
    Stop,
}

#[derive(clap::Subcommand, Debug)]
enum DlqCommands {
    /// List jobs in the dead-letter queue
    List,
    /// Move a dead job back to the queue with its attempts reset
    Retry { job_id: String },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigCommands {
    /// Set a configuration value (e.g. backoff_base 3)
    Set { key: String, value: String },
    /// Show a configuration value
    Get { key: String },
    /// Show all configuration values
    List,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct EnqueueOutput<'a> {
    job_id: &'a str,
    max_retries: u32,
}

#[derive(Serialize)]
struct RetryOutput<'a> {
    job_id: &'a str,
    requeued: bool,
}

#[derive(Serialize)]
struct ConfigEntry<'a> {
    key: &'a str,
    value: Option<&'a str>,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn init_logging(default_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        let head: String = text.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", head)
    } else {
        text.to_string()
    }
}

fn print_job_table(jobs: &[Job]) {
    println!(
        "{:<20} {:<11} {:<9} {:<26} COMMAND",
        "JOB ID", "STATE", "ATTEMPTS", "CREATED"
    );
    println!("{}", "-".repeat(90));
    for job in jobs {
        println!(
            "{:<20} {:<11} {:<9} {:<26} {}",
            truncate(&job.id, 20),
            job.state,
            format!("{}/{}", job.attempts, job.max_retries),
            job.created_at.format("%Y-%m-%d %H:%M:%S%.3f"),
            truncate(&job.command, 30)
        );
    }
}

fn print_dead_letter_table(records: &[DeadLetterRecord]) {
    println!(
        "{:<20} {:<9} {:<26} {:<24} COMMAND",
        "JOB ID", "ATTEMPTS", "FAILED AT", "REASON"
    );
    println!("{}", "-".repeat(100));
    for record in records {
        println!(
            "{:<20} {:<9} {:<26} {:<24} {}",
            truncate(&record.job.id, 20),
            format!("{}/{}", record.job.attempts, record.job.max_retries),
            record.job.updated_at.format("%Y-%m-%d %H:%M:%S%.3f"),
            truncate(&record.failed_reason, 24),
            truncate(&record.job.command, 30)
        );
    }
}

fn print_status(status: &StatusSummary) {
    println!("Jobs summary:");
    for state in JobState::ALL {
        println!("  {:<11} {}", format!("{}:", state), status.count(state));
    }
    println!("Active workers: {}", status.active_workers);
}

// =============================================================================
// Command Handlers
// =============================================================================

async fn run_workers(
    engine: &mut JobEngine,
    count: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let token = CancellationToken::new();
    install_shutdown_handler(token.clone());

    engine.start_pool_with_token(count, token.clone())?;
    println!(
        "Started {} worker(s). Press Ctrl+C or run `queuectl worker stop` to stop.",
        count
    );

    token.cancelled().await;
    engine.stop_pool().await?;
    println!("All workers stopped.");
    Ok(())
}

fn handle_enqueue(
    engine: &JobEngine,
    job_json: &str,
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match engine.submit_json(job_json) {
        Ok(job) => match output {
            OutputFormat::Json => print_json(&EnqueueOutput {
                job_id: &job.id,
                max_retries: job.max_retries,
            })?,
            OutputFormat::Table => println!("Job enqueued with ID: {}", job.id),
        },
        Err(e @ (QueueError::InvalidInput(_) | QueueError::Payload(_))) => {
            eprintln!("Error: job rejected: {}", e);
            std::process::exit(2);
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

fn handle_list(
    engine: &JobEngine,
    state: &str,
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let state: JobState = match state.parse() {
        Ok(state) => state,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!("Valid states: pending, processing, completed, failed, dead");
            std::process::exit(2);
        }
    };

    let jobs = engine.list(state)?;
    match output {
        OutputFormat::Json => print_json(&jobs)?,
        OutputFormat::Table if jobs.is_empty() => {
            println!("No jobs found with state '{}'", state)
        }
        OutputFormat::Table => print_job_table(&jobs),
    }
    Ok(())
}

fn handle_dlq(
    engine: &JobEngine,
    command: DlqCommands,
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        DlqCommands::List => {
            let records = engine.dead_letter_list()?;
            match output {
                OutputFormat::Json => print_json(&records)?,
                OutputFormat::Table if records.is_empty() => {
                    println!("Dead letter queue is empty")
                }
                OutputFormat::Table => print_dead_letter_table(&records),
            }
        }
        DlqCommands::Retry { job_id } => {
            let requeued = engine.dead_letter_requeue(&job_id)?;
            match output {
                OutputFormat::Json => print_json(&RetryOutput {
                    job_id: &job_id,
                    requeued,
                })?,
                OutputFormat::Table if requeued => {
                    println!("Job {} moved back to queue for retry", job_id)
                }
                OutputFormat::Table => println!("Job {} not found in dead letter queue", job_id),
            }
        }
    }
    Ok(())
}

fn handle_config(
    engine: &JobEngine,
    command: ConfigCommands,
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let settings = engine.settings();
    match command {
        ConfigCommands::Set { key, value } => {
            settings.set(&key, &value)?;
            match output {
                OutputFormat::Json => print_json(&ConfigEntry {
                    key: &key,
                    value: Some(value.as_str()),
                })?,
                OutputFormat::Table => println!("Config '{}' set to '{}'", key, value),
            }
        }
        ConfigCommands::Get { key } => {
            let value = settings.get(&key)?;
            match output {
                OutputFormat::Json => print_json(&ConfigEntry {
                    key: &key,
                    value: value.as_deref(),
                })?,
                OutputFormat::Table => {
                    println!("{} = {}", key, value.as_deref().unwrap_or("(not set)"))
                }
            }
        }
        ConfigCommands::List => {
            let entries = settings.list()?;
            match output {
                OutputFormat::Json => {
                    let entries: Vec<ConfigEntry<'_>> = entries
                        .iter()
                        .map(|(key, value)| ConfigEntry {
                            key: key.as_str(),
                            value: Some(value.as_str()),
                        })
                        .collect();
                    print_json(&entries)?;
                }
                OutputFormat::Table if entries.is_empty() => println!("No configuration set"),
                OutputFormat::Table => {
                    for (key, value) in entries {
                        println!("{} = {}", key, value);
                    }
                }
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let is_worker = matches!(
        args.command,
        Commands::Worker {
            command: WorkerCommands::Start { .. }
        }
    );
    init_logging(if is_worker { "info" } else { "warn" });

    let config = EngineConfig::new(args.db);
    let mut engine = JobEngine::open(config)?;

    match args.command {
        Commands::Enqueue { job_json } => handle_enqueue(&engine, &job_json, &args.output)?,
        Commands::Worker { command } => match command {
            WorkerCommands::Start { count } => run_workers(&mut engine, count).await?,
            WorkerCommands::Stop => {
                let flagged = engine.request_stop()?;
                if flagged == 0 {
                    println!("No running workers found");
                } else {
                    println!("Requested {} worker pool(s) to stop gracefully", flagged);
                }
            }
        },
        Commands::Status => {
            let status = engine.status()?;
            match args.output {
                OutputFormat::Json => print_json(&status)?,
                OutputFormat::Table => print_status(&status),
            }
        }
        Commands::List { state } => handle_list(&engine, &state, &args.output)?,
        Commands::Dlq { command } => handle_dlq(&engine, command, &args.output)?,
        Commands::Config { command } => handle_config(&engine, command, &args.output)?,
    }

    Ok(())
}
