use chrono::Utc;
use clap::{Parser, ValueEnum};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use jobhive::config::QueueConfig;
use jobhive::daemon::DaemonRunner;
use jobhive::job::{JobDocument, JobId, JobRegistry, JobState, Origin};
use jobhive::jobs::register_builtin;
use jobhive::node::NodeInfo;
use jobhive::process::{read_job_id, run_job};
use jobhive::scheduler::Scheduler;
use jobhive::shutdown::install_shutdown_handler;
use jobhive::store::{JobFilter, ListOptions, QueueStore};
use jobhive::worker::{ProcessLauncher, Worker};

#[derive(Parser, Debug)]
#[command(name = "jobhive")]
#[command(version)]
#[command(about = "A job queue with worker and scheduler daemons on a shared SQLite store")]
#[command(propagate_version = true)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    /// Store path, overrides `[store] path`
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a worker daemon
    Worker {
        /// Worker identity, defaults to the hostname
        #[arg(long)]
        identity: Option<String>,
    },

    /// Run the scheduler daemon
    Scheduler {
        /// Scheduler identity, defaults to the hostname
        #[arg(long)]
        identity: Option<String>,
    },

    /// Run one job; reads the job id from stdin (used by workers)
    Exec,

    /// Enqueue a job
    Enqueue {
        /// Qualified job type name
        name: String,

        /// Job argument as key=value; values are parsed as JSON when possible
        #[arg(long = "arg", value_name = "KEY=VALUE")]
        args: Vec<String>,

        #[arg(long)]
        priority: Option<i32>,

        /// Enqueue property as key=value (e.g. attempts=3)
        #[arg(long = "set", value_name = "KEY=VALUE")]
        properties: Vec<String>,
    },

    /// Request a running job to be killed
    Kill { job_id: i64 },

    /// Flag a job for removal
    Remove { job_id: i64 },

    /// Restart a waiting or stopped job
    Restart { job_id: i64 },

    /// Show one job, live or journaled
    Status {
        job_id: i64,

        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },

    /// List live jobs
    List {
        #[arg(long)]
        state: Option<JobState>,

        #[arg(long)]
        name: Option<String>,

        #[arg(long, default_value = "100")]
        limit: usize,

        /// Newest first
        #[arg(long)]
        desc: bool,

        /// List the journal instead of the live queue
        #[arg(long)]
        journal: bool,

        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },

    /// Ask every running daemon to stop
    Halt,

    /// Switch maintenance mode; daemons skip their steps while it is on
    Maintenance {
        mode: Toggle,

        /// Only stop dispatching jobs of this project (first name segment)
        #[arg(long)]
        project: Option<String>,
    },

    /// Show the queue event log
    Stats {
        #[arg(long, default_value = "20")]
        limit: usize,

        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Debug, Clone, ValueEnum)]
enum Toggle {
    On,
    Off,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn load_config(args: &Args) -> Result<QueueConfig, Box<dyn std::error::Error>> {
    let config = match &args.config {
        Some(path) => QueueConfig::from_file(path)?,
        None => QueueConfig::default(),
    };
    Ok(match &args.store {
        Some(path) => config.with_store_path(path),
        None => config,
    })
}

fn builtin_registry() -> Result<JobRegistry, Box<dyn std::error::Error>> {
    let mut registry = JobRegistry::new();
    register_builtin(&mut registry)?;
    Ok(registry)
}

/// Splits `key=value`; the value is JSON if it parses, a string otherwise.
fn parse_pair(raw: &str) -> Result<(String, Value), Box<dyn std::error::Error>> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got [{}]", raw))?;
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.trim().to_string(), value))
}

/// Command line that makes a worker re-execute this binary as a job process.
fn exec_command(args: &Args, config: &QueueConfig) -> std::io::Result<(PathBuf, Vec<String>)> {
    if let Some(program) = &config.worker.launcher.program {
        return Ok((program.clone(), config.worker.launcher.args.clone()));
    }
    let mut exec_args = vec![
        "--store".to_string(),
        config.store.path.display().to_string(),
    ];
    if let Some(path) = &args.config {
        exec_args.push("--config".to_string());
        exec_args.push(path.display().to_string());
    }
    exec_args.push("exec".to_string());
    Ok((std::env::current_exe()?, exec_args))
}

fn fmt_time(t: Option<chrono::DateTime<Utc>>) -> String {
    t.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn print_job(doc: &JobDocument) {
    println!("Job ID:        {}", doc.id());
    println!("Name:          {}", doc.name());
    println!("State:         {}", doc.state());
    println!("Args:          {}", Value::Object(doc.args().clone()));
    println!("Priority:      {}", doc.priority());
    println!("Trial:         {} ({} of {} attempts left)", doc.trial(), doc.attempts_left(), doc.attempts());
    println!("Enqueued:      {} by {}@{}", doc.enqueued().at.format("%Y-%m-%d %H:%M:%S"), doc.enqueued().username, doc.enqueued().hostname);
    println!("Started:       {}", fmt_time(doc.started_at()));
    println!("Finished:      {}", fmt_time(doc.finished_at()));
    println!("Runtime:       {:.1}s", doc.runtime());
    if let Some(parent) = doc.enqueued().parent_id {
        println!("Parent:        {}", parent);
    }
    if let Some(child) = doc.enqueued().child_id {
        println!("Child:         {}", child);
    }
    if let Some(locked) = doc.locked() {
        println!("Worker:        {}@{} (pid {:?})", locked.worker, locked.hostname, locked.pid);
        if let Some(progress) = locked.progress_value {
            println!("Progress:      {:.0}% {}", progress * 100.0, locked.progress.as_deref().unwrap_or(""));
        }
    }
    if let Some(error) = doc.last_error() {
        println!("Last Error:    {}", error.exception);
        if let Some(traceback) = &error.traceback {
            for line in traceback.lines() {
                println!("  {}", line);
            }
        }
    }
}

// =============================================================================
// Daemons
// =============================================================================

async fn run_worker(args: &Args, identity: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(args)?;
    let store = Arc::new(QueueStore::open(&config.store)?);
    let node = NodeInfo::current();
    let identity = identity
        .or_else(|| config.worker.identity.clone())
        .unwrap_or_else(|| node.hostname.clone());

    let (program, exec_args) = exec_command(args, &config)?;
    let launcher = ProcessLauncher::new(store.clone(), program, exec_args);
    let worker = Worker::new(store.clone(), launcher, identity, node.hostname)
        .with_plan(config.worker.execution_plan.clone())
        .with_alive_timeout(config.daemon.alive_timeout());

    let shutdown = install_shutdown_handler()?;
    DaemonRunner::new(worker, store, config.daemon.alive_timeout())
        .run(shutdown)
        .await?;
    Ok(())
}

async fn run_scheduler(args: &Args, identity: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(args)?;
    let store = Arc::new(QueueStore::open(&config.store)?);
    let identity = identity
        .or_else(|| config.scheduler.identity.clone())
        .unwrap_or_else(|| NodeInfo::current().hostname);
    let alive_timeout = config.daemon.alive_timeout();

    let scheduler = Scheduler::new(
        store.clone(),
        Arc::new(builtin_registry()?),
        Arc::new(config),
        identity,
    );
    let shutdown = install_shutdown_handler()?;
    DaemonRunner::new(scheduler, store, alive_timeout)
        .run(shutdown)
        .await?;
    Ok(())
}

async fn run_exec(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(args)?;
    let id = read_job_id(std::io::stdin().lock())?;
    let store = QueueStore::open(&config.store)?;
    let registry = builtin_registry()?;

    // jobs are synchronous and may block for a long time
    let state = tokio::task::spawn_blocking(move || run_job(&store, &registry, id)).await??;
    tracing::info!(job_id = %id, state = %state, "Job process finished");
    Ok(())
}

// =============================================================================
// Client Commands
// =============================================================================

fn handle_enqueue(
    args: &Args,
    name: &str,
    pairs: &[String],
    priority: Option<i32>,
    properties: &[String],
) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(args)?;
    let store = QueueStore::open(&config.store)?;
    let registry = builtin_registry()?;

    let mut job_args = Map::new();
    for raw in pairs {
        let (key, value) = parse_pair(raw)?;
        job_args.insert(key, value);
    }
    let mut params = Map::new();
    for raw in properties {
        let (key, value) = parse_pair(raw)?;
        params.insert(key, value);
    }
    if let Some(priority) = priority {
        params.insert("priority".to_string(), Value::from(priority));
    }
    params.insert("args".to_string(), Value::Object(job_args));

    let job = registry.prepare(name, params, &config)?;
    let id = store.enqueue(&job, &Origin::current(Utc::now()))?;
    println!("{}", id);
    Ok(())
}

fn handle_status(args: &Args, id: JobId, output: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(args)?;
    let store = QueueStore::open(&config.store)?;
    let doc = store
        .find(id)?
        .ok_or_else(|| format!("job [{}] not found", id))?;
    let captured = store.output(id)?;

    match output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&doc)?);
        }
        OutputFormat::Table => {
            print_job(&doc);
            if let Some(captured) = captured {
                if !captured.stdout.is_empty() {
                    println!("Output:");
                    for line in captured.stdout.lines() {
                        println!("  {}", line);
                    }
                }
                if !captured.stderr.is_empty() {
                    println!("Error:");
                    for line in captured.stderr.lines() {
                        println!("  {}", line);
                    }
                }
            }
        }
    }
    Ok(())
}

fn handle_list(
    args: &Args,
    filter: JobFilter,
    options: ListOptions,
    journal: bool,
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(args)?;
    let store = QueueStore::open(&config.store)?;
    let docs = if journal {
        store.list_journal(&options)?
    } else {
        store.list(&filter, &options)?
    };

    match output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&docs)?);
        }
        OutputFormat::Table => {
            if docs.is_empty() {
                println!("No jobs found.");
                return Ok(());
            }
            println!(
                "{:<8} {:<10} {:<8} {:<19} {}",
                "JOB ID", "STATE", "PRIO", "ENQUEUED", "NAME"
            );
            println!("{}", "-".repeat(80));
            for doc in &docs {
                println!(
                    "{:<8} {:<10} {:<8} {:<19} {}",
                    doc.id(),
                    doc.state(),
                    doc.priority(),
                    doc.enqueued().at.format("%Y-%m-%d %H:%M:%S"),
                    doc.name()
                );
            }
            println!();
            println!("Total: {} jobs", docs.len());
        }
    }
    Ok(())
}

fn handle_stats(args: &Args, limit: usize, output: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(args)?;
    let store = QueueStore::open(&config.store)?;
    let mut records = store.stats(&ListOptions {
        descending: true,
        skip: 0,
        limit: Some(limit),
    })?;
    records.reverse();

    match output {
        OutputFormat::Json => {
            let rows: Vec<Value> = records
                .iter()
                .map(|r| {
                    let counts: Map<String, Value> = r
                        .counts
                        .iter()
                        .map(|(state, count)| (state.to_string(), Value::from(*count)))
                        .collect();
                    serde_json::json!({
                        "timestamp": r.timestamp,
                        "event": r.event,
                        "job_id": r.job_id,
                        "counts": counts,
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        OutputFormat::Table => {
            if records.is_empty() {
                println!("No events recorded.");
                return Ok(());
            }
            println!("{:<19} {:<20} {:<8} {}", "TIMESTAMP", "EVENT", "JOB ID", "COUNTS");
            println!("{}", "-".repeat(80));
            for r in &records {
                let counts: Vec<String> = r
                    .counts
                    .iter()
                    .filter(|(_, count)| *count > 0)
                    .map(|(state, count)| format!("{}={}", state, count))
                    .collect();
                println!(
                    "{:<19} {:<20} {:<8} {}",
                    r.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    r.event,
                    r.job_id.map(|id| id.to_string()).unwrap_or_else(|| "-".to_string()),
                    counts.join(" ")
                );
            }
        }
    }
    Ok(())
}

fn handle_client(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let now = Utc::now();
    match &args.command {
        Commands::Enqueue {
            name,
            args: pairs,
            priority,
            properties,
        } => handle_enqueue(args, name, pairs, *priority, properties)?,
        Commands::Kill { job_id } => {
            let store = QueueStore::open(&load_config(args)?.store)?;
            if store.kill(JobId(*job_id), now)? {
                println!("Kill requested for job {}", job_id);
            } else {
                println!("Job {} is not running", job_id);
            }
        }
        Commands::Remove { job_id } => {
            let store = QueueStore::open(&load_config(args)?.store)?;
            if store.remove(JobId(*job_id), now)? {
                println!("Job {} flagged for removal", job_id);
            } else {
                println!("Job {} was already flagged", job_id);
            }
        }
        Commands::Restart { job_id } => {
            let store = QueueStore::open(&load_config(args)?.store)?;
            let id = store.restart(JobId(*job_id), now)?;
            println!("{}", id);
        }
        Commands::Status { job_id, output } => handle_status(args, JobId(*job_id), output)?,
        Commands::List {
            state,
            name,
            limit,
            desc,
            journal,
            output,
        } => handle_list(
            args,
            JobFilter {
                state: *state,
                name: name.clone(),
            },
            ListOptions {
                descending: *desc,
                skip: 0,
                limit: Some(*limit),
            },
            *journal,
            output,
        )?,
        Commands::Halt => {
            let store = QueueStore::open(&load_config(args)?.store)?;
            store.request_halt(now)?;
            println!("Halt requested");
        }
        Commands::Maintenance { mode, project: None } => {
            let store = QueueStore::open(&load_config(args)?.store)?;
            match mode {
                Toggle::On => store.enter_maintenance()?,
                Toggle::Off => store.leave_maintenance()?,
            }
            println!("Maintenance {}", if store.in_maintenance()? { "on" } else { "off" });
        }
        Commands::Maintenance {
            mode,
            project: Some(project),
        } => {
            let store = QueueStore::open(&load_config(args)?.store)?;
            match mode {
                Toggle::On => store.enter_project_maintenance(project, now)?,
                Toggle::Off => store.leave_project_maintenance(project)?,
            };
            let projects = store.projects_in_maintenance()?;
            if projects.is_empty() {
                println!("No project in maintenance");
            } else {
                println!("Projects in maintenance: {}", projects.join(", "));
            }
        }
        Commands::Stats { limit, output } => handle_stats(args, *limit, output)?,
        Commands::Worker { .. } | Commands::Scheduler { .. } | Commands::Exec => {}
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // stdout belongs to command output and to job processes
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match &args.command {
        Commands::Worker { identity } => run_worker(&args, identity.clone()).await?,
        Commands::Scheduler { identity } => run_scheduler(&args, identity.clone()).await?,
        Commands::Exec => run_exec(&args).await?,
        _ => handle_client(&args)?,
    }

    Ok(())
}
