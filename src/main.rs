use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use procflow::broker::{Broker, InMemoryBroker};
use procflow::config::{
    DaemonConfig, ProfileContext, SchedulerConfig, TransportConfig, TransportKind,
};
use procflow::daemon::{
    run_daemon_thread, CalcJobInputs, DaemonWorker, InMemoryPersister, ObjectLoader,
    CALCJOB_PROCESS_TYPE,
};
use procflow::scheduler::{
    create_scheduler, poll_until_terminal, JobInfo, JobTemplate, Scheduler, SchedulerKind,
};
use procflow::shutdown::install_shutdown_handler;
use procflow::transport::{create_transport, TransportScope};

#[derive(Parser, Debug)]
#[command(name = "procflow")]
#[command(version)]
#[command(about = "Process coordination daemon and batch scheduler client")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Daemon worker commands
    Daemon {
        #[command(subcommand)]
        command: DaemonCommands,
    },

    /// Talk to a batch scheduler directly
    Scheduler {
        #[command(flatten)]
        target: TargetArgs,

        #[command(subcommand)]
        command: SchedulerCommands,
    },
}

// =============================================================================
// Shared Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct TargetArgs {
    /// Batch system to use
    #[arg(long, short = 'k', default_value = "direct")]
    kind: SchedulerKind,

    /// Run scheduler commands over ssh on this host instead of locally
    #[arg(long)]
    host: Option<String>,

    /// Remote user for ssh
    #[arg(long, requires = "host")]
    user: Option<String>,

    /// Remote port for ssh
    #[arg(long, requires = "host")]
    port: Option<u16>,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

impl TargetArgs {
    fn transport_config(&self) -> TransportConfig {
        let mut config = match &self.host {
            Some(host) => TransportConfig::ssh(host.clone()),
            None => TransportConfig::local(),
        };
        config.user = self.user.clone();
        config.port = self.port;
        config
    }
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Daemon Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum DaemonCommands {
    /// Start a daemon worker and serve until SIGTERM or SIGINT
    Start(DaemonArgs),
}

#[derive(Parser, Debug)]
struct DaemonArgs {
    /// Profile file (JSON); command line flags override its values
    #[arg(long)]
    profile_file: Option<PathBuf>,

    /// Profile name
    #[arg(long, default_value = "default")]
    profile: String,

    /// Default batch system for calculation jobs
    #[arg(long)]
    scheduler: Option<SchedulerKind>,

    /// Transport used to reach the batch system
    #[arg(long)]
    transport: Option<TransportKind>,

    /// Host for the ssh transport
    #[arg(long)]
    host: Option<String>,

    /// Maximum nesting depth of the daemon thread
    #[arg(long)]
    recursion_limit: Option<usize>,

    /// Maximum number of processes running at once
    #[arg(long)]
    max_tasks: Option<usize>,

    /// Milliseconds to wait for cancelled processes on shutdown
    #[arg(long)]
    shutdown_grace_ms: Option<u64>,

    /// Milliseconds between job status polls
    #[arg(long)]
    poll_interval_ms: Option<u64>,

    /// Submit a job script at startup (format: "workdir:filename"), repeatable
    #[arg(long = "job")]
    jobs: Vec<String>,
}

// =============================================================================
// Scheduler Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum SchedulerCommands {
    /// Submit a job script
    Submit {
        /// Directory the script is submitted from
        working_directory: String,
        /// Script file name, relative to the working directory
        filename: String,
        /// Poll until the job is done
        #[arg(long)]
        wait: bool,
        /// Milliseconds between polls when waiting
        #[arg(long, default_value = "5000")]
        poll_interval_ms: u64,
    },
    /// List jobs
    Jobs {
        /// Only these job ids (repeatable)
        #[arg(long = "job-id")]
        job_ids: Vec<String>,
        /// Only jobs of this user
        #[arg(long, conflicts_with = "job_ids")]
        user: Option<String>,
    },
    /// Kill a job
    Kill {
        job_id: String,
    },
    /// Render the submission script for a JSON job template
    Script {
        template: PathBuf,
    },
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct SubmitOutput {
    job_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    finished: Option<JobInfo>,
}

#[derive(Serialize)]
struct JobListOutput {
    jobs: Vec<JobInfo>,
    total_count: usize,
}

#[derive(Serialize)]
struct KillOutput {
    job_id: String,
    killed: bool,
}

#[derive(Serialize)]
struct ScriptOutput {
    script: String,
}

// =============================================================================
// Helper Functions
// =============================================================================

/// Logs go to stderr so command output on stdout stays parseable.
/// `RUST_LOG` overrides `default_level`.
fn init_logging(default_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn parse_job_spec(spec: &str) -> Option<CalcJobInputs> {
    let (working_directory, filename) = spec.rsplit_once(':')?;
    if working_directory.is_empty() || filename.is_empty() {
        return None;
    }
    Some(CalcJobInputs {
        working_directory: working_directory.to_string(),
        filename: filename.to_string(),
        scheduler: None,
        template: None,
    })
}

fn build_profile(args: &DaemonArgs) -> Result<ProfileContext, Box<dyn std::error::Error>> {
    let mut profile = match &args.profile_file {
        Some(path) => {
            let data = std::fs::read_to_string(path)?;
            serde_json::from_str::<ProfileContext>(&data)?
        }
        None => ProfileContext::new(args.profile.clone()),
    };
    // An explicit --profile wins over the name stored in the file.
    if args.profile_file.is_none() || args.profile != "default" {
        profile.name = args.profile.clone();
    }

    let mut daemon: DaemonConfig = profile.daemon.clone();
    if let Some(limit) = args.recursion_limit {
        daemon = daemon.with_recursion_limit(limit);
    }
    if let Some(max) = args.max_tasks {
        daemon = daemon.with_max_concurrent_tasks(max);
    }
    if let Some(grace) = args.shutdown_grace_ms {
        daemon = daemon.with_shutdown_grace(Duration::from_millis(grace));
    }

    let mut scheduler: SchedulerConfig = profile.scheduler.clone();
    if let Some(kind) = args.scheduler {
        scheduler.kind = kind;
    }
    if let Some(interval) = args.poll_interval_ms {
        scheduler = scheduler.with_poll_interval(Duration::from_millis(interval));
    }

    let mut transport = profile.transport.clone();
    if let Some(kind) = args.transport {
        transport.kind = kind;
    }
    if let Some(host) = &args.host {
        transport.host = Some(host.clone());
    }

    Ok(profile
        .with_daemon(daemon)
        .with_scheduler(scheduler)
        .with_transport(transport))
}

fn print_jobs_table(jobs: &[JobInfo]) {
    if jobs.is_empty() {
        println!("No jobs found.");
        return;
    }
    println!("{:<20} {:<14} {:<12} {:>10}", "JOB ID", "STATE", "OWNER", "WALLTIME");
    println!("{}", "-".repeat(60));
    for job in jobs {
        let walltime = job
            .wallclock_time_seconds
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<20} {:<14} {:<12} {:>10}",
            job.job_id,
            job.job_state.to_string(),
            job.job_owner.as_deref().unwrap_or("-"),
            walltime
        );
    }
}

// =============================================================================
// Daemon Implementation
// =============================================================================

async fn serve_daemon(profile: ProfileContext, jobs: Vec<CalcJobInputs>) -> procflow::error::Result<()> {
    let shutdown = install_shutdown_handler()?;
    let profile = Arc::new(profile);
    let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new(&profile));
    let persister = Arc::new(InMemoryPersister::new());

    let worker = DaemonWorker::start(
        profile.clone(),
        broker,
        persister,
        ObjectLoader::with_builtin(),
    )?;

    let controller = worker.controller();
    for inputs in jobs {
        let filename = inputs.filename.clone();
        match controller.launch_process(CALCJOB_PROCESS_TYPE, serde_json::to_value(&inputs)?, false) {
            Ok(Some(pending)) => match pending.await {
                Ok(ack) => tracing::info!(filename = %filename, ack = %ack, "Job process launched"),
                Err(e) => tracing::error!(filename = %filename, error = %e, "Job process not launched"),
            },
            Ok(None) => {}
            Err(e) => tracing::error!(filename = %filename, error = %e, "Job process not launched"),
        }
    }

    worker.run(shutdown).await;
    Ok(())
}

async fn run_daemon(args: DaemonArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_logging("info");

    let profile = build_profile(&args)?;
    let mut jobs = Vec::new();
    for spec in &args.jobs {
        let inputs = parse_job_spec(spec)
            .ok_or_else(|| format!("invalid job '{}', expected workdir:filename", spec))?;
        jobs.push(inputs);
    }

    tracing::info!(
        profile = %profile.name,
        scheduler = %profile.scheduler.kind,
        transport = ?profile.transport.kind,
        recursion_limit = ?profile.daemon.recursion_limit,
        "Starting daemon worker"
    );

    let daemon_config = profile.daemon.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        run_daemon_thread(&daemon_config, move || serve_daemon(profile, jobs))
    })
    .await?;

    match outcome {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.into()),
        Err(e) => Err(e.into()),
    }
}

// =============================================================================
// Scheduler Command Handlers
// =============================================================================

async fn handle_submit(
    scheduler: &dyn Scheduler,
    working_directory: &str,
    filename: &str,
    wait: bool,
    poll_interval_ms: u64,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let job_id = scheduler.submit_job(working_directory, filename).await?;

    let finished = if wait {
        let options = SchedulerConfig::new(scheduler.kind())
            .with_poll_interval(Duration::from_millis(poll_interval_ms))
            .poll_options();
        let cancel = install_shutdown_handler()?;
        Some(poll_until_terminal(scheduler, &job_id, &options, &cancel).await?)
    } else {
        None
    };

    match output_format {
        OutputFormat::Json => {
            let output = SubmitOutput { job_id, finished };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Job submitted successfully!");
            println!("Job ID: {}", job_id);
            if let Some(job) = finished {
                println!("State:  {}", job.job_state);
            }
        }
    }
    Ok(())
}

async fn handle_jobs(
    scheduler: &dyn Scheduler,
    job_ids: Vec<String>,
    user: Option<String>,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    if user.is_some() && !scheduler.can_query_by_user() {
        return Err(format!("the {} scheduler cannot filter by user", scheduler.kind()).into());
    }
    let jobs = if job_ids.is_empty() { None } else { Some(job_ids.as_slice()) };
    let list = scheduler.get_jobs(jobs, user.as_deref()).await?;

    match output_format {
        OutputFormat::Json => {
            let output = JobListOutput {
                total_count: list.len(),
                jobs: list,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => print_jobs_table(&list),
    }
    Ok(())
}

async fn handle_kill(
    scheduler: &dyn Scheduler,
    job_id: String,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let killed = scheduler.kill_job(&job_id).await?;

    match output_format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&KillOutput { job_id, killed })?);
        }
        OutputFormat::Table => {
            if killed {
                println!("Job {} killed", job_id);
            } else {
                eprintln!("Error: the scheduler refused to kill job {}", job_id);
                std::process::exit(1);
            }
        }
    }
    Ok(())
}

fn handle_script(
    scheduler: &dyn Scheduler,
    template: PathBuf,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let data = std::fs::read_to_string(template)?;
    let template: JobTemplate = serde_json::from_str(&data)?;
    let script = scheduler.get_submit_script(&template)?;

    match output_format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&ScriptOutput { script })?);
        }
        OutputFormat::Table => print!("{}", script),
    }
    Ok(())
}

async fn run_scheduler_command(
    target: TargetArgs,
    command: SchedulerCommands,
) -> Result<(), Box<dyn std::error::Error>> {
    let transport = create_transport(&target.transport_config())?;
    let scheduler = create_scheduler(target.kind, transport.clone());
    let _scope = TransportScope::enter(transport.as_ref())?;

    match command {
        SchedulerCommands::Submit {
            working_directory,
            filename,
            wait,
            poll_interval_ms,
        } => {
            handle_submit(
                scheduler.as_ref(),
                &working_directory,
                &filename,
                wait,
                poll_interval_ms,
                &target.output,
            )
            .await?;
        }
        SchedulerCommands::Jobs { job_ids, user } => {
            handle_jobs(scheduler.as_ref(), job_ids, user, &target.output).await?;
        }
        SchedulerCommands::Kill { job_id } => {
            handle_kill(scheduler.as_ref(), job_id, &target.output).await?;
        }
        SchedulerCommands::Script { template } => {
            handle_script(scheduler.as_ref(), template, &target.output)?;
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

    match args.command {
        Commands::Daemon { command } => match command {
            DaemonCommands::Start(daemon_args) => {
                if let Err(e) = run_daemon(daemon_args).await {
                    eprintln!("Error: {}", e);
                    std::process::exit(1);
                }
            }
        },
        Commands::Scheduler { target, command } => {
            init_logging("warn");
            run_scheduler_command(target, command).await?;
        }
    }

    Ok(())
}
