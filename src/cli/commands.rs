//! CLI command definitions for crawlfleet.
//!
//! Client commands (`submit`, `status`, `cancel`, `stats`) talk to the
//! coordination store directly. Long-running commands (`worker`, `monitor`)
//! run until Ctrl-C or SIGTERM, then shut down gracefully.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::CrawlfleetConfig;
use crate::extraction::{HttpExtractor, HttpExtractorConfig};
use crate::metrics::{export_metrics, init_metrics, LogSink, MetricsCollector};
use crate::scaling::{AutoScaler, DryRunFleet, FleetManager, ProcessFleet, ResourceManager};
use crate::scheduler::{
    CancelOutcome, HeartbeatMonitor, JobRepository, JobService, SubmitRequest, Worker,
    WorkerRegistry,
};
use crate::store::{CoordinationStore, Keyspace, RedisStore};
use crate::utils::{shutdown_channel, ShutdownSignal};

/// Distributed extraction job queue with an auto-scaled worker fleet.
#[derive(Parser)]
#[command(name = "crawlfleet")]
#[command(about = "Distributed extraction job queue with auto-scaled workers")]
#[command(version)]
#[command(
    long_about = "crawlfleet queues extraction jobs in Redis, runs them on a fleet of workers and grows or shrinks the fleet with the backlog.\n\nExample usage:\n  crawlfleet submit --template article --url https://example.com/post --priority 5\n  crawlfleet worker --name scraper\n  crawlfleet monitor"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// YAML configuration file; CRAWLFLEET_* variables override it.
    #[arg(short, long, global = true, env = "CRAWLFLEET_CONFIG")]
    pub config: Option<PathBuf>,

    /// Redis URL, overriding the configuration.
    #[arg(long, global = true)]
    pub redis_url: Option<String>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Submit an extraction job.
    Submit(SubmitArgs),

    /// Show a job record.
    Status(JobArgs),

    /// Cancel a job that no worker has picked up yet.
    Cancel(JobArgs),

    /// Show queue and fleet counters.
    Stats(StatsArgs),

    /// Run a worker process.
    Worker(WorkerArgs),

    /// Run the heartbeat monitor, metrics collector and auto-scaler.
    Monitor(MonitorArgs),

    /// Collect one snapshot and print it in Prometheus text format.
    Metrics,
}

/// Arguments for `crawlfleet submit`.
#[derive(Parser, Debug)]
pub struct SubmitArgs {
    /// Extraction template reference.
    #[arg(short, long)]
    pub template: String,

    /// Page to extract from.
    #[arg(short, long)]
    pub url: String,

    /// Display name (defaults to the URL).
    #[arg(short, long)]
    pub name: Option<String>,

    /// Job configuration as a JSON object.
    #[arg(long)]
    pub job_config: Option<String>,

    /// Higher values dequeue first.
    #[arg(short, long, default_value = "0", allow_negative_numbers = true)]
    pub priority: i32,

    /// Re-queues allowed after failures.
    #[arg(long, default_value = "3")]
    pub max_retries: u32,
}

/// Arguments for commands addressing one job.
#[derive(Parser, Debug)]
pub struct JobArgs {
    /// Job id.
    pub job_id: Uuid,

    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `crawlfleet stats`.
#[derive(Parser, Debug)]
pub struct StatsArgs {
    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `crawlfleet worker`.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    /// Worker name; the registration id is `{name}-{uuid}`.
    #[arg(short, long)]
    pub name: Option<String>,
}

/// Arguments for `crawlfleet monitor`.
#[derive(Parser, Debug)]
pub struct MonitorArgs {
    /// Log scaling targets instead of spawning worker processes.
    #[arg(long)]
    pub dry_run: bool,

    /// Disable the auto-scaler regardless of configuration.
    #[arg(long)]
    pub no_autoscale: bool,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli)?;
    let config_path = cli.config.clone();

    match cli.command {
        Commands::Submit(args) => run_submit_command(&config, args).await,
        Commands::Status(args) => run_status_command(&config, args).await,
        Commands::Cancel(args) => run_cancel_command(&config, args).await,
        Commands::Stats(args) => run_stats_command(&config, args).await,
        Commands::Worker(args) => run_worker_command(config, args).await,
        Commands::Monitor(args) => run_monitor_command(config, config_path, args).await,
        Commands::Metrics => run_metrics_command(&config).await,
    }
}

/// File (if any), then environment, then command-line overrides.
fn load_config(cli: &Cli) -> anyhow::Result<CrawlfleetConfig> {
    let mut config = match &cli.config {
        Some(path) => CrawlfleetConfig::from_yaml_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => CrawlfleetConfig::default(),
    };
    config.apply_env()?;
    if let Some(url) = &cli.redis_url {
        config.store.redis_url = url.clone();
    }
    config.validate()?;
    Ok(config)
}

/// Repository and registry sharing one store connection.
struct Backend {
    store: Arc<dyn CoordinationStore>,
    keys: Keyspace,
    repository: JobRepository,
    registry: WorkerRegistry,
}

impl Backend {
    async fn connect(config: &CrawlfleetConfig) -> anyhow::Result<Self> {
        let store: Arc<dyn CoordinationStore> = Arc::new(
            RedisStore::connect(&config.store.redis_url)
                .await
                .with_context(|| format!("Failed to connect to {}", config.store.redis_url))?,
        );
        let keys = Keyspace::new(config.store.key_prefix.clone());
        Ok(Self {
            repository: JobRepository::new(store.clone(), keys.clone()),
            registry: WorkerRegistry::new(store.clone(), keys.clone()),
            store,
            keys,
        })
    }

    fn service(&self) -> JobService {
        JobService::new(self.repository.clone(), self.registry.clone())
    }
}

// ============================================================================
// Client commands
// ============================================================================

fn build_submit_request(args: SubmitArgs) -> anyhow::Result<SubmitRequest> {
    let name = args.name.unwrap_or_else(|| args.url.clone());
    let mut request = SubmitRequest::new(name, args.template, args.url)
        .with_priority(args.priority)
        .with_max_retries(args.max_retries);
    if let Some(raw) = args.job_config {
        let value: serde_json::Value =
            serde_json::from_str(&raw).context("--job-config is not valid JSON")?;
        request = request.with_config(value);
    }
    Ok(request)
}

async fn run_submit_command(config: &CrawlfleetConfig, args: SubmitArgs) -> anyhow::Result<()> {
    let request = build_submit_request(args)?;
    let backend = Backend::connect(config).await?;
    let job_id = backend.service().submit(request).await?;
    println!("{}", job_id);
    Ok(())
}

async fn run_status_command(config: &CrawlfleetConfig, args: JobArgs) -> anyhow::Result<()> {
    let backend = Backend::connect(config).await?;
    let job = backend.service().get_status(args.job_id).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&job)?);
        return Ok(());
    }

    println!("Job:       {} ({})", job.id, job.name);
    println!("Status:    {}", job.status.as_str());
    println!("Target:    {} [{}]", job.target_url, job.template_id);
    println!("Priority:  {}", job.priority);
    println!("Retries:   {}/{}", job.retry_count, job.max_retries);
    if let Some(worker) = &job.assigned_worker {
        println!("Worker:    {}", worker);
    }
    println!("Created:   {}", job.created_at.to_rfc3339());
    if let Some(started) = job.started_at {
        println!("Started:   {}", started.to_rfc3339());
    }
    if let Some(completed) = job.completed_at {
        println!("Finished:  {}", completed.to_rfc3339());
    }
    if let Some(error) = &job.error {
        println!("Error:     {}", error);
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct CancelOutput {
    job_id: Uuid,
    outcome: CancelOutcome,
}

async fn run_cancel_command(config: &CrawlfleetConfig, args: JobArgs) -> anyhow::Result<()> {
    let backend = Backend::connect(config).await?;
    let outcome = backend.service().cancel(args.job_id).await?;

    if args.json {
        let output = CancelOutput {
            job_id: args.job_id,
            outcome,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    match outcome {
        CancelOutcome::Cancelled => println!("Cancelled {}", args.job_id),
        CancelOutcome::AlreadyAssigned => println!(
            "{} is already assigned to a worker and will run to completion",
            args.job_id
        ),
        CancelOutcome::AlreadyFinished => println!("{} has already finished", args.job_id),
    }
    Ok(())
}

async fn run_stats_command(config: &CrawlfleetConfig, args: StatsArgs) -> anyhow::Result<()> {
    let backend = Backend::connect(config).await?;
    let stats = backend.service().queue_stats().await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        println!("Pending jobs:   {}", stats.pending_jobs);
        println!("Queue depth:    {}", stats.queue_depth);
        println!("Total jobs:     {}", stats.total_jobs);
        println!("Active workers: {}", stats.active_workers);
        println!("Total workers:  {}", stats.total_workers);
    }
    Ok(())
}

async fn run_metrics_command(config: &CrawlfleetConfig) -> anyhow::Result<()> {
    init_metrics()?;
    let backend = Backend::connect(config).await?;
    let collector = MetricsCollector::new(backend.repository.clone(), backend.registry.clone());
    collector.collect().await?;
    print!("{}", export_metrics());
    Ok(())
}

// ============================================================================
// Long-running commands
// ============================================================================

/// Flips the returned signal on Ctrl-C or SIGTERM.
fn spawn_signal_handler() -> ShutdownSignal {
    let (tx, rx) = shutdown_channel();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received");
        let _ = tx.send(true);
    });
    rx
}

#[cfg(target_family = "unix")]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "Cannot listen for SIGTERM, using Ctrl-C only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(target_family = "unix"))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

async fn run_worker_command(mut config: CrawlfleetConfig, args: WorkerArgs) -> anyhow::Result<()> {
    if let Some(name) = args.name {
        config.worker.name = name;
    }
    init_metrics()?;
    let backend = Backend::connect(&config).await?;
    let extractor = Arc::new(HttpExtractor::new(HttpExtractorConfig::default())?);
    let worker = Worker::new(
        backend.registry.clone(),
        backend.repository.clone(),
        extractor,
        config.worker.clone(),
    );

    let shutdown = spawn_signal_handler();
    worker.run(shutdown).await?;

    let stats = worker.stats();
    info!(
        completed = stats.jobs_completed,
        failed = stats.jobs_failed,
        timed_out = stats.jobs_timed_out,
        ownership_lost = stats.ownership_lost,
        "Worker exited"
    );
    Ok(())
}

async fn run_monitor_command(
    config: CrawlfleetConfig,
    config_path: Option<PathBuf>,
    args: MonitorArgs,
) -> anyhow::Result<()> {
    init_metrics()?;
    let backend = Backend::connect(&config).await?;
    let shutdown = spawn_signal_handler();

    let monitor = HeartbeatMonitor::new(
        backend.registry.clone(),
        backend.repository.clone(),
        config.monitor.clone(),
    );
    let collector = MetricsCollector::new(backend.repository.clone(), backend.registry.clone())
        .with_sink(Arc::new(LogSink));

    let monitor_task = {
        let shutdown = shutdown.clone();
        async move { monitor.run(shutdown).await }
    };

    if args.no_autoscale || !config.autoscaler.enabled {
        info!("Auto-scaler disabled");
        let interval = config.autoscaler.evaluation_interval;
        tokio::join!(monitor_task, collector.run(interval, shutdown));
        return Ok(());
    }

    let fleet: Arc<dyn FleetManager> = if args.dry_run {
        Arc::new(DryRunFleet::new())
    } else {
        let mut worker_args = vec!["--redis-url".to_string(), config.store.redis_url.clone()];
        if let Some(path) = &config_path {
            worker_args.push("--config".to_string());
            worker_args.push(path.to_string_lossy().into_owned());
        }
        Arc::new(ProcessFleet::current_exe(worker_args)?)
    };
    let scaler = AutoScaler::new(
        config.autoscaler.clone(),
        backend.store.clone(),
        backend.keys.clone(),
        ResourceManager::system(config.resources.clone()),
        fleet,
    );

    tokio::join!(monitor_task, scaler.run(&collector, shutdown));
    Ok(())
}
