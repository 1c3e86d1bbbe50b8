//! CLI command definitions for fragment-relay.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use futures::StreamExt;
use tracing::{info, warn};

use crate::fragment::{
    Cursor, FragmentReader, LogRetention, LogStore, MemoryLogStore, Outcome, ReaderConfig,
    RedisLogStore,
};
use crate::gateway::{SubmissionGateway, SubmitRequest};
use crate::llm::{EchoEngine, EngineRegistry, GenerationEngine, LiteLlmEngine};
use crate::metrics::{init_metrics, write_metrics_file, MetricsCollector};
use crate::scheduler::{
    MemoryWorkQueue, ModelSelector, QueueConfig, RedisWorkQueue, WorkQueue, WorkerPool,
    WorkerPoolConfig, DEFAULT_LOG_PREFIX, DEFAULT_QUEUE_NAME,
};
use crate::storage::{ConversationDirectory, OwnershipCheck, Unrestricted};

const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// Durable job dispatch and fragment streaming relay.
#[derive(Parser)]
#[command(name = "fragment-relay")]
#[command(about = "Dispatch generation jobs and stream their fragments through Redis")]
#[command(version)]
#[command(
    long_about = "fragment-relay queues generation jobs, runs them on a worker pool and writes each job's output to an append-only fragment log that any number of readers can tail.\n\nExample usage:\n  fragment-relay serve --workers 20\n  fragment-relay submit --conversation c-1 --submitter alice --model gpt-4o \"hello\"\n  fragment-relay tail relay:log:c-1:gpt-4o:<job-id>"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the worker pool and stall reaper until interrupted.
    Serve(ServeArgs),

    /// Submit one job and print its job id and log address.
    Submit(SubmitArgs),

    /// Attach to a fragment log and print fragments as they arrive.
    Tail(TailArgs),

    /// Print queue statistics as JSON.
    Stats(StatsArgs),

    /// Run gateway, pool and readers in-process with the echo engine.
    Demo(DemoArgs),
}

/// Redis connection shared by most commands.
#[derive(clap::Args, Debug, Clone)]
pub struct RedisArgs {
    /// Redis connection URL.
    #[arg(long, env = "REDIS_URL", default_value = DEFAULT_REDIS_URL)]
    pub redis_url: String,

    /// Work queue name.
    #[arg(long, env = "RELAY_QUEUE", default_value = DEFAULT_QUEUE_NAME)]
    pub queue_name: String,
}

/// Arguments for `fragment-relay serve`.
#[derive(Parser, Debug)]
pub struct ServeArgs {
    #[command(flatten)]
    pub redis: RedisArgs,

    /// Number of concurrent workers.
    #[arg(short = 'w', long, env = "RELAY_WORKERS", default_value = "20")]
    pub workers: usize,

    /// Lease length in seconds; workers heartbeat three times per lease.
    #[arg(long, env = "RELAY_LEASE_SECS", default_value = "60")]
    pub lease_secs: u64,

    /// Maximum seconds a single generation may run.
    #[arg(long, env = "RELAY_JOB_TIMEOUT_SECS", default_value = "600")]
    pub job_timeout_secs: u64,

    /// Log retention after fragments and success terminals, in seconds.
    #[arg(long, env = "RELAY_LIVE_TTL_SECS", default_value = "900")]
    pub live_ttl_secs: u64,

    /// Log retention after an error terminal, in seconds.
    #[arg(long, env = "RELAY_ERROR_TTL_SECS", default_value = "60")]
    pub error_ttl_secs: u64,

    /// Approximate cap on records per log.
    #[arg(long, env = "RELAY_MAX_LOG_LEN", default_value = "10000")]
    pub max_log_len: usize,

    /// Base URL of a LiteLLM-compatible gateway. Without it only `echo` is served.
    #[arg(long, env = "LITELLM_API_BASE")]
    pub litellm_api_base: Option<String>,

    /// API key for the LiteLLM gateway.
    #[arg(long, env = "LITELLM_API_KEY", hide_env_values = true)]
    pub litellm_api_key: Option<String>,

    /// Write Prometheus metrics to this file periodically.
    #[arg(long, env = "RELAY_METRICS_FILE")]
    pub metrics_file: Option<PathBuf>,

    /// Seconds between metrics file writes.
    #[arg(long, default_value = "15")]
    pub metrics_interval_secs: u64,
}

/// Arguments for `fragment-relay submit`.
#[derive(Parser, Debug)]
pub struct SubmitArgs {
    #[command(flatten)]
    pub redis: RedisArgs,

    /// Conversation the message belongs to.
    #[arg(short = 'c', long)]
    pub conversation: String,

    /// Submitter id checked against conversation ownership.
    #[arg(short = 's', long)]
    pub submitter: String,

    /// Model selector (gpt-4o, gpt-4o-mini, llama-3, echo).
    #[arg(short = 'm', long, default_value = "gpt-4o")]
    pub model: String,

    /// Message text.
    pub message: String,

    /// Key prefix for fragment logs.
    #[arg(long, env = "RELAY_LOG_PREFIX", default_value = DEFAULT_LOG_PREFIX)]
    pub log_prefix: String,

    /// Delivery attempts before a job is dead-lettered.
    #[arg(long, env = "RELAY_MAX_ATTEMPTS", default_value = "3")]
    pub max_attempts: u32,

    /// PostgreSQL URL of the conversation directory. Without it ownership
    /// is not checked.
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    pub database_url: Option<String>,
}

/// Arguments for `fragment-relay tail`.
#[derive(Parser, Debug)]
pub struct TailArgs {
    /// Redis connection URL.
    #[arg(long, env = "REDIS_URL", default_value = DEFAULT_REDIS_URL)]
    pub redis_url: String,

    /// Log address returned by `submit`.
    pub address: String,

    /// Resume after this record id ("start" replays from the beginning).
    #[arg(long, default_value = "start")]
    pub from: String,

    /// Longest single read wait, in milliseconds.
    #[arg(long, env = "RELAY_POLL_WAIT_MS", default_value = "1000")]
    pub poll_wait_ms: u64,

    /// Give up after this many seconds without a new record.
    #[arg(long, env = "RELAY_MAX_IDLE_SECS", default_value = "60")]
    pub max_idle_secs: u64,

    /// Seconds to wait for a log that does not exist yet.
    #[arg(long, default_value = "0")]
    pub attach_grace_secs: u64,

    /// Print record ids and sequence numbers alongside payloads.
    #[arg(short = 'v', long)]
    pub verbose: bool,
}

/// Arguments for `fragment-relay stats`.
#[derive(Parser, Debug)]
pub struct StatsArgs {
    #[command(flatten)]
    pub redis: RedisArgs,

    /// Also print up to this many dead letter entries.
    #[arg(long, default_value = "0")]
    pub dead_letters: usize,
}

/// Arguments for `fragment-relay demo`.
#[derive(Parser, Debug)]
pub struct DemoArgs {
    /// Message to echo back.
    #[arg(default_value = "the quick brown fox jumps over the lazy dog")]
    pub message: String,

    /// Number of workers.
    #[arg(short = 'w', long, default_value = "2")]
    pub workers: usize,

    /// Number of concurrent readers.
    #[arg(short = 'r', long, default_value = "3")]
    pub readers: usize,

    /// Delay between echoed words, in milliseconds.
    #[arg(long, default_value = "50")]
    pub delay_ms: u64,
}

/// Parse CLI arguments without executing the command.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Parse CLI arguments and run the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Serve(args) => run_serve_command(args).await,
        Commands::Submit(args) => run_submit_command(args).await,
        Commands::Tail(args) => run_tail_command(args).await,
        Commands::Stats(args) => run_stats_command(args).await,
        Commands::Demo(args) => run_demo_command(args).await,
    }
}

// ============================================================================
// Serve
// ============================================================================

fn build_engines(args: &ServeArgs) -> anyhow::Result<EngineRegistry> {
    let mut engines = EngineRegistry::new();
    engines.register(ModelSelector::Echo, Arc::new(EchoEngine::new()));

    match args.litellm_api_base {
        Some(ref api_base) => {
            let upstream: Arc<dyn GenerationEngine> =
                Arc::new(LiteLlmEngine::new(api_base.clone(), args.litellm_api_key.clone())?);
            for model in ModelSelector::ALL {
                if model != ModelSelector::Echo {
                    engines.register(model, Arc::clone(&upstream));
                }
            }
            info!(api_base = %api_base, "Routing hosted models through LiteLLM");
        }
        None => {
            warn!("LITELLM_API_BASE not set; only the echo model is served");
        }
    }

    Ok(engines)
}

async fn run_serve_command(args: ServeArgs) -> anyhow::Result<()> {
    init_metrics().context("Failed to initialize metrics")?;

    let retention = LogRetention::new(
        Duration::from_secs(args.live_ttl_secs),
        Duration::from_secs(args.error_ttl_secs),
    )?;
    let lease = Duration::from_secs(args.lease_secs);

    let queue_config = QueueConfig::default()
        .with_queue_name(args.redis.queue_name.clone())
        .with_lease(lease);
    let queue: Arc<dyn WorkQueue> =
        Arc::new(RedisWorkQueue::connect(&args.redis.redis_url, queue_config).await?);
    let store: Arc<dyn LogStore> = Arc::new(
        RedisLogStore::connect(&args.redis.redis_url)
            .await?
            .with_max_len(args.max_log_len),
    );
    let engines = Arc::new(build_engines(&args)?);

    let pool_config = WorkerPoolConfig::new(args.workers)
        .with_lease(lease)
        .with_job_timeout(Duration::from_secs(args.job_timeout_secs));
    let mut pool = WorkerPool::new(pool_config, Arc::clone(&queue), store, engines, retention);
    pool.start().await?;

    let metrics_task = args.metrics_file.clone().map(|path| {
        let interval = Duration::from_secs(args.metrics_interval_secs.max(1));
        let queue = Arc::clone(&queue);
        tokio::spawn(async move {
            let metrics = MetricsCollector::new();
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Ok(stats) = queue.stats().await {
                    metrics.update_queue_depth(&stats);
                }
                if let Err(e) = write_metrics_file(&path).await {
                    warn!(path = %path.display(), error = %e, "Failed to write metrics file");
                }
            }
        })
    });

    info!(
        queue = %args.redis.queue_name,
        workers = args.workers,
        "Serving; press Ctrl-C to stop"
    );
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    if let Some(task) = metrics_task {
        task.abort();
    }
    pool.shutdown().await?;

    let stats = pool.stats();
    info!(
        completed = stats.jobs_completed,
        failed = stats.jobs_failed,
        leases_lost = stats.leases_lost,
        reaped = stats.jobs_reaped,
        "Stopped"
    );
    Ok(())
}

// ============================================================================
// Submit
// ============================================================================

async fn run_submit_command(args: SubmitArgs) -> anyhow::Result<()> {
    let queue_config = QueueConfig::default().with_queue_name(args.redis.queue_name.clone());
    let queue = Arc::new(RedisWorkQueue::connect(&args.redis.redis_url, queue_config).await?);

    let ownership: Arc<dyn OwnershipCheck> = match args.database_url {
        Some(ref url) => Arc::new(ConversationDirectory::connect(url).await?),
        None => {
            warn!("DATABASE_URL not set; conversation ownership is not checked");
            Arc::new(Unrestricted)
        }
    };

    let gateway = SubmissionGateway::new(queue, ownership)
        .with_log_prefix(args.log_prefix)
        .with_max_attempts(args.max_attempts);

    let submission = gateway
        .submit(SubmitRequest {
            conversation_id: args.conversation,
            message: args.message,
            model: args.model,
            submitter_id: args.submitter,
        })
        .await?;

    println!("{}", serde_json::to_string_pretty(&submission)?);
    Ok(())
}

// ============================================================================
// Tail
// ============================================================================

async fn run_tail_command(args: TailArgs) -> anyhow::Result<()> {
    let from: Cursor = args.from.parse()?;
    let store: Arc<dyn LogStore> = Arc::new(RedisLogStore::connect(&args.redis_url).await?);
    let config = ReaderConfig::default()
        .with_poll_wait(Duration::from_millis(args.poll_wait_ms))
        .with_max_idle(Duration::from_secs(args.max_idle_secs))
        .with_attach_grace(Duration::from_secs(args.attach_grace_secs));

    let reader = FragmentReader::new(store, config);
    let mut tail = reader.tail(&args.address.as_str().into(), from).await?;
    let mut stdout = std::io::stdout();

    while let Some(record) = tail.next().await {
        let record = record?;
        match record.outcome() {
            None => {
                let payload = record.payload().unwrap_or_default();
                if args.verbose {
                    writeln!(stdout, "[{} #{}] {}", record.id, record.sequence, payload)?;
                } else {
                    write!(stdout, "{}", payload)?;
                }
                stdout.flush()?;
            }
            Some((Outcome::Success, _)) => {
                writeln!(stdout)?;
                return Ok(());
            }
            Some((Outcome::Error, reason)) => {
                writeln!(stdout)?;
                anyhow::bail!("Job failed: {}", reason.unwrap_or("unknown error"));
            }
        }
    }

    anyhow::bail!("Log ended without a terminal record")
}

// ============================================================================
// Stats
// ============================================================================

async fn run_stats_command(args: StatsArgs) -> anyhow::Result<()> {
    let queue_config = QueueConfig::default().with_queue_name(args.redis.queue_name);
    let queue = RedisWorkQueue::connect(&args.redis.redis_url, queue_config).await?;

    let stats = queue.stats().await?;
    let mut report = serde_json::json!({ "queue": stats });
    if args.dead_letters > 0 {
        report["dead_letters"] = serde_json::to_value(queue.dead_letters(args.dead_letters).await?)?;
    }

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

// ============================================================================
// Demo
// ============================================================================

async fn run_demo_command(args: DemoArgs) -> anyhow::Result<()> {
    let queue = Arc::new(MemoryWorkQueue::default());
    let store = Arc::new(MemoryLogStore::new());
    let engines = EngineRegistry::serving_all(Arc::new(
        EchoEngine::new().with_delay(Duration::from_millis(args.delay_ms)),
    ));

    let mut pool = WorkerPool::new(
        WorkerPoolConfig::new(args.workers.max(1)).with_poll_interval(Duration::from_millis(100)),
        queue.clone(),
        store.clone(),
        Arc::new(engines),
        LogRetention::default(),
    );
    pool.start().await?;

    let gateway = SubmissionGateway::new(queue, Arc::new(Unrestricted));
    let submission = gateway
        .submit(SubmitRequest {
            conversation_id: "demo".to_string(),
            message: args.message,
            model: ModelSelector::Echo.to_string(),
            submitter_id: "demo-user".to_string(),
        })
        .await?;
    info!(log_address = %submission.log_address, "Submitted demo job");

    let reader = FragmentReader::new(
        store,
        ReaderConfig::default()
            .with_poll_wait(Duration::from_millis(200))
            .with_max_idle(Duration::from_secs(10))
            .with_attach_grace(Duration::from_secs(5)),
    );

    let mut handles = Vec::new();
    for _ in 0..args.readers.max(1) {
        let reader = reader.clone();
        let address = submission.log_address.clone();
        handles.push(tokio::spawn(async move {
            let mut text = String::new();
            let mut tail = reader.tail(&address, Cursor::Start).await?;
            while let Some(record) = tail.next().await {
                let record = record?;
                if let Some(payload) = record.payload() {
                    text.push_str(payload);
                }
            }
            Ok::<String, anyhow::Error>(text)
        }));
    }

    let mut transcripts = Vec::new();
    for handle in handles {
        transcripts.push(handle.await??);
    }
    pool.shutdown().await?;

    for (i, text) in transcripts.iter().enumerate() {
        println!("reader {}: {}", i, text);
    }
    if transcripts.windows(2).any(|pair| pair[0] != pair[1]) {
        anyhow::bail!("Readers observed different transcripts");
    }
    Ok(())
}
