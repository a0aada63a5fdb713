use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn, Level};
use vulnflow::{
    cache::{KeyedCache, RedisCacheBackend},
    config::Config,
    model::{AnalysisRequest, Job, PipelineResult, VulnerabilityId, DEFAULT_VERSION_SELECTOR},
    output::{format_result_to_string, print_dead_letter_list, print_result, OutputFormat},
    queue::{JobQueue, RedisQueueBackend},
    source::{
        http_client, AgentEnrichmentSource, AgentSynthesisSource, EpssScoreSource,
        NvdCvssSource, OsvMappingSource,
    },
    store::FileResultStore,
    telemetry, GatewayError, PipelineError, PipelineOrchestrator, PipelineSources,
    PollingGateway, Progress, QueueError, Resolution, Worker,
};

/// Exit codes for callers that need to tell retryable from hard failures
mod exit_codes {
    pub const SUCCESS: u8 = 0;
    pub const ERROR: u8 = 1;
    pub const INVALID_INPUT: u8 = 2;
    pub const UNAVAILABLE: u8 = 3;
    pub const IN_PROGRESS: u8 = 4;
}

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "vulnflow")]
#[command(
    author,
    version,
    about = "Analyse package vulnerabilities through a queue-backed risk pipeline"
)]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    /// Log debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct RequestArgs {
    /// Package name
    subject: String,

    /// Package ecosystem (npm, PyPI, crates.io, ...)
    #[arg(short, long)]
    ecosystem: String,

    /// Version selector
    #[arg(short, long, default_value = DEFAULT_VERSION_SELECTOR)]
    selector: String,

    /// Ignore cached and stored results
    #[arg(long)]
    force: bool,
}

impl RequestArgs {
    fn request(&self) -> AnalysisRequest {
        AnalysisRequest::new(&self.subject, &self.selector, &self.ecosystem)
            .force_refresh(self.force)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline in this process
    Run {
        #[command(flatten)]
        request: RequestArgs,

        /// Output format (table, json)
        #[arg(short, long)]
        format: Option<String>,

        /// Write output to file
        #[arg(short, long)]
        output: Option<String>,

        /// Do not persist stage results
        #[arg(long)]
        no_store: bool,
    },

    /// Return a stored result, or enqueue a job and wait for one
    Resolve {
        #[command(flatten)]
        request: RequestArgs,

        /// Output format (table, json)
        #[arg(short, long)]
        format: Option<String>,
    },

    /// Look up the newest stored result that reports a vulnerability
    Lookup {
        /// Vulnerability identifier (CVE-..., GHSA-...)
        id: String,

        /// Output format (table, json)
        #[arg(short, long)]
        format: Option<String>,
    },

    /// Enqueue a job without waiting for it
    Enqueue {
        #[command(flatten)]
        request: RequestArgs,
    },

    /// Consume jobs until interrupted
    Worker {
        /// Number of consumer loops, each with its own queue connection
        #[arg(short = 'n', long, default_value_t = 1)]
        workers: usize,
    },

    /// List failed jobs
    DeadLetters {
        /// Maximum number of entries to show
        #[arg(short, long, default_value_t = 20)]
        limit: usize,

        /// Put the listed jobs back on the queue
        #[arg(long)]
        replay: bool,

        /// Output format (table, json)
        #[arg(short, long)]
        format: Option<String>,
    },

    /// Show or create config file
    Config {
        /// Generate default config file
        #[arg(long)]
        init: bool,

        /// Show config file path
        #[arg(long)]
        path: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(exit_codes::ERROR)
        }
    }
}

async fn run() -> Result<u8> {
    let cli = Cli::parse();
    let level = if cli.verbose { Level::DEBUG } else { Level::WARN };
    telemetry::init(cli.log_json, level);

    let config = Config::load().unwrap_or_else(|e| {
        warn!(error = %e, "could not load config file, using defaults");
        Config::default()
    });

    match cli.command {
        Commands::Run {
            request,
            format,
            output,
            no_store,
        } => {
            let format = parse_format(format, &config)?;
            run_pipeline(&config, request.request(), format, output, !no_store).await
        }
        Commands::Resolve { request, format } => {
            let format = parse_format(format, &config)?;
            resolve(&config, request.request(), format).await
        }
        Commands::Lookup { id, format } => {
            let format = parse_format(format, &config)?;
            lookup(&config, &id, format).await
        }
        Commands::Enqueue { request } => enqueue(&config, request.request()).await,
        Commands::Worker { workers } => run_workers(&config, workers.max(1)).await,
        Commands::DeadLetters {
            limit,
            replay,
            format,
        } => {
            let format = parse_format(format, &config)?;
            dead_letters(&config, limit, replay, format).await
        }
        Commands::Config { init, path } => {
            handle_config(init, path)?;
            Ok(exit_codes::SUCCESS)
        }
    }
}

fn parse_format(format: Option<String>, config: &Config) -> Result<OutputFormat> {
    let format = format.unwrap_or_else(|| config.default_format.clone());
    OutputFormat::from_str(&format).map_err(|e| anyhow::anyhow!(e))
}

fn build_sources(config: &Config) -> Result<PipelineSources> {
    let settings = &config.sources;
    let client = http_client(settings.request_timeout())?;
    let retry = settings.retry_policy();

    Ok(PipelineSources {
        mapping: Arc::new(OsvMappingSource::new(client.clone(), &settings.osv_url, retry)),
        epss: Arc::new(EpssScoreSource::new(client.clone(), &settings.epss_url, retry)),
        cvss: Arc::new(NvdCvssSource::new(client.clone(), &settings.nvd_url, retry)),
        enrichment: Arc::new(AgentEnrichmentSource::new(
            client.clone(),
            &settings.enrichment_url,
            settings.api_key.clone(),
            retry,
        )),
        synthesis: Arc::new(AgentSynthesisSource::new(
            client,
            &settings.synthesis_url,
            settings.api_key.clone(),
            retry,
        )),
    })
}

/// Connects the cache, degrading to no caching when Redis is unreachable.
async fn connect_cache(config: &Config) -> Arc<KeyedCache> {
    if !config.cache.enabled {
        return Arc::new(KeyedCache::disabled());
    }

    match tokio::time::timeout(CONNECT_TIMEOUT, RedisCacheBackend::connect(&config.redis_url)).await
    {
        Ok(Ok(backend)) => Arc::new(KeyedCache::new(Arc::new(backend), config.cache_io_timeout())),
        Ok(Err(e)) => {
            warn!(error = %e, "cache unavailable, running without caching");
            Arc::new(KeyedCache::disabled())
        }
        Err(_) => {
            warn!("cache connection timed out, running without caching");
            Arc::new(KeyedCache::disabled())
        }
    }
}

/// Opens a queue on a dedicated connection.
async fn connect_queue(config: &Config) -> Result<Arc<JobQueue>, QueueError> {
    let backend = RedisQueueBackend::connect(&config.redis_url, CONNECT_TIMEOUT).await?;

    Ok(Arc::new(JobQueue::new(
        Arc::new(backend),
        &config.queue_key,
        &config.dead_letter_key,
    )))
}

fn file_store(config: &Config) -> Arc<FileResultStore> {
    Arc::new(FileResultStore::new(config.store.data_dir()))
}

async fn orchestrator(config: &Config, persist: bool) -> Result<PipelineOrchestrator> {
    let cache = connect_cache(config).await;
    let orchestrator = PipelineOrchestrator::new(build_sources(config)?, cache, config.agent_settings());
    Ok(if persist {
        orchestrator.with_store(file_store(config))
    } else {
        orchestrator
    })
}

fn spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.enable_steady_tick(Duration::from_millis(100));
    pb.set_message(message.to_string());
    pb
}

async fn run_pipeline(
    config: &Config,
    request: AnalysisRequest,
    format: OutputFormat,
    output_file: Option<String>,
    persist: bool,
) -> Result<u8> {
    let is_interactive = format == OutputFormat::Table;
    let orchestrator = orchestrator(config, persist).await?;

    let pb = is_interactive.then(|| spinner(&format!("Analysing {}...", request)));
    let progress = match &pb {
        Some(pb) => {
            let pb = pb.clone();
            Progress::new(move |stage, message| pb.set_message(format!("[{}] {}", stage, message)))
        }
        None => Progress::noop(),
    };

    let outcome = orchestrator.run(&request, &progress).await;
    if let Some(pb) = &pb {
        pb.finish_and_clear();
    }

    match outcome {
        Ok(result) => {
            emit(&result, format, output_file)?;
            Ok(exit_codes::SUCCESS)
        }
        Err(PipelineError::Invalid(e)) => {
            eprintln!("Invalid request: {}", e);
            Ok(exit_codes::INVALID_INPUT)
        }
        Err(e) => Err(e.into()),
    }
}

fn emit(result: &PipelineResult, format: OutputFormat, output_file: Option<String>) -> Result<()> {
    if let Some(path) = output_file {
        std::fs::write(&path, format_result_to_string(result)?)
            .with_context(|| format!("writing {}", path))?;
        if format == OutputFormat::Table {
            println!("Results written to: {}", path);
        }
        return Ok(());
    }
    print_result(result, format)
}

/// The gateway's queue connects on first enqueue, so stored results are still
/// served while Redis is down.
async fn gateway(config: &Config) -> Result<PollingGateway, GatewayError> {
    let backend = RedisQueueBackend::open(&config.redis_url, CONNECT_TIMEOUT).map_err(|e| {
        GatewayError::ServiceUnavailable {
            service: "queue".to_string(),
            reason: e.to_string(),
        }
    })?;
    let queue = Arc::new(JobQueue::new(
        Arc::new(backend),
        &config.queue_key,
        &config.dead_letter_key,
    ));
    Ok(PollingGateway::new(
        file_store(config),
        queue,
        connect_cache(config).await,
        config.gateway.gateway_config(),
    ))
}

fn gateway_exit_code(error: &GatewayError) -> u8 {
    eprintln!("{}", error);
    match error {
        GatewayError::InvalidInput(_) => exit_codes::INVALID_INPUT,
        GatewayError::ServiceUnavailable { .. } => exit_codes::UNAVAILABLE,
    }
}

async fn resolve(config: &Config, request: AnalysisRequest, format: OutputFormat) -> Result<u8> {
    if let Err(e) = request.validate() {
        return Ok(gateway_exit_code(&e.into()));
    }
    let gateway = match gateway(config).await {
        Ok(gateway) => gateway,
        Err(e) => return Ok(gateway_exit_code(&e)),
    };

    let pb = (format == OutputFormat::Table).then(|| spinner(&format!("Waiting for {}...", request)));
    let resolution = gateway.resolve(&request).await;
    if let Some(pb) = pb {
        pb.finish_and_clear();
    }

    match resolution {
        Ok(Resolution::Ready(result)) => {
            print_result(&result, format)?;
            Ok(exit_codes::SUCCESS)
        }
        Ok(Resolution::InProgress { waited }) => {
            eprintln!(
                "Analysis of {} still in progress after {}s, try again later.",
                request,
                waited.as_secs()
            );
            Ok(exit_codes::IN_PROGRESS)
        }
        Err(e) => Ok(gateway_exit_code(&e)),
    }
}

async fn lookup(config: &Config, id: &str, format: OutputFormat) -> Result<u8> {
    let id = match VulnerabilityId::parse(id) {
        Ok(id) => id,
        Err(e) => return Ok(gateway_exit_code(&e.into())),
    };
    let gateway = match gateway(config).await {
        Ok(gateway) => gateway,
        Err(e) => return Ok(gateway_exit_code(&e)),
    };

    match gateway.find_by_vulnerability(&id).await {
        Ok(Some(result)) => {
            print_result(&result, format)?;
            Ok(exit_codes::SUCCESS)
        }
        Ok(None) => {
            eprintln!("No stored result reports {}.", id);
            Ok(exit_codes::ERROR)
        }
        Err(e) => Ok(gateway_exit_code(&e)),
    }
}

async fn enqueue(config: &Config, request: AnalysisRequest) -> Result<u8> {
    if let Err(e) = request.validate() {
        return Ok(gateway_exit_code(&e.into()));
    }
    let queue = match connect_queue(config).await {
        Ok(queue) => queue,
        Err(e) => {
            eprintln!("Queue unavailable: {}", e);
            return Ok(exit_codes::UNAVAILABLE);
        }
    };

    let job = Job::new(&request, "cli");
    if !queue.enqueue(&job).await {
        eprintln!("Could not enqueue job for {}.", request);
        return Ok(exit_codes::UNAVAILABLE);
    }
    println!("{}", job.job_id);
    Ok(exit_codes::SUCCESS)
}

async fn run_workers(config: &Config, count: usize) -> Result<u8> {
    let orchestrator = Arc::new(orchestrator(config, true).await?);

    let mut queues = Vec::with_capacity(count);
    for _ in 0..count {
        match connect_queue(config).await {
            Ok(queue) => queues.push(queue),
            Err(e) => {
                eprintln!("Queue unavailable: {}", e);
                return Ok(exit_codes::UNAVAILABLE);
            }
        }
    }

    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown requested, finishing in-flight jobs");
        tx.send(true).ok();
    });

    let handles: Vec<_> = queues
        .into_iter()
        .map(|queue| {
            let worker = Worker::new(queue, orchestrator.clone(), config.worker.worker_config());
            let rx = rx.clone();
            tokio::spawn(async move { worker.run(rx).await })
        })
        .collect();

    let mut processed = 0;
    let mut dead_lettered = 0;
    for handle in handles {
        let stats = handle.await.context("worker task failed")?;
        processed += stats.processed;
        dead_lettered += stats.dead_lettered;
    }

    eprintln!(
        "Worker stopped: {} jobs processed, {} dead-lettered.",
        processed, dead_lettered
    );
    Ok(exit_codes::SUCCESS)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

async fn dead_letters(config: &Config, limit: usize, replay: bool, format: OutputFormat) -> Result<u8> {
    let queue = match connect_queue(config).await {
        Ok(queue) => queue,
        Err(e) => {
            eprintln!("Queue unavailable: {}", e);
            return Ok(exit_codes::UNAVAILABLE);
        }
    };

    let records = queue.dead_letters(limit).await?;
    print_dead_letter_list(&records, format)?;

    if replay {
        for record in &records {
            queue.replay_dead_letter(record).await?;
        }
        eprintln!("Replayed {} jobs onto {}.", records.len(), queue.queue_key());
    } else if format == OutputFormat::Table {
        let total = queue.dead_letter_count().await?;
        println!("{} of {} dead letters shown.", records.len(), total);
    }
    Ok(exit_codes::SUCCESS)
}

fn handle_config(init: bool, show_path: bool) -> Result<()> {
    let config_path = Config::config_path();

    if show_path {
        println!("{}", config_path.display());
        return Ok(());
    }

    if init {
        if config_path.exists() {
            println!("Config file already exists at: {}", config_path.display());
            return Ok(());
        }

        let config = Config::default();
        config.save()?;
        println!("Created config file at: {}", config_path.display());
        println!();
        println!("Default configuration:");
        println!("{}", Config::generate_default_config());
        return Ok(());
    }

    // Show current config
    if config_path.exists() {
        let content = std::fs::read_to_string(&config_path)?;
        println!("Config file: {}", config_path.display());
        println!();
        println!("{}", content);
    } else {
        println!("No config file found.");
        println!("Run 'vulnflow config --init' to create one.");
        println!();
        println!("Config path: {}", config_path.display());
    }

    Ok(())
}
