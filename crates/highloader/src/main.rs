mod request_log;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use highloader_core::{
    build_engine, build_engine_with_transport, example_payload, CallEngine, CallParams,
    DispatchLoop, DispatchSummary, EngineOptions, MockTransport, OutcomeAggregator,
    OutcomeSnapshot, ParsedSchema, RequestConfig, RunConfig, SchemaReflector,
};
use request_log::RequestLogs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument, Level, Subscriber};
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

#[derive(Parser, Debug)]
#[command(name = "highloader")]
#[command(about = "Load generator for gRPC services described by .proto files")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Dispatch every request in a run configuration until it stops
    Run(RunArgs),
    /// List services, methods and example payloads of a .proto file
    Inspect(InspectArgs),
    /// Write a run configuration skeleton for a .proto file
    Init(InitArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Path to run configuration (.json or .toml)
    #[arg(long, default_value = "config/highloader.json")]
    config: PathBuf,

    /// Transport mode: grpc or mock
    #[arg(long, default_value = "grpc")]
    mode: String,

    /// Target host (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// Print stats every N milliseconds
    #[arg(long, default_value = "1000")]
    print_every_ms: u64,

    /// How long to wait for in-flight calls after dispatch stops
    #[arg(long, default_value = "5000")]
    drain_ms: u64,

    /// Extra directory to search for imports (repeatable)
    #[arg(long = "import-path")]
    import_paths: Vec<PathBuf>,

    /// Connect before dispatching instead of on the first call
    #[arg(long)]
    eager: bool,
}

#[derive(Args, Debug)]
struct InspectArgs {
    /// Path to .proto file
    #[arg(long)]
    proto: PathBuf,

    /// Extra directory to search for imports (repeatable)
    #[arg(long = "import-path")]
    import_paths: Vec<PathBuf>,

    /// Print the parsed schema as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct InitArgs {
    /// Path to .proto file
    #[arg(long)]
    proto: PathBuf,

    /// Target host written into the configuration
    #[arg(long, default_value = "localhost:50051")]
    host: String,

    /// Output path (.json or .toml)
    #[arg(long, default_value = "config/highloader.json")]
    out: PathBuf,

    /// Extra directory to search for imports (repeatable)
    #[arg(long = "import-path")]
    import_paths: Vec<PathBuf>,

    /// Overwrite an existing file
    #[arg(long)]
    force: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct RunResult {
    timestamp: String,
    host: String,
    mode: String,
    duration_ms: u64,
    requests: Vec<RequestResult>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RequestResult {
    label: String,
    target: String,
    rate: u64,
    scheduled: u64,
    achieved_rate: u64,
    outcomes: OutcomeSnapshot,
}

/// One request entry ready to dispatch.
struct Job {
    params: CallParams,
    engine: Arc<CallEngine>,
    aggregator: Arc<OutcomeAggregator>,
    dispatch: Arc<DispatchLoop>,
    metrics_path: Option<PathBuf>,
    /// Key of this request's log file, if it has one.
    log_id: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing: stderr by RUST_LOG, plus per-request files at debug
    let request_logs = RequestLogs::new();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer().with_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            ),
        )
        .with(request_log_layer(&request_logs))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run(args) => run(args, &request_logs).await,
        Command::Inspect(args) => inspect(args),
        Command::Init(args) => init(args),
    }
}

async fn run(args: RunArgs, request_logs: &RequestLogs) -> Result<()> {
    let mut config = load_run_config(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;
    if let Some(host) = args.host.clone() {
        config.host = host;
    }
    if config.host.trim().is_empty() && args.mode == "grpc" {
        anyhow::bail!("No target host: set `host` in the config or pass --host");
    }

    let options = EngineOptions {
        import_paths: args.import_paths.clone(),
        eager_connect: args.eager,
        ..EngineOptions::default()
    };

    info!(
        "Starting {} request(s) against {:?} in {} mode",
        config.request_count(),
        config.host,
        args.mode
    );

    let jobs = prepare_jobs(&config, &args.mode, &options, request_logs).await?;
    if jobs.is_empty() {
        anyhow::bail!("No runnable requests in {:?}", args.config);
    }

    let start_time = Instant::now();
    let token = CancellationToken::new();

    // Ctrl-C stops every loop
    {
        let token = token.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted, stopping dispatch");
                token.cancel();
            }
        });
    }

    let handles: Vec<JoinHandle<Result<DispatchSummary>>> =
        jobs.iter().map(|job| spawn_dispatch(job, &token)).collect();

    let progress_done = CancellationToken::new();
    let progress = tokio::spawn(print_progress_every(
        jobs.iter()
            .map(|job| (job.params.label(), job.aggregator.clone()))
            .collect(),
        Duration::from_millis(args.print_every_ms.max(1)),
        progress_done.clone(),
    ));

    let mut summaries: Vec<Option<DispatchSummary>> = Vec::with_capacity(handles.len());
    for (job, handle) in jobs.iter().zip(handles) {
        match handle.await? {
            Ok(summary) => summaries.push(Some(summary)),
            Err(e) => {
                warn!("Dispatch for {} failed: {:#}", job.params.label(), e);
                summaries.push(None);
            }
        }
    }

    // Wait for in-flight calls to complete
    info!("Waiting for in-flight calls to complete...");
    drain(&jobs, Duration::from_millis(args.drain_ms)).await;
    stop_progress(&progress_done, progress).await;

    for job in &jobs {
        job.engine.close();
    }

    let mut requests = Vec::with_capacity(jobs.len());
    for (job, summary) in jobs.iter().zip(&summaries) {
        let snapshot = job.aggregator.snapshot();
        if let Some(path) = &job.metrics_path {
            match write_json(path, &snapshot) {
                Ok(()) => info!("Metrics for {} written to {:?}", job.params.label(), path),
                Err(e) => warn!("Could not write metrics to {:?}: {:#}", path, e),
            }
        }
        requests.push(RequestResult {
            label: job.params.label(),
            target: job.params.target.clone(),
            rate: job.params.rate,
            scheduled: summary.as_ref().map_or(0, |s| s.scheduled),
            achieved_rate: snapshot.achieved_rate(),
            outcomes: snapshot,
        });
    }

    let result = RunResult {
        timestamp: chrono::Utc::now().to_rfc3339(),
        host: config.host.clone(),
        mode: args.mode.clone(),
        duration_ms: start_time.elapsed().as_millis() as u64,
        requests,
    };

    // Write results to file
    let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
    let output_path = PathBuf::from(format!("results/run_{}.json", timestamp));
    write_json(&output_path, &result)?;

    info!("Results written to {:?}", output_path);
    print_summary(&result);

    Ok(())
}

/// File layer for per-request logs. Responses are logged at debug, so the
/// files keep them even when stderr stays at info.
fn request_log_layer<S>(request_logs: &RequestLogs) -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    request_logs.layer().with_filter(filter_fn(|meta| {
        meta.target().starts_with("highloader") && *meta.level() <= Level::DEBUG
    }))
}

/// Run one job's loop inside a `request` span so its events reach the
/// request's log file.
fn spawn_dispatch(job: &Job, token: &CancellationToken) -> JoinHandle<Result<DispatchSummary>> {
    let token = token.clone();
    let dispatch = job.dispatch.clone();
    let engine = job.engine.clone();
    let params = job.params.clone();
    let aggregator = job.aggregator.clone();
    let span = info_span!(
        "request",
        log_id = job.log_id.as_deref().unwrap_or_default(),
        label = %params.label()
    );
    tokio::spawn(
        async move {
            let summary = dispatch.start(&token, engine, &params, &aggregator).await?;
            Ok(summary)
        }
        .instrument(span),
    )
}

/// Turn every request entry into a job. Entries that cannot be built are
/// reported and skipped; the rest still run.
async fn prepare_jobs(
    config: &RunConfig,
    mode: &str,
    options: &EngineOptions,
    request_logs: &RequestLogs,
) -> Result<Vec<Job>> {
    let mock = match mode {
        "grpc" => None,
        "mock" => Some(Arc::new(MockTransport::new(Duration::from_millis(5)))), // 5ms simulated latency
        _ => anyhow::bail!("Invalid mode: {}, must be 'grpc' or 'mock'", mode),
    };
    let reflector = SchemaReflector::with_import_paths(options.import_paths.clone());

    let mut jobs = Vec::new();
    for proto in &config.proto {
        let schema = match reflector.resolve(&proto.file_path) {
            Ok(schema) => Arc::new(schema),
            Err(e) => {
                warn!("Skipping {} request(s): {}", proto.requests.len(), e);
                continue;
            }
        };

        for request in &proto.requests {
            let params = match request.to_call_params(schema.clone(), &config.host) {
                Ok(params) => params,
                Err(e) => {
                    warn!(
                        "Skipping {}/{}: {}",
                        request.service, request.method, e
                    );
                    continue;
                }
            };
            let aggregator = Arc::new(OutcomeAggregator::new());
            let engine = match &mock {
                Some(transport) => build_engine_with_transport(
                    &params,
                    aggregator.clone(),
                    options,
                    transport.clone(),
                ),
                None => build_engine(&params, aggregator.clone(), options).await,
            };
            let engine = match engine {
                Ok(engine) => Arc::new(engine),
                Err(e) => {
                    warn!("Skipping {}: {}", params.label(), e);
                    continue;
                }
            };

            let log_id = match request.log_path.trim() {
                "" => None,
                path => {
                    let log_id = format!("{}#{}", params.label(), jobs.len());
                    match request_logs.open(&log_id, Path::new(path)) {
                        Ok(()) => Some(log_id),
                        Err(e) => {
                            warn!("Could not open log file {:?} for {}: {}", path, params.label(), e);
                            None
                        }
                    }
                }
            };

            info!(
                "Prepared {} at {} calls/s via {}",
                params.label(),
                params.rate,
                engine.transport_name()
            );
            jobs.push(Job {
                metrics_path: metrics_path(request),
                log_id,
                params,
                engine,
                aggregator,
                dispatch: Arc::new(DispatchLoop::new()),
            });
        }
    }
    Ok(jobs)
}

fn metrics_path(request: &RequestConfig) -> Option<PathBuf> {
    let path = request.metrics_path.trim();
    (!path.is_empty()).then(|| PathBuf::from(path))
}

/// Poll until every started attempt has an outcome or `limit` passes.
async fn drain(jobs: &[Job], limit: Duration) {
    let started = Instant::now();
    loop {
        let pending: u64 = jobs
            .iter()
            .map(|job| {
                let snapshot = job.aggregator.snapshot();
                snapshot.total.saturating_sub(snapshot.completed())
            })
            .sum();
        if pending == 0 {
            return;
        }
        if started.elapsed() >= limit {
            warn!("{} call(s) still in flight after {:?}", pending, limit);
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn print_progress_every(
    jobs: Vec<(String, Arc<OutcomeAggregator>)>,
    every: Duration,
    done: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = done.cancelled() => return,
            _ = ticker.tick() => {}
        }
        for (label, aggregator) in &jobs {
            print_progress(label, &aggregator.snapshot());
        }
    }
}

/// Stop the progress reporter. Returns false if it had panicked or was
/// aborted, which is logged but does not fail the run.
async fn stop_progress(done: &CancellationToken, progress: JoinHandle<()>) -> bool {
    done.cancel();
    match progress.await {
        Ok(()) => true,
        Err(e) => {
            warn!("Progress reporter failed: {}", e);
            false
        }
    }
}

fn print_progress(label: &str, snapshot: &OutcomeSnapshot) {
    let outcomes = snapshot
        .non_zero()
        .map(|(outcome, count)| format!("{}={}", outcome, count))
        .collect::<Vec<_>>()
        .join(" ");

    info!(
        "Progress {}: total={} completed={} rate={}/s {}",
        label,
        snapshot.total,
        snapshot.completed(),
        snapshot.achieved_rate(),
        outcomes
    );
}

fn print_summary(result: &RunResult) {
    println!("\n=== Run Summary ===");
    println!("Host: {}", result.host);
    println!("Mode: {}", result.mode);
    println!("Duration: {}ms", result.duration_ms);
    for request in &result.requests {
        println!();
        println!("{} (target {} calls/s)", request.label, request.rate);
        println!("  Scheduled: {}", request.scheduled);
        println!("  Total: {}", request.outcomes.total);
        println!("  Succeeded: {}", request.outcomes.succeeded());
        println!("  Failed: {}", request.outcomes.failed());
        println!("  Achieved rate: {}/s", request.achieved_rate);
        for (outcome, count) in request.outcomes.non_zero() {
            println!("    {}: {}", outcome, count);
        }
    }
    println!();
}

fn inspect(args: InspectArgs) -> Result<()> {
    let schema = resolve(&args.proto, &args.import_paths)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&schema)?);
        return Ok(());
    }

    println!("Package: {}", schema.package);
    for service in &schema.services {
        println!("\nservice {}", service.full_name);
        for method in &service.methods {
            println!("  {} [{}] ({})", method.name, method.call_pattern, method.request.full_name);
        }
    }
    for (service, method) in schema.unary_methods() {
        println!("\n--- {}/{} example ---", service.name, method.name);
        println!("{}", example_payload(&method.request, &schema));
    }
    Ok(())
}

fn init(args: InitArgs) -> Result<()> {
    if args.out.exists() && !args.force {
        anyhow::bail!("{:?} already exists, pass --force to overwrite", args.out);
    }

    let schema = resolve(&args.proto, &args.import_paths)?;
    let config = RunConfig::skeleton(&schema, &args.host);
    if config.request_count() == 0 {
        warn!("{:?} has no unary methods, writing an empty request list", args.proto);
    }

    save_run_config(&args.out, &config)?;
    info!(
        "Wrote {} request(s) to {:?}",
        config.request_count(),
        args.out
    );
    Ok(())
}

fn resolve(proto: &Path, import_paths: &[PathBuf]) -> Result<ParsedSchema> {
    SchemaReflector::with_import_paths(import_paths.to_vec())
        .resolve(proto)
        .with_context(|| format!("Failed to load schema from {:?}", proto))
}

fn is_toml(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("toml")
}

fn load_run_config(path: &Path) -> Result<RunConfig> {
    let contents = std::fs::read_to_string(path)?;
    let config = if is_toml(path) {
        toml::from_str(&contents)?
    } else {
        serde_json::from_str(&contents)?
    };
    Ok(config)
}

fn save_run_config(path: &Path, config: &RunConfig) -> Result<()> {
    if is_toml(path) {
        create_parent(path)?;
        std::fs::write(path, toml::to_string_pretty(config)?)?;
        Ok(())
    } else {
        write_json(path, config)
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    create_parent(path)?;
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, json).with_context(|| format!("Failed to write {:?}", path))?;
    Ok(())
}

fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {:?}", parent))?;
    }
    Ok(())
}
