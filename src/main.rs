use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use transcode_dispatch::config::{BackoffConfig, DispatchConfig};
use transcode_dispatch::node::DispatchNode;
use transcode_dispatch::scheduler::{Engine, Job};
use transcode_dispatch::shutdown::install_shutdown_handler;
use transcode_dispatch::store::{StateStore, DEFAULT_STATE_FILE};

#[derive(Parser, Debug)]
#[command(name = "transcode-dispatch")]
#[command(version)]
#[command(about = "Dispatches transcoding jobs to a pool of remote engines")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the dispatch server
    Server(ServerArgs),

    /// Print the jobs and engines held in a state file
    Inspect(InspectArgs),
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Path of the persisted state document
    #[arg(long, default_value = DEFAULT_STATE_FILE)]
    state_file: PathBuf,

    /// IP address to bind the HTTP API to
    #[arg(long, default_value = "127.0.0.1")]
    host: IpAddr,

    /// Port for the HTTP API
    #[arg(long, default_value = "8080")]
    port: u16,

    /// Jobs smaller than this are sent to the slowest eligible engine
    #[arg(long, default_value = "50")]
    small_job_threshold: f64,

    /// Retry bound for submissions that do not specify one
    #[arg(long, default_value = "3")]
    default_max_retries: u32,

    /// Seconds without a heartbeat before an engine is skipped (0 disables)
    #[arg(long, default_value = "300")]
    engine_timeout_secs: u64,

    /// Seconds a job may stay assigned before it is failed (0 disables)
    #[arg(long, default_value = "1800")]
    job_timeout_secs: u64,

    /// Fallback interval for assignment passes, in milliseconds
    #[arg(long, default_value = "1000")]
    assign_interval_ms: u64,

    /// Interval for the liveness sweep, in milliseconds
    #[arg(long, default_value = "30000")]
    sweep_interval_ms: u64,

    /// Upper bound for the assignment backoff, in milliseconds
    #[arg(long, default_value = "5000")]
    max_backoff_ms: u64,
}

// =============================================================================
// Inspect Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct InspectArgs {
    /// Path of the persisted state document
    #[arg(long, default_value = DEFAULT_STATE_FILE)]
    state_file: PathBuf,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Serialize)]
struct InspectOutput<'a> {
    jobs: Vec<&'a Job>,
    engines: Vec<&'a Engine>,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn secs_to_optional_ms(secs: u64) -> Option<u64> {
    if secs == 0 {
        None
    } else {
        Some(secs.saturating_mul(1000))
    }
}

fn truncate(value: &str, max: usize) -> String {
    if value.chars().count() > max {
        let head: String = value.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", head)
    } else {
        value.to_string()
    }
}

// =============================================================================
// Command Handlers
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let listen_addr = SocketAddr::from((args.host, args.port));

    let config = DispatchConfig {
        state_file: args.state_file,
        listen_addr,
        small_job_threshold: args.small_job_threshold,
        default_max_retries: args.default_max_retries,
        engine_timeout_ms: secs_to_optional_ms(args.engine_timeout_secs),
        job_timeout_ms: secs_to_optional_ms(args.job_timeout_secs),
        assign_interval_ms: args.assign_interval_ms,
        sweep_interval_ms: args.sweep_interval_ms,
        backoff: BackoffConfig {
            max_ms: args.max_backoff_ms,
            ..BackoffConfig::default()
        },
    };

    tracing::info!(
        listen_addr = %config.listen_addr,
        state_file = %config.state_file.display(),
        small_job_threshold = config.small_job_threshold,
        engine_timeout_ms = ?config.engine_timeout_ms,
        job_timeout_ms = ?config.job_timeout_ms,
        "Starting transcode dispatcher"
    );

    let shutdown = CancellationToken::new();
    install_shutdown_handler(shutdown.clone());

    let node = DispatchNode::new(config).await?;
    node.run(shutdown).await?;

    Ok(())
}

async fn handle_inspect(args: InspectArgs) -> Result<(), Box<dyn std::error::Error>> {
    let store = StateStore::new(&args.state_file);
    let Some((jobs, engines)) = store.load().await? else {
        eprintln!("No state found at {}", args.state_file.display());
        std::process::exit(1);
    };

    match args.output {
        OutputFormat::Json => {
            let output = InspectOutput {
                jobs: jobs.list(),
                engines: engines.list(),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Jobs");
            println!("{}", "=".repeat(40));
            if jobs.is_empty() {
                println!("No jobs found.");
            } else {
                println!(
                    "{:<38} {:<20} {:>8} {:>7} {:<16} SOURCE",
                    "JOB ID", "STATUS", "SIZE", "RETRY", "ENGINE"
                );
                println!("{}", "-".repeat(110));
                for job in jobs.list() {
                    println!(
                        "{:<38} {:<20} {:>8.1} {:>3}/{:<3} {:<16} {}",
                        job.id,
                        job.status,
                        job.job_size,
                        job.retries,
                        job.max_retries,
                        job.assigned_engine.as_deref().unwrap_or("-"),
                        truncate(&job.source_url, 30)
                    );
                }
            }

            println!();
            println!("Engines");
            println!("{}", "=".repeat(40));
            if engines.is_empty() {
                println!("No engines found.");
            } else {
                println!(
                    "{:<20} {:<6} {:>10} {:>10} LAST HEARTBEAT",
                    "ENGINE ID", "STATUS", "STORAGE", "BENCHMARK"
                );
                println!("{}", "-".repeat(80));
                for engine in engines.list() {
                    let benchmark = engine
                        .benchmark_time
                        .map(|t| format!("{:.2}", t))
                        .unwrap_or_else(|| "-".to_string());
                    println!(
                        "{:<20} {:<6} {:>10.1} {:>10} {}",
                        truncate(&engine.id, 20),
                        engine.status,
                        engine.storage_capacity,
                        benchmark,
                        engine.last_heartbeat.to_rfc3339()
                    );
                }
            }
            println!();
            println!("{} jobs, {} engines", jobs.len(), engines.len());
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
        Commands::Server(server_args) => {
            run_server(server_args).await?;
        }
        Commands::Inspect(inspect_args) => {
            handle_inspect(inspect_args).await?;
        }
    }

    Ok(())
}
