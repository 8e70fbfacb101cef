use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use opchain_scheduler::client::SchedulerClient;
use opchain_scheduler::config::{self, SchedulerConfig, DEFAULT_PORT, DISCOVERY_PORT};
use opchain_scheduler::discovery;
use opchain_scheduler::node::Node;
use opchain_scheduler::protocol::{OperationStep, Operator, ResultsResponse, SubmitJobPayload};
use opchain_scheduler::shutdown::install_shutdown_handler;
use opchain_scheduler::worker::Worker;

#[derive(Parser, Debug)]
#[command(name = "opchain-scheduler")]
#[command(version)]
#[command(about = "A distributed scheduler for integer operation-chain jobs")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the scheduler
    Server(ServerArgs),

    /// Submit jobs and query their progress
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },

    /// Pull and compute work items until the scheduler stops
    Worker {
        #[command(flatten)]
        client: ClientArgs,

        /// Exit after answering this many items
        #[arg(long)]
        max_items: Option<usize>,
    },

    /// Ask the scheduler to shut down
    Shutdown {
        #[command(flatten)]
        client: ClientArgs,
    },

    /// Locate a scheduler on the local network
    Discover {
        /// Address to probe
        #[arg(long, default_value_t = SocketAddr::from((Ipv4Addr::BROADCAST, DISCOVERY_PORT)))]
        target: SocketAddr,

        /// Seconds to wait for a reply
        #[arg(long, default_value = "2")]
        timeout_secs: u64,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// TCP port to listen on (1024-65535, not the discovery port)
    #[arg(long, short = 'p', default_value_t = DEFAULT_PORT, value_parser = parse_port)]
    port: u16,

    /// Interface to bind
    #[arg(long, default_value = "0.0.0.0")]
    host: IpAddr,

    /// Maximum number of live jobs
    #[arg(long, default_value = "50")]
    max_jobs: usize,

    /// Maximum number of concurrent connections
    #[arg(long, default_value = "100")]
    max_connections: usize,

    /// Seconds a completed job stays queryable before its slot can be reused
    #[arg(long, default_value = "300")]
    retention_secs: u64,

    /// Seconds open connections get to finish after shutdown
    #[arg(long, default_value = "5")]
    drain_timeout_secs: u64,

    /// Do not answer UDP discovery probes
    #[arg(long)]
    no_discovery: bool,
}

// =============================================================================
// Client Arguments (shared by job, worker and shutdown commands)
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Scheduler address
    #[arg(long, short = 'a', default_value = "127.0.0.1:4337")]
    addr: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Job Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Submit a new job
    Submit {
        /// Operation chain, e.g. "add:3,rol:1,not"
        #[arg(long, short = 'c', value_delimiter = ',', value_parser = parse_step, required = true)]
        chain: Vec<OperationStep>,

        /// Items to run the chain over
        #[arg(required = true)]
        items: Vec<u32>,
    },
    /// Show progress of a job
    Status {
        job_id: u32,

        /// Re-queue an unfinished item untouched for this long
        #[arg(long, default_value = "5000")]
        timeout_ms: u32,
    },
    /// Fetch the answers of a completed job
    Results { job_id: u32 },
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct JobSubmitOutput {
    job_id: u32,
    items: usize,
    chain: Vec<OperationStep>,
}

#[derive(Serialize)]
struct JobStatusOutput {
    job_id: u32,
    found: bool,
    completed: u32,
    total: u32,
    mean: f64,
}

#[derive(Serialize)]
struct ResultEntry {
    item: u32,
    answer: i32,
}

#[derive(Serialize)]
struct JobResultsOutput {
    job_id: u32,
    status: String,
    results: Vec<ResultEntry>,
}

#[derive(Serialize)]
struct WorkerOutput {
    answered: usize,
}

#[derive(Serialize)]
struct ShutdownOutput {
    acknowledged: bool,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

fn parse_port(s: &str) -> Result<u16, String> {
    let port: u16 = s.parse().map_err(|e| format!("invalid port: {}", e))?;
    config::validate_port(port).map_err(|e| e.to_string())
}

/// Parse `name[:operand]`, e.g. `add:3` or `not`.
fn parse_step(s: &str) -> Result<OperationStep, String> {
    let (name, operand) = match s.trim().split_once(':') {
        Some((name, operand)) => {
            let operand: u32 = operand
                .trim()
                .parse()
                .map_err(|e| format!("invalid operand in {:?}: {}", s, e))?;
            (name.trim(), Some(operand))
        }
        None => (s.trim(), None),
    };

    let operator = match name.to_ascii_lowercase().as_str() {
        "add" => Operator::Add,
        "sub" => Operator::SubRight,
        "rsub" => Operator::SubLeft,
        "and" => Operator::And,
        "or" => Operator::Or,
        "xor" => Operator::Xor,
        "not" => Operator::Not,
        "ror" => Operator::RotateRight,
        "rol" => Operator::RotateLeft,
        other => return Err(format!("unknown operation {:?}", other)),
    };

    match (operator, operand) {
        (Operator::Not, _) => Ok(OperationStep::new(operator, operand.unwrap_or(0))),
        (_, Some(operand)) => Ok(OperationStep::new(operator, operand)),
        (_, None) => Err(format!("operation {:?} needs an operand", name)),
    }
}

async fn resolve(addr: &str) -> Result<SocketAddr, Box<dyn std::error::Error>> {
    tokio::net::lookup_host(addr)
        .await?
        .next()
        .ok_or_else(|| format!("could not resolve {}", addr).into())
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let discovery_addr = if args.no_discovery {
        None
    } else {
        Some(SocketAddr::new(args.host, DISCOVERY_PORT))
    };

    let config = SchedulerConfig::new(SocketAddr::new(args.host, args.port))
        .with_discovery(discovery_addr)
        .with_max_jobs(args.max_jobs)
        .with_max_connections(args.max_connections)
        .with_completed_job_retention(Duration::from_secs(args.retention_secs))
        .with_drain_timeout(Duration::from_secs(args.drain_timeout_secs));

    tracing::info!(
        listen_addr = %config.listen_addr,
        discovery_addr = ?config.discovery_addr,
        max_jobs = config.max_jobs,
        max_connections = config.max_connections,
        "Starting scheduler"
    );

    let shutdown = CancellationToken::new();
    install_shutdown_handler(shutdown.clone())?;

    let node = Node::new(config, shutdown)?;
    node.run().await?;

    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn handle_job_submit(
    client: &mut SchedulerClient,
    chain: Vec<OperationStep>,
    items: Vec<u32>,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let item_count = items.len();
    let payload = SubmitJobPayload::new(chain, items);

    match client.submit_job(&payload).await {
        Ok(job_id) => match output_format {
            OutputFormat::Json => {
                let output = JobSubmitOutput {
                    job_id,
                    items: item_count,
                    chain: payload.operations,
                };
                println!("{}", serde_json::to_string_pretty(&output)?);
            }
            OutputFormat::Table => {
                println!("Job submitted successfully!");
                println!("Job ID: {}", job_id);
            }
        },
        Err(e) => {
            eprintln!("Error: Job submission failed: {}", e);
            eprintln!("Hint: the scheduler may be at capacity, retry later");
            std::process::exit(1);
        }
    }
    Ok(())
}

async fn handle_job_status(
    client: &mut SchedulerClient,
    job_id: u32,
    timeout_ms: u32,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = client.query_status(job_id, timeout_ms).await?;

    match output_format {
        OutputFormat::Json => {
            let output = JobStatusOutput {
                job_id,
                found: !response.is_no_job(),
                completed: response.completed,
                total: response.total,
                mean: response.mean(),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            if response.is_no_job() {
                println!("Job {} not found.", job_id);
            } else {
                println!("Job ID:    {}", job_id);
                println!("Progress:  {}/{}", response.completed, response.total);
                println!("Mean:      {}", response.mean());
            }
        }
    }
    Ok(())
}

async fn handle_job_results(
    client: &mut SchedulerClient,
    job_id: u32,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = client.query_results(job_id).await?;
    let status = match &response {
        ResultsResponse::Success(_) => "SUCCESS",
        ResultsResponse::NoJob => "NOJOB",
        ResultsResponse::NotComplete => "NOTCOMPLETE",
    };
    let results = match response {
        ResultsResponse::Success(results) => results,
        _ => Vec::new(),
    };

    match output_format {
        OutputFormat::Json => {
            let output = JobResultsOutput {
                job_id,
                status: status.to_string(),
                results: results
                    .into_iter()
                    .map(|(item, answer)| ResultEntry { item, answer })
                    .collect(),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => match status {
            "NOJOB" => println!("Job {} not found.", job_id),
            "NOTCOMPLETE" => println!("Job {} is not complete yet.", job_id),
            _ => {
                println!("{:<12} ANSWER", "ITEM");
                println!("{}", "-".repeat(24));
                for (item, answer) in results {
                    println!("{:<12} {}", item, answer);
                }
            }
        },
    }
    Ok(())
}

async fn handle_worker(
    client: &ClientArgs,
    max_items: Option<usize>,
) -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let shutdown = CancellationToken::new();
    install_shutdown_handler(shutdown.clone())?;

    let mut worker = Worker::new(resolve(&client.addr).await?);
    if let Some(max) = max_items {
        worker = worker.with_max_items(max);
    }
    let answered = worker.run(shutdown).await?;

    match client.output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&WorkerOutput { answered })?);
        }
        OutputFormat::Table => println!("Answered {} work items.", answered),
    }
    Ok(())
}

async fn handle_shutdown(client_args: &ClientArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut client = SchedulerClient::connect(client_args.addr.as_str()).await?;
    let acknowledged = client.shutdown().await?;

    match client_args.output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&ShutdownOutput { acknowledged })?);
        }
        OutputFormat::Table => {
            if acknowledged {
                println!("Scheduler is shutting down.");
            } else {
                println!("Unexpected shutdown acknowledgement.");
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

    match args.command {
        Commands::Server(server_args) => {
            run_server(server_args).await?;
        }
        Commands::Job { client, command } => {
            let mut scheduler = SchedulerClient::connect(client.addr.as_str()).await?;

            match command {
                JobCommands::Submit { chain, items } => {
                    handle_job_submit(&mut scheduler, chain, items, &client.output).await?;
                }
                JobCommands::Status { job_id, timeout_ms } => {
                    handle_job_status(&mut scheduler, job_id, timeout_ms, &client.output).await?;
                }
                JobCommands::Results { job_id } => {
                    handle_job_results(&mut scheduler, job_id, &client.output).await?;
                }
            }
        }
        Commands::Worker { client, max_items } => {
            handle_worker(&client, max_items).await?;
        }
        Commands::Shutdown { client } => {
            handle_shutdown(&client).await?;
        }
        Commands::Discover {
            target,
            timeout_secs,
        } => {
            let found = discovery::discover(target, Duration::from_secs(timeout_secs)).await?;
            println!("Scheduler at {}", found);
        }
    }

    Ok(())
}
