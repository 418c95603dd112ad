use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tonic::service::interceptor::InterceptedService;
use tonic::transport::Channel;
use tracing_subscriber::EnvFilter;

use wlm_lite::auth::{SigningKey, TokenAuthority};
use wlm_lite::config::{AgentConfig, ControllerConfig};
use wlm_lite::daemon::ControllerDaemon;
use wlm_lite::grpc::convert::{job_state_from_proto, job_state_to_proto, node_state_from_proto};
use wlm_lite::grpc::interceptor::CredentialInjector;
use wlm_lite::proto::workload_service_client::WorkloadServiceClient;
use wlm_lite::proto::{
    AccountingRecord, CancelJobRequest, GetJobRequest, JobInfo, ListAccountingRequest,
    ListJobsRequest, ListNodesRequest, NodeAdminRequest, NodeInfo, Resources, SubmitJobRequest,
};
use wlm_lite::resources::ResourceVector;
use wlm_lite::scheduler::JobState;
use wlm_lite::shutdown::install_shutdown_handler;
use wlm_lite::worker::run_agent;

#[derive(Parser, Debug)]
#[command(name = "wlm-lite")]
#[command(version)]
#[command(about = "A cluster workload manager with best-fit scheduling")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the controller daemon
    Controller(ControllerArgs),

    /// Run a node agent
    Agent(AgentArgs),

    /// Job management commands
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },

    /// Node management commands
    Node {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: NodeCommands,
    },

    /// Show accounting records of finished jobs
    History {
        #[command(flatten)]
        client: ClientArgs,

        /// Only records of this owner
        #[arg(long)]
        owner: Option<String>,

        /// Only records in this final state
        #[arg(long)]
        state: Option<JobState>,

        /// Most recent N records
        #[arg(long)]
        limit: Option<u32>,
    },

    /// Token helpers for whoever holds the signing key
    Token {
        #[command(subcommand)]
        command: TokenCommands,
    },
}

// =============================================================================
// Daemon Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ControllerArgs {
    /// TOML configuration file; flags override its values
    #[arg(long, short = 'c', env = "WLM_CONFIG")]
    config: Option<PathBuf>,

    /// gRPC listen address
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// REST gateway listen address (gateway is off when unset)
    #[arg(long)]
    gateway: Option<SocketAddr>,

    /// File holding the token signing key
    #[arg(long, env = "WLM_KEY_FILE")]
    key_file: Option<PathBuf>,

    /// JSON Lines accounting file
    #[arg(long)]
    accounting: Option<PathBuf>,

    /// Administrator user (repeatable); replaces the configured list
    #[arg(long = "admin")]
    admins: Vec<String>,

    /// Disable backfill scheduling
    #[arg(long)]
    no_backfill: bool,
}

#[derive(Parser, Debug)]
struct AgentArgs {
    /// Node ID (unique within the cluster)
    #[arg(long, env = "WLM_NODE_ID")]
    node_id: String,

    /// Agent gRPC listen address
    #[arg(long, default_value = "0.0.0.0:6818")]
    listen: SocketAddr,

    /// Address the controller should dial, if different from --listen
    #[arg(long)]
    advertise: Option<String>,

    /// Controller gRPC endpoint
    #[arg(long, default_value = "http://127.0.0.1:6817", env = "WLM_CONTROLLER")]
    controller: String,

    #[arg(long)]
    cpus: u32,

    #[arg(long)]
    memory_mb: u64,

    #[arg(long, default_value = "0")]
    gpus: u32,

    /// Used until the controller announces its own interval
    #[arg(long, default_value = "1000")]
    heartbeat_ms: u64,

    /// File holding the token signing key
    #[arg(long, env = "WLM_KEY_FILE")]
    key_file: PathBuf,
}

// =============================================================================
// Client Arguments (shared by job, node and history commands)
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Controller address
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:6817", env = "WLM_ADDR")]
    addr: String,

    /// User name the token was issued for
    #[arg(long, short = 'u', env = "WLM_USER")]
    user: String,

    /// Signed token (see `wlm-lite token issue`)
    #[arg(long, env = "WLM_TOKEN", hide_env_values = true)]
    token: String,

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
// Subcommands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Submit a new job
    Submit {
        /// The command to execute (e.g., "echo hello")
        command: String,

        #[arg(long, default_value = "")]
        name: String,

        #[arg(long, default_value = "1")]
        cpus: u32,

        #[arg(long, default_value = "0")]
        memory_mb: u64,

        #[arg(long, default_value = "0")]
        gpus: u32,

        #[arg(long, default_value = "0")]
        priority: u32,

        /// Wall-time limit in seconds (controller default when omitted)
        #[arg(long)]
        time_limit: Option<u64>,
    },
    /// Get status of a specific job
    Status {
        /// The job ID (UUID)
        job_id: String,
    },
    /// List queued, active and finished jobs
    List {
        #[arg(long)]
        state: Option<JobState>,

        #[arg(long)]
        owner: Option<String>,

        /// Number of jobs per page (default: 100, max: 1000)
        #[arg(long, default_value = "100")]
        page_size: u32,

        /// Fetch all pages automatically
        #[arg(long)]
        all: bool,
    },
    /// Cancel a job; waits until a running job is confirmed stopped
    Cancel { job_id: String },
}

#[derive(clap::Subcommand, Debug)]
enum NodeCommands {
    /// List nodes with their capacity and free resources
    List,
    /// Stop placing new jobs on a node
    Drain { node_id: String },
    /// Make a drained node schedulable again
    Resume { node_id: String },
    /// Forget a node; its jobs are handled as if it went down
    Remove { node_id: String },
}

#[derive(clap::Subcommand, Debug)]
enum TokenCommands {
    /// Sign a token for a subject (a user name, `node:<id>` or `wlm-controller`)
    Issue {
        subject: String,

        #[arg(long, env = "WLM_KEY_FILE")]
        key_file: PathBuf,

        #[arg(long, default_value = "3600")]
        lifetime_secs: u64,
    },
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct ResourcesOutput {
    cpus: u32,
    memory_mb: u64,
    gpus: u32,
}

#[derive(Serialize)]
struct JobOutput {
    job_id: String,
    name: String,
    owner: String,
    command: String,
    state: String,
    resources: ResourcesOutput,
    priority: u32,
    time_limit_secs: u64,
    node_id: String,
    submitted_at_ms: i64,
    started_at_ms: Option<i64>,
    ended_at_ms: Option<i64>,
    exit_code: Option<i32>,
    reason: String,
    launch_attempts: u32,
}

#[derive(Serialize)]
struct JobListOutput {
    jobs: Vec<JobOutput>,
    total_count: u32,
    has_more: bool,
}

#[derive(Serialize)]
struct NodeOutput {
    node_id: String,
    state: String,
    capacity: ResourcesOutput,
    free: ResourcesOutput,
    address: String,
    last_heartbeat_ms: Option<i64>,
    drained: bool,
    reason: String,
}

#[derive(Serialize)]
struct RecordOutput {
    job: JobOutput,
    elapsed_secs: u64,
    cpu_seconds: u64,
    gpu_seconds: u64,
    recorded_at_ms: i64,
}

// =============================================================================
// Helper Functions
// =============================================================================

type Client = WorkloadServiceClient<InterceptedService<Channel, CredentialInjector>>;

fn state_name(state: i32) -> String {
    job_state_from_proto(state)
        .map(|s| s.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn resources_output(resources: Option<Resources>) -> ResourcesOutput {
    let r: ResourceVector = resources.map(Into::into).unwrap_or_default();
    ResourcesOutput {
        cpus: r.cpus,
        memory_mb: r.memory_mb,
        gpus: r.gpus,
    }
}

fn job_output(job: JobInfo) -> JobOutput {
    JobOutput {
        job_id: job.job_id,
        name: job.name,
        owner: job.owner,
        command: job.command,
        state: state_name(job.state),
        resources: resources_output(job.resources),
        priority: job.priority,
        time_limit_secs: job.time_limit_secs,
        node_id: job.node_id,
        submitted_at_ms: job.submitted_at_ms,
        started_at_ms: job.started_at_ms,
        ended_at_ms: job.ended_at_ms,
        exit_code: job.exit_code,
        reason: job.reason,
        launch_attempts: job.launch_attempts,
    }
}

fn node_output(node: NodeInfo) -> NodeOutput {
    NodeOutput {
        node_id: node.node_id,
        state: node_state_from_proto(node.state).to_string(),
        capacity: resources_output(node.capacity),
        free: resources_output(node.free),
        address: node.address,
        last_heartbeat_ms: node.last_heartbeat_ms,
        drained: node.drained,
        reason: node.reason,
    }
}

fn record_output(record: AccountingRecord) -> RecordOutput {
    RecordOutput {
        job: job_output(record.job.unwrap_or_default()),
        elapsed_secs: record.elapsed_secs,
        cpu_seconds: record.cpu_seconds,
        gpu_seconds: record.gpu_seconds,
        recorded_at_ms: record.recorded_at_ms,
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        let cut: String = text.chars().take(max.saturating_sub(3)).collect();
        format!("{cut}...")
    } else {
        text.to_string()
    }
}

fn or_dash(text: &str) -> &str {
    if text.is_empty() {
        "-"
    } else {
        text
    }
}

async fn create_client(args: &ClientArgs) -> Result<Client, Box<dyn std::error::Error>> {
    let channel = Channel::from_shared(args.addr.clone())?.connect().await?;
    let credentials = CredentialInjector::with_token(args.user.clone(), args.token.clone());
    Ok(WorkloadServiceClient::with_interceptor(channel, credentials))
}

async fn load_authority(
    key_file: &Path,
    admins: impl IntoIterator<Item = String>,
) -> Result<Arc<TokenAuthority>, Box<dyn std::error::Error>> {
    let key = SigningKey::load(key_file).await?;
    Ok(Arc::new(TokenAuthority::new(key).with_admins(admins)))
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// =============================================================================
// Daemons
// =============================================================================

async fn run_controller(args: ControllerArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let mut config = match &args.config {
        Some(path) => ControllerConfig::from_toml_file(path)?,
        None => ControllerConfig::default(),
    };
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    if let Some(gateway) = args.gateway {
        config = config.with_gateway(gateway);
    }
    if let Some(key_file) = args.key_file {
        config.auth.key_path = Some(key_file);
    }
    if let Some(accounting) = args.accounting {
        config.accounting.path = Some(accounting);
    }
    if !args.admins.is_empty() {
        config.auth.admin_users = args.admins.into_iter().collect();
    }
    if args.no_backfill {
        config = config.with_backfill(false);
    }

    let key_path = config
        .auth
        .key_path
        .clone()
        .ok_or("a signing key is required (--key-file or auth.key_path)")?;
    let authority = load_authority(&key_path, config.auth.admin_users.iter().cloned()).await?;

    tracing::info!(
        listen_addr = %config.listen_addr,
        gateway_addr = ?config.gateway_addr,
        backfill = config.scheduler.backfill,
        node_failure_policy = ?config.dispatch.node_failure_policy,
        "Starting wlm-lite controller"
    );

    let shutdown = install_shutdown_handler();
    ControllerDaemon::new(config, authority).run(shutdown).await?;
    Ok(())
}

async fn run_agent_daemon(args: AgentArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let capacity = ResourceVector::new(args.cpus, args.memory_mb, args.gpus);
    let mut config = AgentConfig::new(args.node_id, args.listen, capacity);
    config.advertise_addr = args.advertise;
    config.controller_addr = args.controller;
    config.heartbeat_interval_ms = args.heartbeat_ms;

    let authority = load_authority(&args.key_file, std::iter::empty()).await?;

    tracing::info!(
        node_id = %config.node_id,
        listen_addr = %config.listen_addr,
        controller = %config.controller_addr,
        capacity = %config.capacity,
        "Starting wlm-lite agent"
    );

    let shutdown = install_shutdown_handler();
    run_agent(config, authority, shutdown).await?;
    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

#[allow(clippy::too_many_arguments)]
async fn handle_job_submit(
    client: &mut Client,
    command: String,
    name: String,
    resources: ResourceVector,
    priority: u32,
    time_limit: Option<u64>,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = client
        .submit_job(SubmitJobRequest {
            name,
            command,
            resources: Some(resources.into()),
            priority,
            time_limit_secs: time_limit.unwrap_or(0),
        })
        .await?
        .into_inner();

    match output_format {
        OutputFormat::Json => {
            #[derive(Serialize)]
            struct SubmitOutput {
                job_id: String,
                submitted_at_ms: i64,
            }
            print_json(&SubmitOutput {
                job_id: response.job_id,
                submitted_at_ms: response.submitted_at_ms,
            })?;
        }
        OutputFormat::Table => {
            println!("Job submitted successfully!");
            println!("Job ID: {}", response.job_id);
        }
    }
    Ok(())
}

async fn handle_job_status(
    client: &mut Client,
    job_id: String,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let job = job_output(client.get_job(GetJobRequest { job_id }).await?.into_inner());

    match output_format {
        OutputFormat::Json => print_json(&job)?,
        OutputFormat::Table => {
            println!("Job ID:          {}", job.job_id);
            if !job.name.is_empty() {
                println!("Name:            {}", job.name);
            }
            println!("Owner:           {}", job.owner);
            println!("State:           {}", job.state);
            println!(
                "Resources:       {} cpu, {} MiB, {} gpu",
                job.resources.cpus, job.resources.memory_mb, job.resources.gpus
            );
            println!("Priority:        {}", job.priority);
            println!("Time Limit:      {}s", job.time_limit_secs);
            println!("Node:            {}", or_dash(&job.node_id));
            println!("Launch Attempts: {}", job.launch_attempts);
            if let Some(exit_code) = job.exit_code {
                println!("Exit Code:       {}", exit_code);
            }
            if !job.reason.is_empty() {
                println!("Reason:          {}", job.reason);
            }
            println!("Command:         {}", job.command);
        }
    }
    Ok(())
}

async fn handle_job_list(
    client: &mut Client,
    state: Option<JobState>,
    owner: Option<String>,
    page_size: u32,
    all: bool,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut jobs: Vec<JobOutput> = Vec::new();
    let mut page_token = String::new();
    let (total_count, has_more) = loop {
        let response = client
            .list_jobs(ListJobsRequest {
                page_size,
                page_token: page_token.clone(),
                state_filter: state.map(|s| job_state_to_proto(s) as i32).unwrap_or(0),
                owner_filter: owner.clone().unwrap_or_default(),
            })
            .await?
            .into_inner();

        jobs.extend(response.jobs.into_iter().map(job_output));

        if response.next_page_token.is_empty() || !all {
            break (response.total_count, !response.next_page_token.is_empty());
        }
        page_token = response.next_page_token;
    };

    match output_format {
        OutputFormat::Json => print_json(&JobListOutput {
            jobs,
            total_count,
            has_more,
        })?,
        OutputFormat::Table => {
            if jobs.is_empty() {
                println!("No jobs found.");
            } else {
                println!(
                    "{:<38} {:<10} {:<10} {:<10} {:<14} COMMAND",
                    "JOB ID", "STATE", "OWNER", "NODE", "RESOURCES"
                );
                println!("{}", "-".repeat(100));
                for job in &jobs {
                    let resources = format!(
                        "{}c/{}M/{}g",
                        job.resources.cpus, job.resources.memory_mb, job.resources.gpus
                    );
                    println!(
                        "{:<38} {:<10} {:<10} {:<10} {:<14} {}",
                        job.job_id,
                        job.state,
                        truncate(&job.owner, 10),
                        truncate(or_dash(&job.node_id), 10),
                        resources,
                        truncate(&job.command, 20)
                    );
                }
                println!();
                println!("Showing {} of {} jobs", jobs.len(), total_count);
                if has_more {
                    println!("(Use --all to fetch all pages)");
                }
            }
        }
    }
    Ok(())
}

async fn handle_job_cancel(
    client: &mut Client,
    job_id: String,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = client
        .cancel_job(CancelJobRequest { job_id })
        .await?
        .into_inner();
    let state = state_name(response.state);

    match output_format {
        OutputFormat::Json => {
            #[derive(Serialize)]
            struct CancelOutput {
                job_id: String,
                state: String,
            }
            print_json(&CancelOutput {
                job_id: response.job_id,
                state,
            })?;
        }
        OutputFormat::Table => println!("Job {} is {}", response.job_id, state),
    }
    Ok(())
}

fn print_nodes(nodes: Vec<NodeInfo>, output_format: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    let nodes: Vec<NodeOutput> = nodes.into_iter().map(node_output).collect();
    match output_format {
        OutputFormat::Json => print_json(&nodes)?,
        OutputFormat::Table => {
            if nodes.is_empty() {
                println!("No nodes registered.");
                return Ok(());
            }
            println!(
                "{:<16} {:<10} {:<18} {:<18} {:<22} REASON",
                "NODE", "STATE", "CAPACITY", "FREE", "ADDRESS"
            );
            println!("{}", "-".repeat(100));
            for node in &nodes {
                let fmt = |r: &ResourcesOutput| format!("{}c/{}M/{}g", r.cpus, r.memory_mb, r.gpus);
                let state = if node.drained && node.state != "draining" {
                    format!("{}*", node.state)
                } else {
                    node.state.clone()
                };
                println!(
                    "{:<16} {:<10} {:<18} {:<18} {:<22} {}",
                    truncate(&node.node_id, 16),
                    state,
                    fmt(&node.capacity),
                    fmt(&node.free),
                    truncate(or_dash(&node.address), 22),
                    or_dash(&node.reason)
                );
            }
        }
    }
    Ok(())
}

async fn handle_node_command(
    client: &mut Client,
    command: NodeCommands,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let nodes = match command {
        NodeCommands::List => {
            client
                .list_nodes(ListNodesRequest {})
                .await?
                .into_inner()
                .nodes
        }
        NodeCommands::Drain { node_id } => {
            vec![client.drain_node(NodeAdminRequest { node_id }).await?.into_inner()]
        }
        NodeCommands::Resume { node_id } => {
            vec![client.resume_node(NodeAdminRequest { node_id }).await?.into_inner()]
        }
        NodeCommands::Remove { node_id } => {
            vec![client.remove_node(NodeAdminRequest { node_id }).await?.into_inner()]
        }
    };
    print_nodes(nodes, output_format)
}

async fn handle_history(
    client: &mut Client,
    owner: Option<String>,
    state: Option<JobState>,
    limit: Option<u32>,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let records: Vec<RecordOutput> = client
        .list_accounting(ListAccountingRequest {
            owner_filter: owner.unwrap_or_default(),
            state_filter: state.map(|s| job_state_to_proto(s) as i32).unwrap_or(0),
            limit: limit.unwrap_or(0),
        })
        .await?
        .into_inner()
        .records
        .into_iter()
        .map(record_output)
        .collect();

    match output_format {
        OutputFormat::Json => print_json(&records)?,
        OutputFormat::Table => {
            if records.is_empty() {
                println!("No accounting records.");
                return Ok(());
            }
            println!(
                "{:<38} {:<10} {:<10} {:<10} {:>10} {:>10} EXIT",
                "JOB ID", "OWNER", "STATE", "NODE", "ELAPSED", "CPU-SEC"
            );
            println!("{}", "-".repeat(100));
            for record in &records {
                let exit = record
                    .job
                    .exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<38} {:<10} {:<10} {:<10} {:>10} {:>10} {}",
                    record.job.job_id,
                    truncate(&record.job.owner, 10),
                    record.job.state,
                    truncate(or_dash(&record.job.node_id), 10),
                    record.elapsed_secs,
                    record.cpu_seconds,
                    exit
                );
            }
        }
    }
    Ok(())
}

async fn handle_token_issue(
    subject: String,
    key_file: PathBuf,
    lifetime_secs: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let authority = load_authority(&key_file, std::iter::empty()).await?;
    let token = authority.issue(
        &subject,
        Duration::from_secs(lifetime_secs),
        chrono::Utc::now(),
    )?;
    println!("{token}");
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Controller(controller_args) => {
            run_controller(controller_args).await?;
        }
        Commands::Agent(agent_args) => {
            run_agent_daemon(agent_args).await?;
        }
        Commands::Job { client, command } => {
            let mut grpc_client = create_client(&client).await?;

            match command {
                JobCommands::Submit {
                    command,
                    name,
                    cpus,
                    memory_mb,
                    gpus,
                    priority,
                    time_limit,
                } => {
                    let resources = ResourceVector::new(cpus, memory_mb, gpus);
                    handle_job_submit(
                        &mut grpc_client,
                        command,
                        name,
                        resources,
                        priority,
                        time_limit,
                        &client.output,
                    )
                    .await?;
                }
                JobCommands::Status { job_id } => {
                    handle_job_status(&mut grpc_client, job_id, &client.output).await?;
                }
                JobCommands::List {
                    state,
                    owner,
                    page_size,
                    all,
                } => {
                    handle_job_list(&mut grpc_client, state, owner, page_size, all, &client.output)
                        .await?;
                }
                JobCommands::Cancel { job_id } => {
                    handle_job_cancel(&mut grpc_client, job_id, &client.output).await?;
                }
            }
        }
        Commands::Node { client, command } => {
            let mut grpc_client = create_client(&client).await?;
            handle_node_command(&mut grpc_client, command, &client.output).await?;
        }
        Commands::History {
            client,
            owner,
            state,
            limit,
        } => {
            let mut grpc_client = create_client(&client).await?;
            handle_history(&mut grpc_client, owner, state, limit, &client.output).await?;
        }
        Commands::Token { command } => match command {
            TokenCommands::Issue {
                subject,
                key_file,
                lifetime_secs,
            } => {
                handle_token_issue(subject, key_file, lifetime_secs).await?;
            }
        },
    }

    Ok(())
}
