use clap::{Parser, ValueEnum};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use miner_lite::api::{
    AddressResponse, ErrorResponse, KillResponse, ManifestResponse, StartExecutorRequest,
    WaitRequest,
};
use miner_lite::config::{BackendKind, DockerConfig, LocalBackendConfig, NodeConfig, PortRange};
use miner_lite::executor::{ExecutorClass, ExecutorInfo, ExecutorState, WaitOutcome};
use miner_lite::node::Node;
use miner_lite::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "miner-lite")]
#[command(version)]
#[command(about = "Compute-provider node that provisions and supervises executors")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a node
    Serve(ServeArgs),

    /// Show remaining capacity per executor class
    Manifest {
        #[command(flatten)]
        client: ClientArgs,
    },

    /// Executor management commands
    Executor {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: ExecutorCommands,
    },
}

// =============================================================================
// Serve Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServeArgs {
    /// Node name, used to label the executors this node owns
    #[arg(long, default_value = "miner-lite")]
    name: String,

    /// Executor backend
    #[arg(long, value_enum, default_value = "local")]
    backend: BackendKind,

    /// Inclusive port range handed out to executors (e.g. "6000-6999")
    #[arg(long, default_value = "6000-6999", value_parser = parse_port_range)]
    port_range: PortRange,

    /// Skip the OS bind probe when leasing ports
    #[arg(long)]
    no_probe: bool,

    /// Declared capacity as CLASS=COUNT; repeat for several classes
    #[arg(long = "class", value_parser = parse_class_capacity)]
    classes: Vec<(ExecutorClass, u32)>,

    /// Executor class used when a start request does not name one
    #[arg(long)]
    default_class: Option<String>,

    /// Address executors call back to
    #[arg(long, default_value = "ws://127.0.0.1:8000")]
    coordinator: String,

    /// IP peers use to reach executors on this host
    #[arg(long, default_value = "127.0.0.1")]
    public_ip: IpAddr,

    /// Grace period between SIGTERM and SIGKILL
    #[arg(long, default_value = "5000")]
    kill_grace_ms: u64,

    /// Interval of the reaper sweep
    #[arg(long, default_value = "1000")]
    reap_interval_ms: u64,

    /// Port for the control API (disabled if omitted)
    #[arg(long)]
    api_port: Option<u16>,

    // === Local backend ===
    /// Executor program to spawn
    #[arg(long, default_value = "executor")]
    program: String,

    /// Argument passed to the executor program; repeatable
    #[arg(long = "arg", allow_hyphen_values = true)]
    program_args: Vec<String>,

    /// Working directory for executor processes
    #[arg(long)]
    workdir: Option<PathBuf>,

    /// Extra environment as KEY=VALUE; repeatable
    #[arg(long = "env", value_parser = parse_env_pair)]
    env: Vec<(String, String)>,

    /// Directory recording running executor processes across restarts
    #[arg(long)]
    state_dir: Option<PathBuf>,

    // === Docker backend ===
    /// Executor image
    #[arg(long, default_value = "compute-executor:latest")]
    image: String,

    /// docker binary
    #[arg(long, default_value = "docker")]
    docker_bin: String,

    /// Memory limit per container (e.g. "8g")
    #[arg(long)]
    memory: Option<String>,

    /// CPU limit per container (e.g. "4")
    #[arg(long)]
    cpus: Option<String>,

    /// GPUs per container (e.g. "all", "device=0")
    #[arg(long)]
    gpus: Option<String>,

    /// Docker network to attach containers to
    #[arg(long)]
    network: Option<String>,
}

// =============================================================================
// Client Arguments (shared by manifest and executor commands)
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Control API address
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:8090")]
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
// Executor Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum ExecutorCommands {
    /// Start an executor
    Start {
        /// Executor class (node default if omitted)
        #[arg(long)]
        class: Option<String>,

        /// Token handed to the executor (generated if omitted)
        #[arg(long)]
        token: Option<String>,

        /// Executor lifetime in seconds
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// List live executors
    List,
    /// Kill an executor
    Kill {
        /// The executor ID (UUID)
        executor_id: String,
    },
    /// Wait for an executor to exit
    Wait {
        /// The executor ID (UUID)
        executor_id: String,

        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Resolve the public address of an executor
    Address {
        /// The executor ID (UUID)
        executor_id: String,

        /// Keep polling for up to this many milliseconds
        #[arg(long)]
        wait_ms: Option<u64>,
    },
}

// =============================================================================
// Helper Functions
// =============================================================================

fn parse_port_range(s: &str) -> Result<PortRange, String> {
    let (start, end) = s
        .split_once('-')
        .ok_or_else(|| format!("expected START-END, got {:?}", s))?;
    let start: u16 = start.trim().parse().map_err(|e| format!("{}", e))?;
    let end: u16 = end.trim().parse().map_err(|e| format!("{}", e))?;
    Ok(PortRange::new(start, end))
}

fn parse_class_capacity(s: &str) -> Result<(ExecutorClass, u32), String> {
    let (class, count) = s
        .split_once('=')
        .ok_or_else(|| format!("expected CLASS=COUNT, got {:?}", s))?;
    let count: u32 = count.trim().parse().map_err(|e| format!("{}", e))?;
    Ok((ExecutorClass::new(class.trim()), count))
}

fn parse_env_pair(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got {:?}", s))?;
    Ok((key.to_string(), value.to_string()))
}

fn node_config(args: ServeArgs) -> Result<NodeConfig, Box<dyn std::error::Error>> {
    let mut config = NodeConfig::new(args.name, args.backend);
    config.port_range = args.port_range;
    config.probe_ports = !args.no_probe;
    config.coordinator_addr = args.coordinator;
    config.public_ip = args.public_ip;
    config.kill_grace_ms = args.kill_grace_ms;
    config.reap_interval_ms = args.reap_interval_ms;

    if !args.classes.is_empty() {
        let classes: BTreeMap<ExecutorClass, u32> = args.classes.into_iter().collect();
        if args.default_class.is_none() && !classes.contains_key(&config.default_executor_class) {
            if let Some(first) = classes.keys().next() {
                config.default_executor_class = first.clone();
            }
        }
        config.executor_classes = classes;
    }
    if let Some(class) = args.default_class {
        config.default_executor_class = ExecutorClass::new(class);
    }

    config.api_addr = args
        .api_port
        .map(|p| SocketAddr::from(([0, 0, 0, 0], p)));

    config.local = LocalBackendConfig {
        program: args.program,
        args: if args.program_args.is_empty() {
            LocalBackendConfig::default().args
        } else {
            args.program_args
        },
        working_dir: args.workdir,
        env: args.env,
        state_dir: args.state_dir,
    };
    config.docker = DockerConfig {
        docker_bin: args.docker_bin,
        image: args.image,
        memory_limit: args.memory,
        cpu_limit: args.cpus,
        gpus: args.gpus,
        network: args.network,
    };

    config.validate()?;
    Ok(config)
}

/// Send a request and decode the body, turning API errors into messages.
async fn send_json<T: DeserializeOwned>(
    request: reqwest::RequestBuilder,
) -> Result<T, Box<dyn std::error::Error>> {
    let response = request.send().await?;
    let status = response.status();
    if status.is_success() {
        return Ok(response.json::<T>().await?);
    }

    let message = match response.json::<ErrorResponse>().await {
        Ok(body) => format!("{} ({})", body.message, body.error),
        Err(_) => format!("request failed with status {}", status),
    };
    Err(message.into())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn state_label(state: &ExecutorState) -> String {
    match state {
        ExecutorState::Starting => "STARTING".to_string(),
        ExecutorState::Running => "RUNNING".to_string(),
        ExecutorState::Terminating => "TERMINATING".to_string(),
        ExecutorState::Exited { .. } => "EXITED".to_string(),
        ExecutorState::Failed { .. } => "FAILED".to_string(),
    }
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = node_config(args)?;

    if config.backend == BackendKind::Local {
        tracing::warn!(
            "Local backend runs executors without isolation. Use --backend docker in production."
        );
    }

    tracing::info!(
        node = %config.node_name,
        backend = %config.backend,
        port_range = %config.port_range,
        api_addr = ?config.api_addr,
        classes = ?config.executor_classes,
        "Starting miner-lite node"
    );

    let shutdown = install_shutdown_handler()?;
    let node = Node::new(config)?;
    node.run(shutdown).await?;

    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn handle_manifest(
    http: &reqwest::Client,
    args: &ClientArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let response: ManifestResponse =
        send_json(http.get(format!("{}/api/manifest", args.addr))).await?;

    match args.output {
        OutputFormat::Json => print_json(&response)?,
        OutputFormat::Table => {
            println!("Node:    {} ({} backend)", response.node, response.backend);
            println!("Active:  {}", response.active);
            println!();
            println!("{:<32} AVAILABLE", "EXECUTOR CLASS");
            println!("{}", "-".repeat(42));
            for (class, count) in response.manifest.iter() {
                println!("{:<32} {}", class, count);
            }
        }
    }
    Ok(())
}

async fn handle_executor_start(
    http: &reqwest::Client,
    args: &ClientArgs,
    request: StartExecutorRequest,
) -> Result<(), Box<dyn std::error::Error>> {
    let info: ExecutorInfo = send_json(
        http.post(format!("{}/api/executors", args.addr))
            .json(&request),
    )
    .await?;

    match args.output {
        OutputFormat::Json => print_json(&info)?,
        OutputFormat::Table => {
            println!("Executor started!");
            println!("Executor ID: {}", info.id);
            println!("Class:       {}", info.executor_class);
            println!("Port:        {}", info.port);
            println!("Runtime:     {}", info.runtime);
        }
    }
    Ok(())
}

async fn handle_executor_list(
    http: &reqwest::Client,
    args: &ClientArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let executors: Vec<ExecutorInfo> =
        send_json(http.get(format!("{}/api/executors", args.addr))).await?;

    match args.output {
        OutputFormat::Json => print_json(&executors)?,
        OutputFormat::Table => {
            if executors.is_empty() {
                println!("No executors running.");
                return Ok(());
            }
            println!(
                "{:<38} {:<12} {:<6} {:<24} STARTED",
                "EXECUTOR ID", "STATE", "PORT", "CLASS"
            );
            println!("{}", "-".repeat(100));
            for info in &executors {
                println!(
                    "{:<38} {:<12} {:<6} {:<24} {}",
                    info.id,
                    state_label(&info.state),
                    info.port,
                    info.executor_class,
                    info.started_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
    }
    Ok(())
}

async fn handle_executor_kill(
    http: &reqwest::Client,
    args: &ClientArgs,
    executor_id: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let response: KillResponse =
        send_json(http.delete(format!("{}/api/executors/{}", args.addr, executor_id))).await?;

    match args.output {
        OutputFormat::Json => print_json(&response)?,
        OutputFormat::Table => match response.outcome {
            Some(outcome) => println!("Executor {}: {}", response.executor_id, outcome),
            None => println!("Executor {}: kill requested", response.executor_id),
        },
    }
    Ok(())
}

async fn handle_executor_wait(
    http: &reqwest::Client,
    args: &ClientArgs,
    executor_id: &str,
    timeout_secs: Option<u64>,
) -> Result<(), Box<dyn std::error::Error>> {
    let outcome: WaitOutcome = send_json(
        http.post(format!("{}/api/executors/{}/wait", args.addr, executor_id))
            .json(&WaitRequest { timeout_secs }),
    )
    .await?;

    match args.output {
        OutputFormat::Json => print_json(&outcome)?,
        OutputFormat::Table => match outcome {
            WaitOutcome::Exited { outcome } => println!("Executor {}: {}", executor_id, outcome),
            WaitOutcome::StillRunning => println!("Executor {}: still running", executor_id),
        },
    }
    Ok(())
}

async fn handle_executor_address(
    http: &reqwest::Client,
    args: &ClientArgs,
    executor_id: &str,
    wait_ms: Option<u64>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut request = http.get(format!(
        "{}/api/executors/{}/address",
        args.addr, executor_id
    ));
    if let Some(ms) = wait_ms {
        request = request.query(&[("wait_ms", ms)]);
    }
    let response: AddressResponse = send_json(request).await?;

    match args.output {
        OutputFormat::Json => print_json(&response)?,
        OutputFormat::Table => println!("{}", response.address),
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
        Commands::Serve(serve_args) => {
            run_server(serve_args).await?;
        }
        Commands::Manifest { client } => {
            let http = reqwest::Client::new();
            handle_manifest(&http, &client).await?;
        }
        Commands::Executor { client, command } => {
            let http = reqwest::Client::new();

            match command {
                ExecutorCommands::Start {
                    class,
                    token,
                    timeout_secs,
                } => {
                    let request = StartExecutorRequest {
                        token,
                        executor_class: class.map(ExecutorClass::new),
                        timeout_secs,
                    };
                    handle_executor_start(&http, &client, request).await?;
                }
                ExecutorCommands::List => {
                    handle_executor_list(&http, &client).await?;
                }
                ExecutorCommands::Kill { executor_id } => {
                    handle_executor_kill(&http, &client, &executor_id).await?;
                }
                ExecutorCommands::Wait {
                    executor_id,
                    timeout_secs,
                } => {
                    handle_executor_wait(&http, &client, &executor_id, timeout_secs).await?;
                }
                ExecutorCommands::Address {
                    executor_id,
                    wait_ms,
                } => {
                    handle_executor_address(&http, &client, &executor_id, wait_ms).await?;
                }
            }
        }
    }

    Ok(())
}
