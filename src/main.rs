//! Tunnelbay CLI
//!
//! `tunnelbay server` runs the broker agents register with.
//! `tunnelbay agent` runs on a device and serves the tunnels the broker asks for.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::net::IpAddr;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use tunnelbay_agent::{AgentConfig, AgentRuntime};
use tunnelbay_control::{AgentRegistry, AgentStore, BrokerConfig, JsonFileStore, MemoryStore};

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("GIT_HASH"),
    ", built ",
    env!("BUILD_TIME"),
    ")"
);

/// Tunnelbay - reach devices behind NAT through a public broker
#[derive(Parser, Debug)]
#[command(name = "tunnelbay")]
#[command(version = VERSION)]
struct Cli {
    /// Log level (trace, debug, info, warn, error). RUST_LOG takes precedence.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the broker
    Server(ServerArgs),
    /// Run an agent
    Agent(AgentArgs),
}

#[derive(clap::Args, Debug)]
struct ServerArgs {
    /// Address to bind the command and tunnel listeners to
    #[arg(long, env = "TUNNELBAY_BIND", default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Port agents connect to
    #[arg(long, env = "TUNNELBAY_PORT", default_value_t = 5555)]
    port: u16,

    /// Ports handed out to tunnels (e.g. 3000-3999)
    #[arg(long, value_parser = parse_port_range, default_value = "3000-3999")]
    port_range: RangeInclusive<u16>,

    /// Seconds an agent has to send its handshake
    #[arg(long, default_value_t = 5)]
    handshake_timeout: u64,

    /// Seconds an agent has to connect back for a new tunnel
    #[arg(long, default_value_t = 15)]
    agent_timeout: u64,

    /// Seconds the first customer has to connect to a new tunnel
    #[arg(long, default_value_t = 60)]
    customer_timeout: u64,

    /// Seconds an agent has to connect back for each further customer
    #[arg(long, default_value_t = 5)]
    extra_connection_timeout: u64,

    /// Seconds of command connection silence before an agent is offline
    #[arg(long, default_value_t = 30)]
    agent_idle_timeout: u64,

    /// Seconds without traffic before a tunnel closes
    #[arg(long, default_value_t = 60)]
    tunnel_idle_timeout: u64,

    /// Persist known agents to this JSON file (in-memory if omitted)
    #[arg(long, env = "TUNNELBAY_STORE")]
    store: Option<PathBuf>,

    /// Allow tunnels to request SSL from agents
    #[arg(long)]
    tls: bool,
}

#[derive(clap::Args, Debug)]
struct AgentArgs {
    /// YAML config file; flags given on the command line override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Broker address (host:port)
    #[arg(long, env = "TUNNELBAY_BROKER")]
    broker: Option<String>,

    /// Hardware id (derived from the host name if unset)
    #[arg(long, env = "TUNNELBAY_HW_ID")]
    hw_id: Option<u64>,

    /// Agent name (defaults to the host name)
    #[arg(long, env = "TUNNELBAY_NAME")]
    name: Option<String>,

    /// Seconds between heartbeats
    #[arg(long)]
    heartbeat: Option<u64>,

    /// Seconds without traffic before a local tunnel closes
    #[arg(long)]
    tunnel_idle_timeout: Option<u64>,
}

fn setup_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

fn parse_port_range(s: &str) -> Result<RangeInclusive<u16>, String> {
    let (start, end) = s
        .split_once('-')
        .ok_or_else(|| format!("expected START-END, got '{s}'"))?;
    let start: u16 = start
        .trim()
        .parse()
        .map_err(|e| format!("invalid start port: {e}"))?;
    let end: u16 = end
        .trim()
        .parse()
        .map_err(|e| format!("invalid end port: {e}"))?;
    if start == 0 || start > end {
        return Err(format!("invalid port range {start}-{end}"));
    }
    Ok(start..=end)
}

fn parse_broker(s: &str) -> Result<(String, u16)> {
    let (host, port) = s
        .rsplit_once(':')
        .with_context(|| format!("broker address '{s}' must be host:port"))?;
    if host.is_empty() {
        bail!("broker address '{s}' has no host");
    }
    let port = port
        .parse()
        .with_context(|| format!("invalid broker port in '{s}'"))?;
    Ok((host.to_string(), port))
}

fn broker_config(args: &ServerArgs) -> BrokerConfig {
    let defaults = BrokerConfig::default();
    BrokerConfig {
        bind_host: args.bind,
        listen_port: args.port,
        port_range: args.port_range.clone(),
        handshake_timeout: Duration::from_secs(args.handshake_timeout),
        agent_accept_timeout: Duration::from_secs(args.agent_timeout),
        customer_accept_timeout: Duration::from_secs(args.customer_timeout),
        extra_connection_timeout: Duration::from_secs(args.extra_connection_timeout),
        agent_idle_timeout: Duration::from_secs(args.agent_idle_timeout),
        relay: tunnelbay_control::RelayConfig {
            idle_timeout: Duration::from_secs(args.tunnel_idle_timeout),
            ..defaults.relay
        },
        tls_enabled: args.tls,
        ..defaults
    }
}

fn load_agent_file(path: &Path) -> Result<AgentConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file {}", path.display()))
}

fn agent_config(args: &AgentArgs) -> Result<AgentConfig> {
    let mut config = match &args.config {
        Some(path) => load_agent_file(path)?,
        None => AgentConfig::default(),
    };

    if let Some(broker) = &args.broker {
        let (host, port) = parse_broker(broker)?;
        config.broker_host = host;
        config.broker_port = port;
    }
    if let Some(hw_id) = args.hw_id {
        config.hw_id = Some(hw_id);
    }
    if let Some(name) = &args.name {
        config.name = Some(name.clone());
    }
    if let Some(secs) = args.heartbeat {
        config.heartbeat_interval = Duration::from_secs(secs);
    }
    if let Some(secs) = args.tunnel_idle_timeout {
        config.tunnel_idle_timeout = Duration::from_secs(secs);
    }

    if config.heartbeat_interval.is_zero() {
        bail!("heartbeat interval must be at least one second");
    }
    Ok(config)
}

async fn run_server(args: ServerArgs) -> Result<()> {
    let config = broker_config(&args);

    let store: Arc<dyn AgentStore> = match &args.store {
        Some(path) => Arc::new(
            JsonFileStore::open(path)
                .await
                .with_context(|| format!("Failed to open agent store {}", path.display()))?,
        ),
        None => Arc::new(MemoryStore::new()),
    };

    let registry = AgentRegistry::load(config, store)
        .await
        .context("Failed to load known agents")?;
    let listener = registry.bind().await.with_context(|| {
        format!(
            "Failed to bind {}:{}",
            registry.config().bind_host,
            registry.config().listen_port
        )
    })?;

    tokio::select! {
        _ = registry.serve(listener) => {}
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl+C")?;
            info!("Received Ctrl+C, shutting down...");
        }
    }

    registry.shutdown().await;
    info!("Broker stopped");
    Ok(())
}

async fn run_agent(args: AgentArgs) -> Result<()> {
    let config = agent_config(&args)?;
    let runtime = AgentRuntime::new(config).context("Invalid agent identity")?;

    let shutdown = CancellationToken::new();
    let agent = runtime.clone();
    let token = shutdown.clone();
    let task = tokio::spawn(async move { agent.run(token).await });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Received Ctrl+C, shutting down...");

    shutdown.cancel();
    task.await.context("Agent task failed")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli.log_level);

    match cli.command {
        Commands::Server(args) => run_server(args).await,
        Commands::Agent(args) => run_agent(args).await,
    }
}
