//! rdproxy - reverse tunnel relay
//!
//! Runs either side of the tunnel: the gateway that accepts agent sessions
//! and relays its proxy port through them, or an agent behind NAT.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rdproxy_agent::{Agent, AgentArgs, AgentConfig};
use rdproxy_gateway::{Gateway, GatewayArgs, GatewayConfig};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const VERSION: &str = concat!(
    env!("GIT_TAG"),
    " (",
    env!("GIT_HASH"),
    ", built ",
    env!("BUILD_TIME"),
    ")"
);

/// rdproxy - relay TCP connections through agents behind NAT
#[derive(Parser, Debug)]
#[command(name = "rdproxy")]
#[command(version = VERSION)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Accept agent sessions and relay the proxy port through them
    #[command(long_about = r#"
Accept agent sessions over QUIC and relay every TCP connection arriving on
the proxy port through one randomly chosen agent to PEER_HOST:PEER_PORT on
the agent's side.

EXAMPLES:
  rdproxy gateway --secret $SECRET --tls-name gateway.example.com \
    --https-port 4433 --proxy-port 8080 --peer-port 6666
    "#)]
    Gateway(GatewayArgs),

    /// Register with a gateway and serve its virtual connections
    #[command(long_about = r#"
Keep a session open to the gateway, reconnecting with exponential backoff,
and dial the target named by the gateway for each virtual connection. With
BACKEND_ADDR set, also relay FAKE_IMPERATIVE_API_ADDR to that backend.

EXAMPLES:
  rdproxy agent --connect-url quic://gateway.example.com:4433/connect \
    --connect-secret $SECRET --backend-addr 127.0.0.1:8000
    "#)]
    Agent(AgentArgs),
}

fn setup_logging(debug: bool) {
    let log_level = if debug { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

/// Cancel `cancel` on Ctrl+C
fn cancel_on_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, shutting down..."),
            Err(e) => warn!("Failed to listen for Ctrl+C: {}", e),
        }
        cancel.cancel();
    });
}

async fn run_gateway(args: GatewayArgs, cancel: CancellationToken) -> Result<()> {
    let config = GatewayConfig::try_from(args).context("Invalid gateway configuration")?;

    info!("Session endpoint: {} (QUIC)", config.session_addr);
    info!("Proxy listener: {}", config.proxy_addr);
    info!("Peer target: {}", config.peer_target);

    let gateway = Gateway::bind(&config)
        .await
        .context("Failed to start gateway")?;
    gateway.run(cancel).await;
    Ok(())
}

async fn run_agent(args: AgentArgs, cancel: CancellationToken) -> Result<()> {
    let config = AgentConfig::try_from(args).context("Invalid agent configuration")?;

    info!("Agent: {}", config.name);
    info!("Gateway: {}{}", config.gateway, config.registration_path);

    let agent = Agent::new(config).context("Failed to create agent")?;
    agent.run(cancel).await.context("Agent stopped")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let debug = match &cli.command {
        Commands::Gateway(args) => cli.verbose || args.debug,
        Commands::Agent(_) => cli.verbose,
    };
    setup_logging(debug);

    info!("rdproxy {}", VERSION);

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    match cli.command {
        Commands::Gateway(args) => run_gateway(args, cancel).await,
        Commands::Agent(args) => run_agent(args, cancel).await,
    }
}
