//! mcpfleet - inspect and exercise a configured fleet of MCP connections
//!
//! Results are printed to stdout as JSON, logs go to stderr and the log file.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand};
use mcpfleet_core::{FleetConfig, InstanceRole, TransportKind};
use mcpfleet_registry::{Fleet, TokioScheduler};
use serde_json::{json, Value};
use tracing::{debug, info};

const LOG_PREFIX: &str = "mcpfleet";

/// Inspect and exercise a configured fleet of MCP connections
#[derive(Parser, Debug)]
#[command(name = "mcpfleet", version, long_about = None)]
struct Cli {
    /// Fleet configuration file; an empty fleet is used when absent
    #[arg(short, long, env = "MCPFLEET_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Command {
    /// List every configured server and client
    List,
    /// Show the status of one instance
    Status { name: String },
    /// Connect, list tools, report status, then disconnect
    Connect {
        name: String,
        /// Overrides the configured target
        target: Option<String>,
    },
    /// Connect and send one ping
    Ping { name: String },
    /// Test a target without touching the configured fleet
    Test {
        target: String,
        /// stdio, http or socket; inferred from the target when omitted
        transport: Option<TransportKind>,
    },
}

fn get_logs_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("mcpfleet")
        .join("logs")
}

/// Console (stderr) plus daily-rolling file logging.
///
/// The returned guard flushes the file writer and must outlive `main`'s work.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_appender::rolling::{RollingFileAppender, Rotation};
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let logs_dir = get_logs_dir();
    if let Err(e) = std::fs::create_dir_all(&logs_dir) {
        eprintln!("Warning: Failed to create logs directory: {}", e);
    }

    // Creates files like: mcpfleet.2026-10-16.log
    let file_writer = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_PREFIX)
        .filename_suffix("log")
        .build(&logs_dir)
        .map_err(|e| eprintln!("Warning: File logging disabled: {}", e))
        .ok()
        .map(tracing_appender::non_blocking);
    let (file_layer, guard) = match file_writer {
        Some((writer, guard)) => (
            Some(
                fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_thread_ids(true)
                    .with_line_number(true)
                    .with_file(true)
                    .with_target(true),
            ),
            Some(guard),
        ),
        None => (None, None),
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,mcpfleet_core=debug,mcpfleet_mcp=debug,mcpfleet_registry=debug,mcpfleet=debug")
    });

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .compact()
        .with_thread_names(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    guard
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<FleetConfig> {
    match path {
        Some(path) => FleetConfig::load(&path)
            .with_context(|| format!("loading fleet config from {}", path.display())),
        None => {
            debug!("No config given, using an empty fleet");
            Ok(FleetConfig::default())
        }
    }
}

/// Clients shadow servers of the same name.
fn role_of(fleet: &Fleet, name: &str) -> InstanceRole {
    if !fleet.clients().exists(name) && fleet.servers().exists(name) {
        InstanceRole::Server
    } else {
        InstanceRole::Client
    }
}

async fn run(fleet: &Fleet, command: &Command) -> anyhow::Result<Value> {
    match command {
        Command::List => Ok(json!({
            "servers": fleet.servers().list(),
            "clients": fleet.clients().list(),
        })),
        Command::Status { name } => {
            let registry = fleet.registry(role_of(fleet, name));
            Ok(serde_json::to_value(registry.get_status(name)?)?)
        }
        Command::Connect { name, target } => {
            let registry = fleet.registry(role_of(fleet, name));
            registry.connect(name, target.as_deref(), None, None).await?;
            let instance = registry.get(name)?;
            let tools = match instance.role() {
                InstanceRole::Client => instance.list_tools().await.ok(),
                InstanceRole::Server => None,
            };
            let status = registry.get_status(name)?;
            registry.disconnect(name).await?;
            Ok(json!({ "status": status, "tools": tools }))
        }
        Command::Ping { name } => {
            let registry = fleet.registry(role_of(fleet, name));
            registry.connect(name, None, None, None).await?;
            let started = Instant::now();
            let result = registry.get(name)?.ping().await;
            let elapsed = started.elapsed().as_secs_f64() * 1000.0;
            registry.disconnect(name).await?;
            result?;
            Ok(json!({ "name": name, "success": true, "responseTimeMs": elapsed }))
        }
        Command::Test { target, transport } => Ok(serde_json::to_value(
            fleet.clients().test_connection(target, *transport).await,
        )?),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let _guard = init_tracing();

    let config = load_config(cli.config)?;
    let fleet = Fleet::new(
        config,
        mcpfleet_mcp::host_transports(),
        mcpfleet_mcp::client_transports(),
        Arc::new(TokioScheduler),
    );
    info!(command = ?cli.command, "mcpfleet starting");

    let outcome = run(&fleet, &cli.command).await;
    fleet.shutdown().await;

    println!("{}", serde_json::to_string_pretty(&outcome?)?);
    Ok(())
}
