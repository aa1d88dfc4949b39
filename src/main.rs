// Binary: mcp-hub
// Usage: mcp-hub [--config FILE] <COMMAND>
// - servers: list discoverable servers (nothing is spawned)
// - status: connect everything, print per-server state, shut down
// - tools: list the tools of one server
// - call: invoke one tool and print its result

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use mcp_hub::config::ManagerConfig;
use mcp_hub::logging::{self, LogFormat};
use mcp_hub::mcp_client::{McpError, McpManager};

/// Supervise MCP tool-provider servers from the command line
#[derive(Parser)]
#[command(name = "mcp-hub")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: $MCP_HUB_CONFIG, then the per-user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Clone, Copy, Default, ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// List servers that can be launched on this machine
    Servers,

    /// Connect every enabled server and report its state
    Status,

    /// List the tools a server offers
    Tools {
        /// Server name (see `mcp-hub servers`)
        server: String,
    },

    /// Call a tool and print its result
    Call {
        server: String,
        tool: String,

        /// Tool arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,

        /// Override the configured call timeout
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ManagerConfig::load(cli.config.as_deref()).context("loading config")?;
    let log_format = if cli.log_json {
        LogFormat::Json
    } else {
        LogFormat::Text
    };
    logging::init_tracing(config.log_dir.as_deref(), log_format)
        .context("initializing logging")?;

    let manager = McpManager::new(config);

    let result = tokio::select! {
        result = run(&manager, cli.command, cli.format) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted");
            Ok(())
        }
    };

    for (server, e) in manager.shutdown_all().await {
        tracing::warn!(server = %server, error = %e, "shutdown error");
    }
    result
}

async fn run(manager: &McpManager, command: Commands, format: OutputFormat) -> Result<()> {
    match command {
        Commands::Servers => servers(manager, format).await,
        Commands::Status => status(manager, format).await,
        Commands::Tools { server } => tools(manager, &server, format).await,
        Commands::Call {
            server,
            tool,
            args,
            timeout_ms,
        } => {
            let arguments: serde_json::Value =
                serde_json::from_str(&args).context("--args must be valid JSON")?;
            if !arguments.is_object() {
                bail!("--args must be a JSON object");
            }
            call(manager, &server, &tool, arguments, timeout_ms, format).await
        }
    }
}

async fn servers(manager: &McpManager, format: OutputFormat) -> Result<()> {
    manager.discover().await;
    let registry = manager.registry();

    match format {
        OutputFormat::Json => {
            let entries: Vec<serde_json::Value> = registry
                .iter()
                .map(|def| {
                    serde_json::json!({
                        "name": def.name,
                        "command": def.command,
                        "args": def.args,
                        "enabled": def.enabled,
                        "credential": def.credential.as_ref().map(|c| &c.service),
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        OutputFormat::Text => {
            if registry.is_empty() {
                println!("No launchable MCP servers found.");
                return Ok(());
            }
            for def in registry.iter() {
                let flag = if def.enabled { " " } else { "-" };
                println!("{flag} {:<14} {}", def.name, def.display_command());
            }
        }
    }
    Ok(())
}

async fn status(manager: &McpManager, format: OutputFormat) -> Result<()> {
    let report = manager.initialize_all().await;
    let statuses = manager.status();

    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "servers": statuses,
                    "extensions": manager.extensions(),
                }))?
            );
        }
        OutputFormat::Text => {
            for status in &statuses {
                match &status.last_error {
                    Some(err) => println!("{:<14} {:<12} {err}", status.name, status.state),
                    None => println!("{:<14} {}", status.name, status.state),
                }
            }
            println!(
                "{} connected, {} failed, {} extensions",
                report.connected.len(),
                report.failed.len(),
                report.extensions
            );
        }
    }
    Ok(())
}

async fn tools(manager: &McpManager, server: &str, format: OutputFormat) -> Result<()> {
    connect_one(manager, server).await?;
    let tools = manager.list_tools(server).await?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&tools)?),
        OutputFormat::Text => {
            for tool in &tools {
                println!("{:<24} {}", tool.name, tool.description);
            }
        }
    }
    Ok(())
}

async fn call(
    manager: &McpManager,
    server: &str,
    tool: &str,
    arguments: serde_json::Value,
    timeout_ms: Option<u64>,
    format: OutputFormat,
) -> Result<()> {
    connect_one(manager, server).await?;
    let result = manager
        .call_tool_with_timeout(server, tool, arguments, timeout_ms.map(Duration::from_millis))
        .await?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string(&result)?),
        OutputFormat::Text => println!("{}", serde_json::to_string_pretty(&result)?),
    }
    Ok(())
}

/// Discover and connect a single server, with a suggestion for typos.
async fn connect_one(manager: &McpManager, server: &str) -> Result<()> {
    manager.discover().await;
    match manager.connect(server).await {
        Ok(()) => Ok(()),
        Err(McpError::UnknownServer { name }) => {
            let similar = manager.registry().find_similar(&name, 3);
            if similar.is_empty() {
                bail!("unknown server '{name}'");
            }
            bail!("unknown server '{name}' (did you mean: {}?)", similar.join(", "));
        }
        Err(e) => Err(e.into()),
    }
}
