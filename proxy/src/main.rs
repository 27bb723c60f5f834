use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use editor_proxy::config::{ConfigHandle, ProxyConfig};
use editor_proxy::logging;
use editor_proxy::mcp::{split_tool_name, ToolInvoker, ToolRunner};
use editor_proxy::server;
use editor_proxy::tunnel::ModelCatalog;

#[derive(Parser)]
#[command(name = "editor-proxy")]
#[command(about = "Chat-completion proxy with a tool loop and an embedded MCP server")]
struct Cli {
    /// Config file (default: nearest .editor-proxy.toml, then the user config dir)
    #[arg(long, short, global = true, env = "EDITOR_PROXY_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the proxy
    Serve {
        /// Override the configured port
        #[arg(long, short)]
        port: Option<u16>,
        /// Override the configured host
        #[arg(long)]
        host: Option<String>,
    },
    /// List tools offered by the configured tool servers
    Tools {
        /// Only list tools from a specific server
        #[arg(long)]
        server: Option<String>,
    },
    /// Call a tool directly
    Call {
        /// Exposed tool name, `<server>_<tool>`
        tool: String,
        /// Arguments as JSON
        #[arg(long, short)]
        args: Option<String>,
    },
    /// Print the model listing served at /v1/models
    Models,
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init_tracing()?;

    let cli = Cli::parse();
    let config = ProxyConfig::load(cli.config.as_deref()).context("failed to load config")?;

    match cli.command {
        Commands::Serve { port, host } => {
            let mut config = config;
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(host) = host {
                config.server.host = host;
            }
            server::serve(ConfigHandle::new(config)).await?;
        }
        Commands::Tools { server } => {
            run_tools(ConfigHandle::new(config), server).await?;
        }
        Commands::Call { tool, args } => {
            run_call_tool(ConfigHandle::new(config), &tool, args).await?;
        }
        Commands::Models => {
            let handle = ConfigHandle::new(config);
            let listing = ModelCatalog::new().listing(&handle.current());
            println!("{}", serde_json::to_string_pretty(listing.as_ref())?);
        }
    }

    Ok(())
}

async fn run_tools(config: ConfigHandle, server_filter: Option<String>) -> Result<()> {
    let snapshot = config.current();
    if snapshot.mcp_servers.is_empty() {
        println!("No tool servers configured.");
        return Ok(());
    }

    let runner = ToolRunner::new(config.clone());
    let servers: BTreeMap<&String, _> = snapshot
        .mcp_servers
        .iter()
        .filter(|(name, _)| server_filter.as_ref().map_or(true, |s| s == *name))
        .collect();

    for name in servers.keys() {
        match runner.list_tools(name).await {
            Ok(tools) => {
                println!("=== {} ({} tools) ===", name, tools.len());
                for tool in tools {
                    let desc = tool
                        .description
                        .as_deref()
                        .unwrap_or("No description")
                        .lines()
                        .next()
                        .unwrap_or("");
                    println!("  {} - {}", tool.name, desc);
                }
            }
            Err(e) => println!("=== {} (unavailable: {}) ===", name, e),
        }
        println!();
    }

    Ok(())
}

async fn run_call_tool(config: ConfigHandle, tool_name: &str, args: Option<String>) -> Result<()> {
    let snapshot = config.current();
    let servers: Vec<&str> = snapshot.mcp_servers.keys().map(String::as_str).collect();
    let (server, tool) = split_tool_name(tool_name, &servers)
        .ok_or_else(|| anyhow::anyhow!("No configured server matches tool '{}'", tool_name))?;

    let arguments: serde_json::Value = match args {
        Some(json) => serde_json::from_str(&json).context("--args is not valid JSON")?,
        None => serde_json::json!({}),
    };

    println!("Calling {} on {}", tool, server);
    println!("Arguments: {}", serde_json::to_string_pretty(&arguments)?);
    println!();

    let runner = ToolRunner::new(config.clone());
    let output = runner
        .invoke(&server, tool, arguments, &CancellationToken::new())
        .await?;

    println!("Result:");
    println!("{}", output);
    Ok(())
}
