//! Operator binary: list and call bridged tools from a configuration file

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use toolbridge::config::{ConfigFile, InMemoryConfigStore};
use toolbridge::utils::logging::{init_logging, LoggingConfig};
use toolbridge::ToolBridge;

#[derive(Parser)]
#[command(name = "toolbridge", version, about = "Call tools on JSON-RPC tool servers")]
struct Args {
    /// Configuration file (.toml, .yaml, .yml or .json)
    #[arg(short, long)]
    config: PathBuf,

    /// Owner whose servers are used
    #[arg(short, long, default_value = "default")]
    owner: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show the configured servers
    Servers,
    /// Connect to every server and list its namespaced tools
    List,
    /// Invoke one namespaced tool
    Call {
        /// Tool name, e.g. `files__read`
        tool: String,
        /// Arguments as a JSON object
        #[arg(default_value = "{}")]
        arguments: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _logging = init_logging(LoggingConfig::from_env()).context("Failed to set up logging")?;
    let args = Args::parse();

    let file = ConfigFile::from_path(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;
    let settings = file.bridge.merge_with_env()?;
    let store = Arc::new(InMemoryConfigStore::with_servers(file.servers));
    let bridge = ToolBridge::new(settings, store)?;

    let outcome = run(&bridge, &args.owner, args.command).await;
    bridge.shutdown().await;
    outcome
}

async fn run(bridge: &ToolBridge, owner: &str, command: Command) -> Result<()> {
    match command {
        Command::Servers => {
            for server in bridge.servers(owner).await? {
                let target = server.url.clone().or(server.command.clone()).unwrap_or_default();
                println!("{}\t{:?}\t{}", server.server_name, server.transport, target);
            }
        }
        Command::List => {
            for tool in bridge.list_tools(owner).await? {
                println!("{}\t{}", tool.namespaced_name, tool.description);
            }
        }
        Command::Call { tool, arguments } => {
            let arguments: Value =
                serde_json::from_str(&arguments).context("Arguments must be valid JSON")?;
            let Some(output) = bridge.invoke(owner, &tool, arguments).await? else {
                anyhow::bail!("'{}' is not a bridged tool name (expected <server>__<tool>)", tool);
            };
            println!("{}", output.text);
            for attachment in &output.attachments {
                println!("{}", serde_json::to_string(attachment)?);
            }
            if output.is_error {
                std::process::exit(1);
            }
        }
    }
    Ok(())
}
