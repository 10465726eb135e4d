//! Switchboard CLI.
//!
//! Sends a prompt to any supported model, optionally with tools served by
//! MCP sidecars, and prints the reply as it streams in.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use switchboard_agent::llm::{PricingSource, TextDeltaCallback};
use switchboard_agent::{
    Agent, LlmClient, ProviderDispatch, Session, SwitchboardConfig, ToolRegistry,
};
use switchboard_mcp::McpClient;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "switchboard",
    version,
    about = "Talk to any LLM vendor through one interface"
)]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a prompt and print the reply.
    Chat {
        /// Model identifier, e.g. `anthropic/claude-3-5-sonnet-20241022`.
        #[arg(long)]
        model: Option<String>,

        /// Wait for the whole reply instead of streaming it.
        #[arg(long)]
        no_stream: bool,

        /// Prompt text.
        prompt: String,
    },
    /// List the tools offered by the configured MCP servers.
    Tools,
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine.
    let _ = dotenvy::dotenv();
    init_tracing("warn");

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Chat {
            model,
            no_stream,
            prompt,
        } => cmd_chat(config, model, no_stream, prompt).await,
        Commands::Tools => cmd_tools(config).await,
    }
}

// ---------------------------------------------------------------------------
// Subcommand: chat
// ---------------------------------------------------------------------------

async fn cmd_chat(
    config: SwitchboardConfig,
    model: Option<String>,
    no_stream: bool,
    prompt: String,
) -> Result<()> {
    let dispatch = config
        .apply_providers(ProviderDispatch::from_env())
        .context("invalid [providers] configuration")?;
    let transport = config.transport().context("failed to build HTTP transport")?;
    let client = Arc::new(LlmClient::new(dispatch, transport));

    let mut agent_config = config.agent_config();
    if no_stream {
        agent_config.stream = false;
    }
    let streaming = agent_config.stream;

    let model = model.unwrap_or_else(|| config.agent.model.clone());
    let mut session = Session::new(&model);
    if let Some(system) = &config.agent.system_prompt {
        session.set_system(system);
    }

    let servers = start_mcp_servers(&config).await?;
    let mut tools = ToolRegistry::new();
    for (server, namespace) in &servers {
        tools
            .register_mcp_server(server.clone(), *namespace)
            .await
            .with_context(|| format!("failed to list tools of MCP server `{}`", server.name()))?;
    }

    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_ctrl_c.cancel();
        }
    });

    let mut agent = Agent::new(client, session)
        .with_config(agent_config)
        .with_tools(tools)
        .with_cancellation(cancel);

    if let Some(catalog) = config.catalog() {
        match catalog.load().await {
            Ok(count) => info!(count, "price catalog loaded"),
            Err(e) => warn!(error = %e, "price catalog unavailable; costs will read zero"),
        }
        agent = agent.with_pricing(Arc::new(catalog));
    }

    if streaming {
        let on_text: TextDeltaCallback = Arc::new(|delta: &str| {
            let mut stdout = std::io::stdout().lock();
            let _ = stdout.write_all(delta.as_bytes());
            let _ = stdout.flush();
        });
        agent = agent.with_text_sink(on_text);
    }

    info!(model = %model, streaming, "sending prompt");
    let result = agent.run_prompt(prompt).await;

    for (server, _) in &servers {
        server.close().await;
    }

    let outcome = result.context("chat failed")?;
    if streaming {
        println!();
    } else {
        println!("{}", outcome.final_text());
    }

    let totals = agent.session().totals();
    eprintln!(
        "[{model}] {} in / {} out tokens, ${:.6}",
        totals.input_tokens, totals.output_tokens, totals.cost
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: tools
// ---------------------------------------------------------------------------

async fn cmd_tools(config: SwitchboardConfig) -> Result<()> {
    let servers = start_mcp_servers(&config).await?;
    if servers.is_empty() {
        println!("no MCP servers configured");
        return Ok(());
    }

    let mut tools = ToolRegistry::new();
    let mut failure = None;
    for (server, namespace) in &servers {
        if let Err(e) = tools.register_mcp_server(server.clone(), *namespace).await {
            failure = Some(anyhow::Error::new(e).context(format!(
                "failed to list tools of MCP server `{}`",
                server.name()
            )));
            break;
        }
    }
    for (server, _) in &servers {
        server.close().await;
    }
    if let Some(e) = failure {
        return Err(e);
    }

    for tool in tools.definitions() {
        println!("{:<32} {}", tool.name, tool.description);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn load_config(path: Option<&Path>) -> Result<SwitchboardConfig> {
    match path {
        Some(path) => SwitchboardConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => Ok(SwitchboardConfig::default()),
    }
}

/// Launch and initialize every configured MCP server.
async fn start_mcp_servers(config: &SwitchboardConfig) -> Result<Vec<(Arc<McpClient>, bool)>> {
    let mut servers: Vec<(Arc<McpClient>, bool)> = Vec::with_capacity(config.mcp_servers.len());
    for server_config in &config.mcp_servers {
        let client = McpClient::spawn(server_config)
            .with_context(|| format!("failed to launch MCP server `{}`", server_config.name))?;
        if let Err(e) = client.initialize().await {
            client.close().await;
            for (started, _) in &servers {
                started.close().await;
            }
            return Err(anyhow::Error::new(e).context(format!(
                "MCP server `{}` failed to initialize",
                server_config.name
            )));
        }
        servers.push((Arc::new(client), server_config.namespace_tools));
    }
    Ok(servers)
}

fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_chat_flags() {
        let cli = Cli::parse_from([
            "switchboard",
            "--config",
            "sb.toml",
            "chat",
            "--model",
            "gpt-4o",
            "--no-stream",
            "hello",
        ]);
        assert_eq!(cli.config.as_deref(), Some(Path::new("sb.toml")));
        match cli.command {
            Commands::Chat {
                model,
                no_stream,
                prompt,
            } => {
                assert_eq!(model.as_deref(), Some("gpt-4o"));
                assert!(no_stream);
                assert_eq!(prompt, "hello");
            }
            Commands::Tools => panic!("expected chat"),
        }
    }

    #[test]
    fn missing_config_path_uses_defaults() {
        let config = load_config(None).unwrap();
        assert!(config.mcp_servers.is_empty());
    }
}
