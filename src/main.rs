//! `thinking-relay` server binary.
//!
//! Every flag can also be set through a `THINKING_RELAY_*` environment
//! variable (e.g. `THINKING_RELAY_UPSTREAM_URL`); the environment wins.

use anyhow::{Context, Result};
use clap::Parser;
use log::{LevelFilter, error, info};
use std::path::PathBuf;
use std::sync::Arc;
use thinking_relay::{
    AppState, HttpChatBackend, Orchestrator, RelayConfig, ToolProcessManager, server,
};

#[derive(Parser, Debug)]
#[clap(author, version, about = "Streaming chat relay with a sequential-thinking tool")]
struct Cli {
    #[clap(long, help = "Address to listen on (default 0.0.0.0:8000)")]
    bind_addr: Option<String>,

    #[clap(long, help = "Base URL of the OpenAI-compatible chat API")]
    upstream_url: Option<String>,

    #[clap(long, help = "Upstream connect, response and idle-stream timeout in seconds")]
    upstream_timeout: Option<u64>,

    #[clap(long, help = "Executable that serves the sequential-thinking tool")]
    tool_command: Option<String>,

    #[clap(long = "tool-arg", allow_hyphen_values = true, help = "Argument for the tool command (repeatable)")]
    tool_args: Vec<String>,

    #[clap(long, help = "Tool process handshake timeout in seconds")]
    handshake_timeout: Option<u64>,

    #[clap(long, help = "Single tool call timeout in seconds")]
    invoke_timeout: Option<u64>,

    #[clap(long, help = "Grace period before the tool process is killed, in seconds")]
    shutdown_timeout: Option<u64>,

    #[clap(long, help = "Maximum tool round-trips per chat request")]
    max_iterations: Option<u32>,

    #[clap(long, help = "System prompt prepended to every conversation")]
    system_prompt: Option<String>,

    #[clap(long = "cors-origin", help = "Allowed CORS origin (repeatable, `*` for any)")]
    cors_origins: Vec<String>,

    #[clap(long, help = "Directory served under /static")]
    static_dir: Option<PathBuf>,

    #[clap(long, short, env = "THINKING_RELAY_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Cli {
    fn into_config(self) -> thinking_relay::Result<RelayConfig> {
        let mut builder = RelayConfig::builder();

        if let Some(addr) = self.bind_addr {
            builder = builder.bind_addr(addr);
        }
        if let Some(url) = self.upstream_url {
            builder = builder.upstream_url(url);
        }
        if let Some(secs) = self.upstream_timeout {
            builder = builder.upstream_timeout(secs);
        }
        if let Some(command) = self.tool_command {
            builder = builder.tool_command(command);
        }
        if !self.tool_args.is_empty() {
            builder = builder.tool_args(self.tool_args);
        }
        if let Some(secs) = self.handshake_timeout {
            builder = builder.handshake_timeout(secs);
        }
        if let Some(secs) = self.invoke_timeout {
            builder = builder.invoke_timeout(secs);
        }
        if let Some(secs) = self.shutdown_timeout {
            builder = builder.shutdown_timeout(secs);
        }
        if let Some(max) = self.max_iterations {
            builder = builder.max_iterations(max);
        }
        if let Some(prompt) = self.system_prompt {
            builder = builder.system_prompt(prompt);
        }
        if !self.cors_origins.is_empty() {
            builder = builder.cors_origins(self.cors_origins);
        }
        if let Some(dir) = self.static_dir {
            builder = builder.static_dir(dir);
        }

        builder.build()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level_filter = cli.log_level.parse().unwrap_or(LevelFilter::Info);
    env_logger::Builder::new()
        .filter_level(log_level_filter)
        .init();

    let config = cli.into_config().context("invalid configuration")?;
    run_server(config).await
}

async fn run_server(config: RelayConfig) -> Result<()> {
    let tools = Arc::new(ToolProcessManager::new(config.tool_process()));
    match tools.connect().await {
        Ok(()) => info!("Tool process ready, tools: {}", tools.tools().join(", ")),
        Err(e) => error!(
            "Tool process unavailable, chat requests that need it will fail: {}",
            e
        ),
    }

    let backend = Arc::new(
        HttpChatBackend::from_config(&config).context("failed to create upstream client")?,
    );
    info!("Upstream chat API: {}", backend.base_url());

    let orchestrator = Arc::new(Orchestrator::from_config(
        &config,
        backend.clone(),
        tools.clone(),
    ));
    let state = AppState::new(orchestrator, backend, tools.clone());

    let served = server::serve(&config, state, server::shutdown_signal()).await;

    info!("Stopping tool process");
    tools.disconnect().await;

    served.context("server error")?;
    Ok(())
}
