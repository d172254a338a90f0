use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

mod config;
mod logging;
mod mcp;
mod web;
mod x402;

use config::GatewayConfig;
use logging::{LogFormat, LogLevel};
use mcp::McpGateway;

#[derive(Parser)]
#[command(name = "mux402")]
#[command(about = "MCP aggregation gateway with x402 payment mediation")]
#[command(long_about = "\
mux402 presents many upstream MCP servers as a single MCP endpoint.

Upstreams are reached over stdio, HTTP, SSE, or WebSocket transports; their
tools, resources, and prompts are aggregated into one namespaced view.
Calls can be payment-gated: the gateway admits API-key tiers locally,
verifies x402 payment proofs through a facilitator, and can pay paid
downstreams itself from an outbound credential.

TYPICAL USAGE:

  Stdio gateway (for Claude, Cursor, etc.):
    mux402 serve --config gateway.json

  HTTP wrapper with SSE:
    mux402 http --config gateway.json --listen 127.0.0.1:8402

  Check a config without connecting anything:
    mux402 validate --config gateway.json
")]
struct Cli {
    #[command(flatten)]
    log: LogArgs,

    #[command(subcommand)]
    command: Commands,
}

/// Logging flags; these override the config file's `settings.logLevel`.
#[derive(Args, Clone, Debug)]
struct LogArgs {
    /// Enable verbose output (INFO level logging)
    #[arg(short = 'v', long, env = "MUX402_VERBOSE")]
    verbose: bool,

    /// Enable debug output (DEBUG level logging)
    #[arg(short = 'd', long, env = "MUX402_DEBUG", conflicts_with = "verbose")]
    debug: bool,

    /// Quiet mode - only show errors
    #[arg(short = 'q', long, conflicts_with_all = ["verbose", "debug"])]
    quiet: bool,

    /// Log output format
    #[arg(long, short = 'L', default_value = "pretty", value_enum, env = "MUX402_LOG_FORMAT")]
    log_format: LogFormat,
}

impl LogArgs {
    /// CLI flags win over the config file; no flag means config level.
    fn level(&self, from_config: LogLevel) -> LogLevel {
        if self.quiet {
            LogLevel::Error
        } else if self.debug {
            LogLevel::Debug
        } else if self.verbose {
            LogLevel::Info
        } else {
            from_config
        }
    }
}

#[derive(Args, Clone, Debug)]
struct ConfigArg {
    /// Gateway configuration (JSON file path or inline JSON string)
    #[arg(long = "config", short = 'c', env = "MUX402_CONFIG", value_name = "file.json or {json}")]
    config: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway over stdio (for Claude, Cursor, etc.)
    ///
    /// Reads JSON-RPC requests on stdin and answers on stdout. All logs
    /// go to stderr.
    Serve(ConfigArg),

    /// Run the HTTP wrapper (POST /message + GET /sse)
    ///
    /// Payment challenges surface as HTTP 402 responses carrying the
    /// X-Accept-Payment header and the requirements as the body.
    Http(HttpArgs),

    /// Validate a gateway configuration and exit
    ///
    /// Checks server ids, namespaces, and every transport descriptor
    /// without connecting anything. Exits 1 when problems are found.
    Validate(ConfigArg),
}

#[derive(Args, Clone, Debug)]
struct HttpArgs {
    #[command(flatten)]
    config: ConfigArg,

    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:8402", env = "MUX402_LISTEN")]
    listen: SocketAddr,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // A fatal configuration or startup error exits 1 via the Err path.
    match cli.command {
        Commands::Serve(args) => {
            let config = load(&args, &cli.log)?;
            let gateway = McpGateway::start(config).await?;
            gateway.run_stdio().await
        }
        Commands::Http(args) => {
            let config = load(&args.config, &cli.log)?;
            let gateway = McpGateway::start(config).await?;
            let result = web::serve(Arc::clone(&gateway), args.listen).await;
            gateway.stop().await;
            result
        }
        Commands::Validate(args) => {
            let config = load(&args, &cli.log)?;
            validate(&config)
        }
    }
}

fn load(args: &ConfigArg, log: &LogArgs) -> Result<GatewayConfig> {
    let config = GatewayConfig::load(&args.config)
        .with_context(|| format!("Failed to load gateway config from '{}'", args.config))?;
    logging::init_tracing(log.level(config.settings.log_level), &log.log_format);
    Ok(config)
}

fn validate(config: &GatewayConfig) -> Result<()> {
    let mut problems = 0usize;

    for server in &config.servers {
        for error in server.transport.validate() {
            problems += 1;
            eprintln!("server `{}`: {}", server.id, error);
        }
    }

    if config.payment.enabled {
        if config.payment.recipient.is_empty() {
            problems += 1;
            eprintln!("payment: enabled but `recipient` is empty");
        }
        if config.payment.facilitator_url.is_none() {
            problems += 1;
            eprintln!("payment: enabled but `facilitatorUrl` is not set");
        }
    }

    if problems > 0 {
        anyhow::bail!("{problems} problem(s) found");
    }

    println!(
        "OK: {} server(s), payment {}",
        config.servers.len(),
        if config.payment.enabled { "enabled" } else { "disabled" }
    );
    Ok(())
}
