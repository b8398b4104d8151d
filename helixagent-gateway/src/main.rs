//! # HelixAgent Binary
//!
//! ```bash
//! # HTTP gateway with the default config lookup
//! helixagent serve
//!
//! # Explicit config, port override, no docker side-car management
//! helixagent serve --config helixagent.toml --port 9090 --auto-start-docker=false
//!
//! # MCP stdio server for editor/agent integration
//! helixagent mcp-server --config helixagent.toml
//!
//! # Liveness check against a running gateway
//! helixagent check-health --port 9090
//! ```
//!
//! Exit codes: 0 success, 1 generic error, 2 configuration error,
//! 3 missing dependency (e.g. a provider CLI required by OAuth-only mode
//! is not installed).

use clap::{Parser, Subcommand};
use helixagent_gateway::config::Config;
use helixagent_gateway::server::create_server;
use std::net::SocketAddr;
use std::process::ExitCode;

const EXIT_GENERIC: u8 = 1;
const EXIT_CONFIG: u8 = 2;
const EXIT_MISSING_DEPENDENCY: u8 = 3;

#[derive(Parser)]
#[command(name = "helixagent", author, version, about = "Multi-provider LLM orchestration gateway", long_about = None)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, global = true, default_value = "helixagent.toml")]
    config: String,

    /// Logging level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP gateway
    Serve {
        /// Port override (defaults to the config file, then 8080)
        #[arg(short, long)]
        port: Option<u16>,

        /// Host override
        #[arg(long)]
        host: Option<String>,

        /// Manage docker side-cars for configured store endpoints
        /// (`--auto-start-docker=<bool>`)
        #[arg(long, value_name = "BOOL", default_value_t = false, action = clap::ArgAction::Set)]
        auto_start_docker: bool,
    },
    /// Run the MCP stdio server
    McpServer,
    /// Probe a running gateway's /health endpoint
    CheckHealth {
        #[arg(short, long)]
        port: Option<u16>,

        #[arg(long)]
        host: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("LOG_LEVEL").unwrap_or_else(|_| args.log_level.clone()),
        )
        .init();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, path = args.config, "configuration error");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    match args.command {
        Command::Serve {
            port,
            host,
            auto_start_docker,
        } => serve(config, port, host, auto_start_docker).await,
        Command::McpServer => mcp_server(config).await,
        Command::CheckHealth { port, host } => check_health(config, port, host).await,
    }
}

async fn serve(
    mut config: Config,
    port: Option<u16>,
    host: Option<String>,
    auto_start_docker: bool,
) -> ExitCode {
    if let Some(port) = port {
        config.server.port = port;
    }
    if let Some(host) = host {
        config.server.host = host;
    }
    if auto_start_docker {
        // Store side-cars are external collaborators; their lifecycle is
        // compose-managed, we only point at the URLs.
        tracing::info!("auto-start-docker requested; store endpoints are managed externally");
    }

    if let Some(missing) = missing_cli_dependency(&config) {
        tracing::error!(
            binary = missing,
            "OAuth-only provider configured but its CLI is not installed"
        );
        return ExitCode::from(EXIT_MISSING_DEPENDENCY);
    }

    let addr: SocketAddr = match format!("{}:{}", config.server.host, config.server.port).parse() {
        Ok(addr) => addr,
        Err(e) => {
            tracing::error!(error = %e, "invalid bind address");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let (app, runtime) = match create_server(config).await {
        Ok(parts) => parts,
        Err(e) => {
            tracing::error!(error = %e, "failed to assemble the gateway");
            return ExitCode::from(EXIT_GENERIC);
        }
    };

    tracing::info!(%addr, "HelixAgent gateway listening");
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(error = %e, "failed to bind");
            return ExitCode::from(EXIT_GENERIC);
        }
    };

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await;

    runtime.shutdown().await;

    match served {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "server error");
            ExitCode::from(EXIT_GENERIC)
        }
    }
}

async fn mcp_server(config: Config) -> ExitCode {
    if let Some(missing) = missing_cli_dependency(&config) {
        tracing::error!(binary = missing, "required provider CLI not installed");
        return ExitCode::from(EXIT_MISSING_DEPENDENCY);
    }

    // Same assembly as the gateway, minus the HTTP listener
    let (state, runtime) = match helixagent_gateway::server::create_app_state(config).await {
        Ok(parts) => parts,
        Err(e) => {
            tracing::error!(error = %e, "failed to assemble the gateway");
            return ExitCode::from(EXIT_GENERIC);
        }
    };

    tracing::info!("MCP stdio server starting");
    let result = helixagent_gateway::mcp::serve_stdio(state).await;
    runtime.shutdown().await;
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "MCP server error");
            ExitCode::from(EXIT_GENERIC)
        }
    }
}

async fn check_health(config: Config, port: Option<u16>, host: Option<String>) -> ExitCode {
    let host = host.unwrap_or(config.server.host);
    let port = port.unwrap_or(config.server.port);
    let url = format!("http://{host}:{port}/health");

    match reqwest::get(&url).await {
        Ok(response) if response.status().is_success() => {
            println!("ok");
            ExitCode::SUCCESS
        }
        Ok(response) => {
            eprintln!("gateway unhealthy: {}", response.status());
            ExitCode::from(EXIT_GENERIC)
        }
        Err(e) => {
            eprintln!("gateway unreachable: {e}");
            ExitCode::from(EXIT_GENERIC)
        }
    }
}

/// OAuth-only providers need their CLI on PATH; report the first missing
/// one.
fn missing_cli_dependency(config: &Config) -> Option<&'static str> {
    use helixagent_ensemble::providers::ProviderKind;

    for provider in config.providers.values() {
        if !provider.enabled {
            continue;
        }
        let binary = match provider.effective_kind() {
            ProviderKind::ClaudeCli => "claude",
            ProviderKind::QwenCli => "qwen",
            _ => continue,
        };
        if !binary_on_path(binary) {
            return Some(binary);
        }
    }
    None
}

fn binary_on_path(name: &str) -> bool {
    let Some(paths) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&paths).any(|dir| dir.join(name).is_file())
}
