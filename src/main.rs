// src/main.rs
// Process entry point: parses the CLI surface, loads configuration, and
// either serves the stdio MCP transport or runs a one-shot debug command
// (SPEC_FULL.md §2, §6).

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use rmcp::ServiceExt;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use sr_diag_agent::cli::{Cli, Command, ConfigAction};
use sr_diag_agent::config::AgentConfig;
use sr_diag_agent::logger::Logger;
use sr_diag_agent::mcp::DiagAgentServer;
use sr_diag_agent::orchestrate::{Engine, LoopOutcome};

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Command::Serve);

    init_tracing(&command);

    match command {
        Command::Serve => run_serve().await,
        Command::Tool { name, args } => run_tool_once(&name, args.as_deref()).await,
        Command::Config {
            action: ConfigAction::Show,
        } => {
            print_config();
            Ok(())
        }
    }
}

/// `serve` writes protocol frames to stdout; keep it quiet (WARN) there so
/// nothing but the MCP transport touches stdout. Debug subcommands are free
/// to be chattier on stderr.
fn init_tracing(command: &Command) {
    let default_filter = match command {
        Command::Serve => "warn",
        _ => "info",
    };
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

fn build_engine() -> Engine {
    let config = AgentConfig::load();
    let validation = config.validate();
    if !validation.is_valid() {
        for err in &validation.errors {
            error!("{err}");
        }
    }
    for warning in &validation.warnings {
        tracing::warn!("{warning}");
    }

    let log_dir = std::env::var("SR_DIAG_LOG_DIR").unwrap_or_else(|_| "logs".to_string());
    let logger = Arc::new(Logger::new(log_dir, config.logging_enabled));

    Engine::new(config, logger)
}

async fn run_serve() -> Result<()> {
    info!("starting sr-diag-agent stdio MCP server");
    let engine = Arc::new(build_engine());
    let server = DiagAgentServer::new(engine);

    let service = server.serve(rmcp::transport::stdio()).await?;
    service.waiting().await?;
    Ok(())
}

async fn run_tool_once(name: &str, args_json: Option<&str>) -> Result<()> {
    let engine = build_engine();
    let args = match args_json {
        Some(raw) => serde_json::from_str(raw)?,
        None => serde_json::Map::new(),
    };

    match engine.run_tool(name, args).await {
        Ok(LoopOutcome::Report { brief_summary, report_path }) => {
            println!("{brief_summary}\n\nfull report: {report_path}");
        }
        Ok(LoopOutcome::Progress { text }) => println!("{text}"),
        Ok(LoopOutcome::Plan { markdown }) => println!("{markdown}"),
        Ok(LoopOutcome::NeedsSelection { payload }) => {
            println!("{}", serde_json::to_string_pretty(&payload)?);
        }
        Err(e) => {
            eprintln!("tool call failed: {}", e.to_user_string());
            std::process::exit(1);
        }
    }
    Ok(())
}

fn print_config() {
    let config = AgentConfig::load();
    println!("central_api: {}", config.central_api);
    println!(
        "central_api_token: {}",
        if config.central_api_token.is_some() { "***MASKED***" } else { "(none)" }
    );
    println!("sr_host: {}:{}", config.sql.host, config.sql.port);
    println!("sr_user: {}", config.sql.user);
    println!("sr_password: {}", if config.sql.password.is_empty() { "(empty)" } else { "***MASKED***" });
    println!("prometheus: {}", config.prometheus_base_url());
    println!("ssh_user: {}", config.ssh.resolve_user(None));
    println!("ssh_key_path: {}", config.ssh.key_path.as_deref().unwrap_or("(none)"));
    println!("logging_enabled: {}", config.logging_enabled);

    let validation = config.validate();
    println!("\n{}", validation.report());
}
