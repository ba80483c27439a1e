// src/cli.rs
// CLI surface (SPEC_FULL.md §2 ambient stack): `serve` runs the stdio MCP
// server (the default); `tool` is a one-shot local invocation for debugging
// without an AI client attached; `config show` prints the resolved,
// redacted configuration. Mirrors the teacher's `mira-chat` subcommand split
// between a long-running server mode and one-shot debug entry points.

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "sr-diag-agent")]
#[command(about = "Execution arm for the StarRocks diagnostic service")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the stdio MCP server (default if no subcommand is given).
    Serve,

    /// Invoke a single tool call locally, bypassing the outer JSON-RPC
    /// transport — useful for debugging a tool without an AI client attached.
    Tool {
        /// Tool name (local or orchestrator-declared).
        name: String,
        /// JSON object of arguments, e.g. '{"hours": 24}'.
        #[arg(long)]
        args: Option<String>,
    },

    /// Configuration inspection.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print the resolved configuration (secrets redacted).
    Show,
}
