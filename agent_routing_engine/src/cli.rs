//! Command-line interface definitions using clap derive API.

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Agent routing engine CLI
#[derive(Parser)]
#[command(name = "routing-engine-cli")]
#[command(about = "Routes function calls to agents and remembers their results")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP server
    Serve {
        /// Address to bind to; defaults to the configured host and port
        #[arg(long)]
        addr: Option<SocketAddr>,
    },
    /// Run a batch job from configuration file
    Run {
        /// Path to the batch configuration file
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Execute a single function and print the result as JSON
    Exec {
        /// Function to route
        #[arg(short, long)]
        function: String,
        /// Parameters as a JSON document
        #[arg(short, long, default_value = "{}")]
        params: String,
        /// Optional caller context as a JSON document
        #[arg(short, long)]
        context: Option<String>,
    },
}
