//! Command-line arguments
//!
//! `api-cli [--config PATH] [--metrics] <command> [args...]`. The config
//! path falls back to `CONFIG_PATH`, then `api-client.toml`.

use clap::{Parser, Subcommand};

#[derive(Parser, Debug, PartialEq, Eq)]
#[command(name = "api-cli", version, about = "Authenticated API client", long_about = None)]
pub struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, env = "CONFIG_PATH")]
    pub config: Option<String>,

    /// Print Prometheus metrics to stderr on exit
    #[arg(long)]
    pub metrics: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Show authentication state
    Status,

    /// Store a credential pair
    Login {
        access: String,
        refresh: String,
        /// Access token lifetime in seconds
        lifetime_secs: u64,
    },

    /// Exchange the refresh token now
    Refresh,

    /// Revoke and clear credentials
    Logout,

    /// GET a resource and print its JSON
    Get {
        path: String,
        /// Query parameters as key=value
        #[arg(value_parser = parse_query_pair)]
        query: Vec<(String, String)>,
    },

    /// Download a resource into a directory
    Download {
        path: String,
        dest_dir: String,
        /// Overrides the server-provided file name
        filename: Option<String>,
    },

    /// Upload files as multipart form data
    Upload {
        path: String,
        #[arg(required = true)]
        files: Vec<String>,
    },

    /// Print a new base64 encryption key
    GenKey,
}

fn parse_query_pair(pair: &str) -> Result<(String, String), String> {
    pair.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("query parameter must be key=value: {pair}"))
}
