//! API client command-line tool
//!
//! Thin driver over `api_client::ApiClient`:
//! 1. Loads configuration and the credential encryption key
//! 2. Opens the persisted credential store
//! 3. Runs one command (status, login, get, download, ...) and prints JSON
//!
//! Logs go to stderr as JSON so stdout carries only command output.

mod cli;
mod metrics;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use api_client::{
    ApiClient, ClientConfig, FilePart, LogReauthHandler, Progress, ProgressFn, RequestOptions,
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use credential_store::TokenCipher;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::cli::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    if cli.command == Command::GenKey {
        let key = TokenCipher::generate_key();
        println!("{}", STANDARD.encode(key.expose()));
        return Ok(());
    }

    let prometheus = if cli.metrics {
        Some(metrics::install_recorder()?)
    } else {
        None
    };

    let config_path = ClientConfig::resolve_path(cli.config.as_deref());
    info!(path = %config_path.display(), "loading configuration");
    let config = ClientConfig::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    let client = ApiClient::from_config(&config, Arc::new(LogReauthHandler))
        .await
        .context("failed to initialise API client")?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("received SIGINT, cancelling");
                cancel.cancel();
            }
        }
    });
    let options = RequestOptions::new().cancel(cancel);

    let result = run(&client, cli.command, options).await;

    if let Some(handle) = prometheus {
        eprintln!("{}", handle.render());
    }
    result
}

async fn run(client: &ApiClient, command: Command, options: RequestOptions) -> Result<()> {
    match command {
        Command::Status => print_json(&serde_json::to_value(client.get_auth_status())?),
        Command::Login {
            access,
            refresh,
            lifetime_secs,
        } => {
            client
                .set_credentials(&access, &refresh, lifetime_secs)
                .await
                .context("failed to store credentials")?;
            print_json(&serde_json::to_value(client.get_auth_status())?)
        }
        Command::Refresh => {
            client
                .refresh_authentication()
                .await
                .context("refresh failed, log in again")?;
            print_json(&serde_json::to_value(client.get_auth_status())?)
        }
        Command::Logout => {
            client.logout().await.context("logout failed")?;
            info!("credentials cleared");
            Ok(())
        }
        Command::Get { path, query } => {
            let options = query
                .into_iter()
                .fold(options, |options, (k, v)| options.query(k, v));
            let value: Value = client.get(&path, options).await?;
            print_json(&value)
        }
        Command::Download {
            path,
            dest_dir,
            filename,
        } => {
            let progress: ProgressFn = Arc::new(log_progress);
            let written = client
                .download_file(
                    &path,
                    Path::new(&dest_dir),
                    filename.as_deref(),
                    Some(progress),
                    options,
                )
                .await?;
            println!("{}", written.display());
            Ok(())
        }
        Command::Upload { path, files } => {
            let mut parts = Vec::with_capacity(files.len());
            for file in &files {
                let part = FilePart::from_path("file", Path::new(file))
                    .await
                    .with_context(|| format!("failed to read {file}"))?;
                parts.push(part);
            }
            let progress: ProgressFn = Arc::new(log_progress);
            let value: Value = client
                .upload_multiple_files(&path, parts, Vec::new(), Some(progress), options)
                .await?;
            print_json(&value)
        }
        Command::GenKey => Ok(()),
    }
}

fn log_progress(progress: Progress) {
    debug!(
        transferred = progress.transferred,
        total = progress.total,
        "transfer progress"
    );
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
