//! lbfeedback - load balancer feedback agent and control CLI
//!
//! One binary, two personalities: `lbfeedback run-agent` runs the
//! host-resident agent service; any other invocation acts as the API
//! client for a locally running agent.

mod args;
mod client;
mod output;

use anyhow::{Context, Result};
use clap::Parser;
use lbfeedback_lib::config::{self, LOG_FILE_NAME};
use lbfeedback_lib::FeedbackAgent;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn main() -> ExitCode {
    let cli = args::Cli::parse();
    let outcome = match cli.command {
        args::Command::RunAgent => run_agent(),
        command => run_client(command),
    };
    match outcome {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

#[tokio::main]
async fn run_agent() -> Result<bool> {
    let config_dir = config::resolve_config_dir();
    let log_dir = resolve_log_dir(&config_dir);
    // The guard keeps the non-blocking log writer flushing until exit.
    let _log_guard = init_tracing(log_dir);

    info!(version = lbfeedback_lib::VERSION, "starting the feedback agent");
    let agent = FeedbackAgent::load(&config_dir)
        .await
        .context("the feedback agent failed to start")?;
    agent.run().await?;
    Ok(true)
}

/// Log directory precedence: environment override, then the configured
/// `log-dir` (empty string disables file logging), then the platform
/// default when no config exists yet.
fn resolve_log_dir(config_dir: &std::path::Path) -> Option<PathBuf> {
    if let Some(dir) = config::resolve_log_dir_override() {
        return Some(dir);
    }
    match config::load_document(config_dir) {
        Ok(Some(document)) => {
            let dir = document.log_dir.trim();
            if dir.is_empty() {
                None
            } else {
                Some(PathBuf::from(dir))
            }
        }
        _ => Some(PathBuf::from(config::DEFAULT_LOG_DIR)),
    }
}

fn init_tracing(log_dir: Option<PathBuf>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout_layer = fmt::layer();

    let file_writer = log_dir.and_then(|dir| {
        if let Err(err) = std::fs::create_dir_all(&dir) {
            eprintln!(
                "warning: cannot create log directory '{}': {err}; logging to stdout only",
                dir.display()
            );
            return None;
        }
        let appender = tracing_appender::rolling::never(&dir, LOG_FILE_NAME);
        Some((tracing_appender::non_blocking(appender), dir))
    });

    match file_writer {
        Some(((writer, guard), dir)) => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(stdout_layer)
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            info!(path = %dir.join(LOG_FILE_NAME).display(), "logging to file");
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(stdout_layer)
                .init();
            warn!("no file logging path available; not enabled");
            None
        }
    }
}

#[tokio::main]
async fn run_client(command: args::Command) -> Result<bool> {
    let request = args::to_request(command)?;
    let config_dir = config::resolve_config_dir();
    let client = client::ApiClient::from_config(&config_dir)?;
    let response = client.send(&request).await?;
    output::print_response(&response);
    Ok(response.success)
}
