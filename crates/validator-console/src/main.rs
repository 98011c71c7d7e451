mod auth;
mod cli;
mod config;
mod logging;
mod registry;
mod results;
mod routes;
mod thresholds;

use crate::cli::Args;
use crate::config::load_console_config;
use crate::logging::init_tracing;
use crate::registry::RunRegistry;
use crate::routes::{build_router, AppState};
use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use validator_runner::Runner;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _log_guard = init_tracing(args.log_dir.as_deref(), args.log_to_stderr)?;

    info!(
        listen_addr = %args.listen_addr,
        config = %args.config.display(),
        "console starting"
    );
    let config = load_console_config(&args.config)?;
    if !config.runner.script.is_file() {
        tracing::warn!(
            script = %config.runner.script.display(),
            "validator script not found; runs will fail until it exists"
        );
    }
    std::fs::create_dir_all(&config.output_dir).with_context(|| {
        format!(
            "failed to create output dir {}",
            config.output_dir.display()
        )
    })?;
    info!(
        script = %config.runner.script.display(),
        output_dir = %config.output_dir.display(),
        timeout = ?config.runner.timeout,
        max_concurrent_runs = config.max_concurrent_runs,
        operator = %config.credentials.username(),
        "console configured"
    );

    let state = AppState {
        runner: Arc::new(Runner::new(config.runner)),
        registry: Arc::new(RunRegistry::new(config.max_concurrent_runs)),
        credentials: Arc::new(config.credentials),
        output_dir: Arc::new(config.output_dir),
        thresholds_file: Arc::new(config.thresholds_file),
    };
    let app = build_router(state);

    let listener = TcpListener::bind(&args.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", args.listen_addr))?;
    info!(addr = %args.listen_addr, "console listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown())
        .await?;
    info!("console shutting down");
    Ok(())
}

/// In-flight runs keep their connections open, so shutdown waits for them to finish.
async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
