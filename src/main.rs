mod bot;
mod config;
mod llm;
mod platform;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::bot::Session;
use crate::config::{Config, FileConfig, LoggingConfig};

/// Console plus a daily-rotated log file. Keep the guard alive until exit so
/// buffered records are flushed.
fn init_logging(logging: &LoggingConfig) -> Result<WorkerGuard> {
    std::fs::create_dir_all(&logging.directory).with_context(|| {
        format!(
            "Failed to create log directory: {}",
            logging.directory.display()
        )
    })?;

    let appender = tracing_appender::rolling::daily(&logging.directory, &logging.file_name);
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,relaybot=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();

    Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("relaybot.toml"));

    let (file_config, file_error) = FileConfig::load_or_default(&config_path);

    let _log_guard = init_logging(&file_config.logging)?;

    if let Some(e) = file_error {
        error!("Failed to load config from {}: {}", config_path.display(), e);
        return Err(e.into());
    }

    info!("Loading configuration from: {}", config_path.display());
    let config = match Config::from_env(file_config) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return Err(e.into());
        }
    };

    info!("Configuration loaded successfully");
    info!("  Model: {}", config.completion.model);
    info!("  Endpoint: {}", config.completion.base_url);
    info!("  Allowed channel: {}", config.discord.allowed_channel_id);

    let session = Arc::new(Session::new(&config));

    let result = platform::discord::run(session.clone(), &config.discord.token).await;

    // Runs whether the gateway exited cleanly or startup failed partway.
    session.shutdown().await;

    if let Err(e) = result {
        error!("{}", e);
        return Err(e.into());
    }

    Ok(())
}
