//! Logging setup for the evolution engine.

use std::path::PathBuf;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Setup structured logging with tracing.
///
/// Console output with color plus a JSON file layer; the returned guard
/// must stay alive for the duration of the run so the file writer flushes.
pub fn setup_logging(verbose: bool) -> anyhow::Result<WorkerGuard> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };

    let log_dir: PathBuf = std::env::var("LOG_DIR")
        .unwrap_or_else(|_| "logs".to_string())
        .into();

    std::fs::create_dir_all(&log_dir)?;

    let log_file = std::env::var("LOG_FILE").unwrap_or_else(|_| "alpha_engine.log".to_string());

    let file_appender = tracing_appender::rolling::never(&log_dir, &log_file);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{}", level)));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_ansi(true)
        .with_writer(std::io::stdout);

    let file_layer = fmt::layer()
        .with_target(true)
        .with_ansi(false)
        .json()
        .with_writer(non_blocking);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    tracing::info!("Logging initialized (verbose={})", verbose);
    tracing::info!("Log file: {:?}", log_dir.join(log_file));

    Ok(guard)
}

/// Setup minimal logging (console only, no files)
pub fn setup_minimal_logging(verbose: bool) -> anyhow::Result<()> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(format!("{}", level)));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_ansi(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("logging init failed: {e}"))?;

    tracing::info!("Minimal logging initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_logging() {
        // Second init in the same process returns Err from the registry;
        // either way this must not panic.
        let _ = setup_minimal_logging(false);
    }
}
