//! Observability infrastructure for the control plane.
//!
//! This module provides:
//! - Correlation ID tracking for operations
//! - Structured logging utilities
//! - Error context helpers

pub mod correlation;

pub use correlation::CorrelationId;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::{AppConfig, LogFormat};

/// Initialize the process-wide `tracing` subscriber: an `EnvFilter` driven by
/// `RUST_LOG` (falling back to `config.log_level`), writing through a
/// non-blocking appender to stdout, formatted compact or JSON per
/// `config.log_format`.
///
/// Returns the appender's guard; the caller must keep it alive for the
/// process lifetime; dropping it early silently stops log output.
///
/// # Errors
///
/// Returns an error if a subscriber has already been installed.
pub fn init_tracing(config: &AppConfig) -> anyhow::Result<tracing_appender::non_blocking::WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.clone()));

    let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());

    match config.log_format {
        LogFormat::Compact => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(writer))
                .try_init()?;
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(writer))
                .try_init()?;
        }
    }

    Ok(guard)
}
