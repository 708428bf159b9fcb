//! Logging configuration using tracing.
//!
//! Log output goes to stderr; stdout carries the plan and step reports.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging with the specified level and output format
/// (`text` or `compact`).
pub fn init(level: &str, format: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    match format {
        "compact" => tracing_subscriber::registry()
            .with(filter)
            .with(layer.compact().with_target(false))
            .try_init()?,
        _ => tracing_subscriber::registry()
            .with(filter)
            .with(layer)
            .try_init()?,
    }

    Ok(())
}
