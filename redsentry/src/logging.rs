//! Structured logging setup
//!
//! JSON output for production, pretty output for development, both behind
//! an env-filter that `RUST_LOG` can override.

use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

use crate::settings::LoggingSettings;

pub fn init_logging(settings: &LoggingSettings) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.level))
        .map_err(|e| anyhow::anyhow!("invalid log level {:?}: {e}", settings.level))?;

    let registry = tracing_subscriber::registry().with(env_filter);

    if settings.format.as_str() == "json" {
        let layer = fmt::layer().json().with_target(true);
        if let Some(path) = &settings.file_path {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            registry.with(layer.with_writer(std::sync::Arc::new(file))).init();
        } else {
            registry.with(layer).init();
        }
    } else {
        let layer = fmt::layer().with_target(true);
        if let Some(path) = &settings.file_path {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            registry.with(layer.with_writer(std::sync::Arc::new(file))).init();
        } else {
            registry.with(layer).init();
        }
    }

    Ok(())
}
