//! Tracing initialisation.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use aptindex_core::LogConfig;

/// `RUST_LOG` wins over the configured level and component overrides.
fn directives(config: &LogConfig, rust_log: Option<&str>) -> String {
    match rust_log.map(str::trim) {
        Some(directives) if !directives.is_empty() => directives.to_string(),
        _ => config.directives(),
    }
}

/// Initialise tracing once at startup.
pub fn init_tracing(config: &LogConfig) {
    let rust_log = std::env::var("RUST_LOG").ok();
    let filter = EnvFilter::try_new(directives(config, rust_log.as_deref()))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    // Already initialised (tests) is not an error.
    let _ = if config.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .try_init()
    };
}
