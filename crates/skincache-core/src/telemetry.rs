//! Tracing setup shared by the `skincache` and `skincached` binaries.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Env var consulted before `RUST_LOG`.
pub const LOG_ENV: &str = "SKINCACHE_LOG";

/// Install the global subscriber.
///
/// The filter comes from `SKINCACHE_LOG`, then `RUST_LOG`, then `level`.
/// Later calls are no-ops.
pub fn init_tracing(json: bool, level: Level) {
    let env_filter = filter_from(std::env::var(LOG_ENV).ok(), level);

    let layer = fmt::layer().with_target(false);
    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(layer.json().flatten_event(true))
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(layer)
            .try_init()
            .ok();
    }
}

fn filter_from(directives: Option<String>, level: Level) -> EnvFilter {
    directives
        .and_then(|d| EnvFilter::try_new(d).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(level.as_str()))
}
