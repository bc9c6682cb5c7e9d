//! Tracing setup for the sweep worker and the test harness.
//!
//! Store operations and scheduler ticks open spans through
//! `#[tracing::instrument]`. This module only decides where they go.

use tracing::Subscriber;
use tracing::subscriber::set_global_default;
use tracing_log::LogTracer;
use tracing_subscriber::{EnvFilter, Registry, fmt, layer::SubscriberExt};

/// Log an error with its full cause chain, e.g. a failed sweep tick.
pub fn log_error(e: impl Into<anyhow::Error>) {
    let e: anyhow::Error = e.into();
    tracing::error!("{e:#}");
}

/// Build a subscriber that writes spans and events to stderr.
///
/// `env_filter` is the worker's `LOG_LEVEL` (or `"error"` in tests).
/// `RUST_LOG` takes precedence when set. Closing spans are logged so that the
/// duration of each store call shows up.
pub fn get_subscriber(env_filter: &str) -> impl Subscriber + Sync + Send {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(env_filter));
    let stderr = fmt::Layer::new()
        .with_writer(std::io::stderr)
        .pretty()
        .with_span_events(fmt::format::FmtSpan::CLOSE);
    Registry::default().with(env_filter).with(stderr)
}

/// Install `subscriber` globally and route `log` records (sqlx emits its
/// statement logs through `log`) into it. Fails if called twice.
pub fn init_subscriber(
    subscriber: impl Subscriber + Sync + Send,
) -> anyhow::Result<()> {
    LogTracer::init()?;
    set_global_default(subscriber)?;
    Ok(())
}
