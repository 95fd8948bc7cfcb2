#![cfg_attr(test, allow(clippy::unwrap_used))]

mod ansi;
mod format;

use anyhow::{Context, Result};
use tracing::{Subscriber, subscriber::DefaultGuard};
use tracing_log::LogTracer;
use tracing_subscriber::{EnvFilter, Registry, filter::ParseError, fmt, layer::SubscriberExt as _};

pub use ansi::stdout_supports_ansi;
pub use format::Format;

/// Registers the global subscriber: a single stdout layer, either human-readable or
/// newline-delimited JSON, filtered by `directives`.
pub fn setup_global_subscriber(directives: &str, stdout_json: bool) -> Result<()> {
    if let Err(error) = output_vt100::try_init() {
        tracing::debug!("Failed to init terminal colors: {error}");
    }

    let filter = try_filter(directives).context("Failed to parse directives")?;

    let subscriber = Registry::default().with(match stdout_json {
        true => fmt::layer()
            .json()
            .flatten_event(true)
            .with_ansi(stdout_supports_ansi())
            .with_filter(filter)
            .boxed(),
        false => fmt::layer()
            .with_ansi(stdout_supports_ansi())
            .event_format(Format::new())
            .with_filter(filter)
            .boxed(),
    });

    init(subscriber)
}

#[expect(
    clippy::disallowed_methods,
    reason = "This is the alternative function."
)]
pub fn init(subscriber: impl Subscriber + Send + Sync + 'static) -> Result<()> {
    tracing::subscriber::set_global_default(subscriber).context("Could not set global default")?;
    LogTracer::init().context("Failed to init LogTracer")?;

    Ok(())
}

/// Constructs an opinionated [`EnvFilter`] with some crates already silenced.
pub fn try_filter(directives: &str) -> Result<EnvFilter, ParseError> {
    /// A filter directive that silences noisy dependency crates.
    ///
    /// For debugging, it is useful to set a catch-all log like `debug`.
    /// This obviously creates a lot of logs from all kinds of crates.
    /// By prepending this directive, a simple directive like `debug` actually produces
    /// useful logs; you can still activate logs from these crates by restating them
    /// in your own directive with a lower filter, i.e. `mio=debug`.
    const IRRELEVANT_CRATES: &str = "mio=warn,want=warn";

    if directives.is_empty() {
        EnvFilter::try_new(IRRELEVANT_CRATES)
    } else {
        EnvFilter::try_new(format!("{IRRELEVANT_CRATES},{directives}"))
    }
}

/// Initialises a logger to be used in tests.
pub fn test(directives: &str) -> DefaultGuard {
    tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(directives)
        .set_default()
}
