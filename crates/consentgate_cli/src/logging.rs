//! Structured logging setup for the command line tool.

use std::sync::Once;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

static INIT: Once = Once::new();

/// Initialize tracing for the command line tool
///
/// This sets up a tracing subscriber with:
/// - Colored output for terminal readability
/// - Env filter from RUST_LOG (defaults to "off")
/// - Output on stderr so command results stay pipeable
pub fn init_tracing(subject: Option<&str>) {
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("off"));

        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .compact()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();

        tracing::debug!(subject = subject.unwrap_or("anonymous"), "=== consentgate started ===");
    });
}
