//! Consent-governed activation of third-party integrations.
//!
//! This crate keeps a versioned, expiring record of a user's privacy consent,
//! records every transition of that record in an append-only audit trail, and
//! drives the loading, health-checking, retrying and teardown of third-party
//! services (analytics, marketing pixels, personalization) strictly according
//! to the current consent.
//!
//! A service whose category is not consented to never runs: withdrawal tears
//! it down immediately, and a load that completes after withdrawal is
//! discarded.
//!
//! All components are exposed as [`tower::Service`] implementations and
//! composed by [`gate::init_gate`].

#[cfg(test)]
mod tests;

pub mod gate;

pub mod gate_tracing {
    use std::sync::Once;
    use tracing_subscriber::{EnvFilter, fmt};

    static INIT: Once = Once::new();

    /// Initialize tracing for tests.
    /// Filtering is read from `RUST_LOG` and defaults to `off`.
    pub fn init() {
        INIT.call_once(|| {
            let filter =
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("off"));

            fmt().with_target(false).with_test_writer().with_env_filter(filter).init();
        });
    }
}
