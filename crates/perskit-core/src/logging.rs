//! Logging setup for the persistence client library.
//!
//! All crates log through `tracing`; the filter is taken from the
//! `PERS_LOG` environment variable (falling back to `warn`). Initialization
//! is idempotent so that init/deinit cycles and embedding applications with
//! their own subscriber both work.

use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber if none is set yet.
pub fn init_logging() {
    let filter = EnvFilter::try_from_env("PERS_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));

    // An embedding application may already have installed a subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
