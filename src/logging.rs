//! `tracing-subscriber` setup for binaries and tests.
//!
//! The library itself only emits `tracing` events; installing a subscriber is
//! left to the application.

use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;

/// Environment variable holding an `EnvFilter` directive, e.g. `batchline=debug`.
pub const LOG_ENV: &str = "BATCHLINE_LOG";

static INSTALLED: OnceCell<bool> = OnceCell::new();

/// Install a global fmt subscriber filtered by `BATCHLINE_LOG`, falling back
/// to `default_filter`.
///
/// Safe to call more than once. Returns `false` when another subscriber was
/// already installed by someone else.
pub fn init_logging(default_filter: &str) -> bool {
    *INSTALLED.get_or_init(|| {
        let filter = EnvFilter::try_from_env(LOG_ENV)
            .or_else(|_| EnvFilter::try_new(default_filter))
            .unwrap_or_else(|_| EnvFilter::new("info"));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init()
            .is_ok()
    })
}
