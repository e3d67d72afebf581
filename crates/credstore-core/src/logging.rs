//! Logger bootstrap shared by binaries and tests.

use std::sync::Once;

static INIT: Once = Once::new();

/// Initialise the global logger with `default_level` unless `RUST_LOG`
/// overrides it. Safe to call more than once.
pub fn init(default_level: &str) {
    INIT.call_once(|| {
        env_logger::Builder::from_env(
            env_logger::Env::default().default_filter_or(default_level),
        )
        .format_timestamp_secs()
        .init();
    });
}
