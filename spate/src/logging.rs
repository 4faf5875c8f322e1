//! Structured logging initialization.
//!
//! The RUST_LOG environment variable takes precedence over the verbosity
//! flags, so operators can scope log levels per module without touching the
//! command line.

use tracing_subscriber::EnvFilter;

/// Initialize the tracing subscriber.
///
/// Verbosity maps to the default level: 0 = info, 1 = debug, 2+ = trace.
pub fn init(verbosity: u8) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match verbosity {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        EnvFilter::new(level)
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
