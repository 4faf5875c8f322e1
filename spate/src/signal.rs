//! Signal handling for graceful shutdown.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Install a handler for SIGINT/SIGTERM.
///
/// The returned flag flips to `true` on the first signal; the broker sees
/// it and stops creating connections while in-flight ones drain. A second
/// signal forces an immediate exit.
pub fn install_signal_handler() -> Arc<AtomicBool> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = shutdown.clone();

    ctrlc::set_handler(move || {
        if shutdown_flag.swap(true, Ordering::SeqCst) {
            tracing::warn!("received second signal, forcing immediate exit");
            std::process::exit(1);
        }
        tracing::info!("received shutdown signal, letting in-flight connections finish");
    })
    .expect("failed to set signal handler");

    shutdown
}
