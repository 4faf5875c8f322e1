//! Status and summary printing.
//!
//! Reads the run-wide counters and renders the periodic status line and the
//! final historic summary.

use std::time::Duration;

use engine::config::{Protocol, Role, Settings};
use engine::metrics;

/// One status line while the run is in flight.
pub fn print_status(elapsed: Duration) {
    println!(
        "  [{:>6.1}s]  completed {}  errors {}  protocol-errors {}  active {}  pending {}",
        elapsed.as_secs_f64(),
        metrics::CONNECTIONS_COMPLETED.value(),
        metrics::CONNECTION_ERRORS.value(),
        metrics::PROTOCOL_ERRORS.value(),
        metrics::CONNECTIONS_ACTIVE.value(),
        metrics::CONNECTIONS_PENDING.value(),
    );
}

/// The final summary after the run drains.
pub fn print_summary(settings: &Settings, elapsed: Duration) {
    println!();
    println!("  Historic Connection Statistics (all connections over the complete lifetime)");
    println!("  ---------------------------------------------------------------------------");
    println!(
        "  SuccessfulConnections [{}]   NetworkErrors [{}]   ProtocolErrors [{}]",
        metrics::CONNECTIONS_COMPLETED.value(),
        metrics::CONNECTION_ERRORS.value(),
        metrics::PROTOCOL_ERRORS.value(),
    );

    match settings.protocol {
        Protocol::Tcp => {
            println!();
            println!("  Total Bytes Recv : {}", metrics::BYTES_RECV.value());
            println!("  Total Bytes Sent : {}", metrics::BYTES_SENT.value());
        }
        Protocol::Udp => {
            // Frame statistics are tracked on the receiving side only.
            if settings.role == Role::Connect {
                let ok = metrics::UDP_FRAMES_OK.value();
                let dropped = metrics::UDP_FRAMES_DROPPED.value();
                let duplicate = metrics::UDP_FRAMES_DUPLICATE.value();
                let errors = metrics::UDP_FRAMES_ERROR.value();
                let total = ok + dropped + duplicate + errors;
                let pct = |n: u64| {
                    if total > 0 { n as f64 / total as f64 * 100.0 } else { 0.0 }
                };
                println!();
                println!("  Total Bytes Recv : {}", metrics::UDP_BITS_RECV.value() / 8);
                println!("  Total Successful Frames : {} ({:.3})", ok, pct(ok));
                println!("  Total Dropped Frames : {} ({:.3})", dropped, pct(dropped));
                println!("  Total Duplicate Frames : {} ({:.3})", duplicate, pct(duplicate));
                println!("  Total Error Frames : {} ({:.3})", errors, pct(errors));
            }
        }
    }

    println!("  Total Time : {} ms.", elapsed.as_millis());
}
