//! Run-wide metrics.
//!
//! Process-wide counters aggregated across all connections, registered with
//! metriken for exposition. Per-connection numbers live in
//! [`stats`](crate::stats) structs and are folded into these counters when a
//! connection tears down.

use metriken::{AtomicHistogram, Counter, Gauge, metric};

#[metric(
    name = "connections_completed",
    description = "Connections that completed their transfer successfully"
)]
pub static CONNECTIONS_COMPLETED: Counter = Counter::new();

#[metric(
    name = "connection_errors",
    description = "Connections torn down by a transport error"
)]
pub static CONNECTION_ERRORS: Counter = Counter::new();

#[metric(
    name = "protocol_errors",
    description = "Connections torn down by a transfer protocol violation"
)]
pub static PROTOCOL_ERRORS: Counter = Counter::new();

#[metric(name = "connections_active", description = "Connections in their IO phase")]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

#[metric(name = "connections_pending", description = "Connections not yet in their IO phase")]
pub static CONNECTIONS_PENDING: Gauge = Gauge::new();

#[metric(name = "bytes_sent", description = "Total payload bytes sent")]
pub static BYTES_SENT: Counter = Counter::new();

#[metric(name = "bytes_recv", description = "Total payload bytes received")]
pub static BYTES_RECV: Counter = Counter::new();

#[metric(name = "udp_bits_recv", description = "Total UDP stream bits received")]
pub static UDP_BITS_RECV: Counter = Counter::new();

#[metric(name = "udp_frames_ok", description = "In-order UDP frames received")]
pub static UDP_FRAMES_OK: Counter = Counter::new();

#[metric(name = "udp_frames_dropped", description = "UDP frames never received")]
pub static UDP_FRAMES_DROPPED: Counter = Counter::new();

#[metric(name = "udp_frames_duplicate", description = "UDP frames received more than once")]
pub static UDP_FRAMES_DUPLICATE: Counter = Counter::new();

#[metric(name = "udp_frames_error", description = "UDP datagrams that failed framing validation")]
pub static UDP_FRAMES_ERROR: Counter = Counter::new();

#[metric(
    name = "udp_jitter",
    description = "Inter-frame jitter histogram (microseconds)"
)]
pub static UDP_JITTER: AtomicHistogram = AtomicHistogram::new(7, 64);

/// Total error count for the process exit code, saturated to `i32::MAX`.
pub fn exit_code() -> i32 {
    let errors = CONNECTION_ERRORS.value() + PROTOCOL_ERRORS.value();
    errors.min(i32::MAX as u64) as i32
}
