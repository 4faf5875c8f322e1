//! Error taxonomy for the traffic engine.
//!
//! Per-connection failures travel as numeric codes through
//! [`complete_state`](crate::socket::SocketState::complete_state) and never
//! cross connection boundaries. Startup problems are surfaced as typed
//! errors before the engine runs. Invariant violations (counter underflow,
//! unknown states) are fatal and panic with diagnostic context.

use std::io;

/// Engine-level errors surfaced at startup or from resource allocation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("connection id pool exhausted")]
    OutOfResource,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Per-connection error codes.
///
/// Zero means success. The non-zero values are stable within a run and are
/// what the step functions feed to `complete_state`.
pub mod code {
    pub const OK: u32 = 0;
    pub const TIMED_OUT: u32 = 10060;
    pub const CONNECTION_REFUSED: u32 = 10061;
    pub const CONNECTION_RESET: u32 = 10054;
    pub const CONNECTION_ABORTED: u32 = 10053;
    pub const OUT_OF_RESOURCES: u32 = 10055;
    pub const IO_FAILED: u32 = 10101;
    /// The peer violated the transfer protocol (too many / too few /
    /// corrupted bytes). Recorded sticky by the pattern.
    pub const PROTOCOL_VIOLATION: u32 = 10102;
}

/// Map an OS-level I/O error to a per-connection error code.
pub fn code_from_io(err: &io::Error) -> u32 {
    match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => code::TIMED_OUT,
        io::ErrorKind::ConnectionRefused => code::CONNECTION_REFUSED,
        io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe => code::CONNECTION_RESET,
        io::ErrorKind::ConnectionAborted | io::ErrorKind::UnexpectedEof => {
            code::CONNECTION_ABORTED
        }
        io::ErrorKind::OutOfMemory => code::OUT_OF_RESOURCES,
        _ => err.raw_os_error().map(|e| e as u32).unwrap_or(code::IO_FAILED),
    }
}
