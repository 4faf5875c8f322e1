//! Operator-facing pieces of the traffic tool: logging, signals, the
//! socket transport, and output formatting. The binary in `main.rs` wires
//! these around the engine.

pub mod logging;
pub mod output;
pub mod signal;
pub mod transport;
