//! Traffic engine.
//!
//! The engine maintains a population of connections ([`broker::Broker`]),
//! drives each one through its lifecycle ([`socket::SocketState`]), shapes
//! the bytes it moves ([`pattern::IoPattern`]), paces sends
//! ([`rate_limit::RateLimit`]), and accounts for every outcome
//! ([`metrics`], [`stats`]). Transports plug in through four injectable
//! step functions and the [`task::IoTask`] contract; the engine never
//! touches a completion mechanism directly.

pub mod accept;
pub mod broker;
pub mod config;
pub mod error;
pub mod id_pool;
pub mod media_stream;
pub mod metrics;
pub mod pattern;
pub mod rate_limit;
pub mod runtime;
pub mod socket;
pub mod stats;
pub mod task;

pub use accept::{AcceptEngine, AcceptSink, AcceptedConnection};
pub use broker::Broker;
pub use config::{PatternKind, Protocol, Role, Settings, ShutdownKind};
pub use error::{Error, code};
pub use id_pool::{CONNECTION_ID_LENGTH, IdPool, Slot};
pub use pattern::{IoCompletion, IoDirection, IoPattern, IoStatus};
pub use rate_limit::RateLimit;
pub use runtime::Runtime;
pub use socket::{SocketPhase, SocketState, StepFn, StepFunctions};
pub use task::{BufferType, IoTask, TaskAction};
