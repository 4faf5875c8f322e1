//! Per-connection lifecycle state machine.
//!
//! A [`SocketState`] drives one connection through
//! `Creating -> Connecting/Accepting -> InitiatingIo -> Closing -> Closed`
//! by invoking injected step functions on the runtime's workers. Each step
//! function must eventually call [`SocketState::complete_state`] exactly
//! once; a zero code advances the machine and any other code short-circuits
//! to `Closing` with the code preserved as the teardown reason.
//!
//! Ownership: the broker holds the strong reference to each socket state,
//! the socket state owns its pattern, and everything handed to a step
//! function is a weak reference.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use socket2::Socket;

use crate::broker::Broker;
use crate::config::Settings;
use crate::error::code;
use crate::id_pool::IdPool;
use crate::metrics;
use crate::pattern::IoPattern;
use crate::runtime::Runtime;

/// Lifecycle phase, readable without the state lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SocketPhase {
    Creating = 0,
    Connecting = 1,
    Accepting = 2,
    InitiatingIo = 3,
    Closing = 4,
    Closed = 5,
}

impl SocketPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SocketPhase::Creating,
            1 => SocketPhase::Connecting,
            2 => SocketPhase::Accepting,
            3 => SocketPhase::InitiatingIo,
            4 => SocketPhase::Closing,
            _ => SocketPhase::Closed,
        }
    }
}

/// An injectable lifecycle step.
pub type StepFn = Arc<dyn Fn(Weak<SocketState>) + Send + Sync>;

/// The four lifecycle steps plus the optional teardown hook.
///
/// `accept` being set marks server mode, mirroring how the broker decides
/// its population arithmetic.
pub struct StepFunctions {
    pub create: StepFn,
    pub connect: Option<StepFn>,
    pub accept: Option<StepFn>,
    pub io: StepFn,
    pub closing: Option<StepFn>,
}

impl StepFunctions {
    pub fn client(create: StepFn, connect: StepFn, io: StepFn) -> Self {
        Self { create, connect: Some(connect), accept: None, io, closing: None }
    }

    pub fn server(create: StepFn, accept: StepFn, io: StepFn) -> Self {
        Self { create, connect: None, accept: Some(accept), io, closing: None }
    }

    pub fn with_closing(mut self, closing: StepFn) -> Self {
        self.closing = Some(closing);
        self
    }

    pub fn is_server(&self) -> bool {
        self.accept.is_some()
    }
}

struct SocketInner {
    phase: SocketPhase,
    socket: Option<Socket>,
    local_address: Option<SocketAddr>,
    target_address: Option<SocketAddr>,
    pattern: Option<Arc<IoPattern>>,
    teardown_code: u32,
    was_active: bool,
}

/// One connection's lifecycle driver.
pub struct SocketState {
    inner: Mutex<SocketInner>,
    /// Mirror of `inner.phase` so the broker can reap without taking the
    /// state lock inside its own.
    phase: AtomicU8,
    broker: Weak<Broker>,
    settings: Arc<Settings>,
    runtime: Arc<Runtime>,
    pool: Arc<IdPool>,
    hooks: Arc<StepFunctions>,
}

enum Transition {
    Schedule(StepFn),
    NotifyIoThenSchedule(StepFn),
    ScheduleClosing(StepFn),
    FinishClose { was_active: bool },
    None,
}

impl SocketState {
    pub fn new(
        broker: Weak<Broker>,
        settings: Arc<Settings>,
        runtime: Arc<Runtime>,
        pool: Arc<IdPool>,
        hooks: Arc<StepFunctions>,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(SocketInner {
                phase: SocketPhase::Creating,
                socket: None,
                local_address: None,
                target_address: None,
                pattern: None,
                teardown_code: code::OK,
                was_active: false,
            }),
            phase: AtomicU8::new(SocketPhase::Creating as u8),
            broker,
            settings,
            runtime,
            pool,
            hooks,
        })
    }

    /// Kick off the lifecycle by scheduling the create step.
    pub fn start(self: &Arc<Self>) {
        let hook = Arc::clone(&self.hooks.create);
        self.schedule_step(hook);
    }

    /// Advance the machine. A zero code moves to the next phase; a non-zero
    /// code jumps to Closing with the code as the teardown reason.
    /// Re-entry at Closed is ignored.
    pub fn complete_state(self: &Arc<Self>, error_code: u32) {
        let transition = {
            let mut inner = self.inner.lock();
            match inner.phase {
                SocketPhase::Creating => {
                    if error_code == code::OK {
                        if let Some(accept) = &self.hooks.accept {
                            self.set_phase(&mut inner, SocketPhase::Accepting);
                            Transition::Schedule(Arc::clone(accept))
                        } else {
                            let connect = self
                                .hooks
                                .connect
                                .as_ref()
                                .expect("client step functions require a connect step");
                            self.set_phase(&mut inner, SocketPhase::Connecting);
                            Transition::Schedule(Arc::clone(connect))
                        }
                    } else {
                        self.enter_closing(&mut inner, error_code)
                    }
                }
                SocketPhase::Connecting | SocketPhase::Accepting => {
                    if error_code == code::OK {
                        self.set_phase(&mut inner, SocketPhase::InitiatingIo);
                        Transition::NotifyIoThenSchedule(Arc::clone(&self.hooks.io))
                    } else {
                        self.enter_closing(&mut inner, error_code)
                    }
                }
                // The IO phase ended; zero means the transfer succeeded.
                SocketPhase::InitiatingIo => self.enter_closing(&mut inner, error_code),
                SocketPhase::Closing => {
                    let was_active = inner.was_active;
                    Transition::FinishClose { was_active }
                }
                SocketPhase::Closed => Transition::None,
            }
        };

        match transition {
            Transition::Schedule(hook) => self.schedule_step(hook),
            Transition::NotifyIoThenSchedule(hook) => {
                if let Some(broker) = self.broker.upgrade() {
                    broker.initiating_io();
                }
                metrics::CONNECTIONS_ACTIVE.increment();

                // The pattern exists only while the connection is in its IO
                // phase.
                match IoPattern::new(Arc::clone(&self.settings), Arc::clone(&self.pool)) {
                    Ok(pattern) => {
                        self.inner.lock().pattern = Some(pattern);
                        self.schedule_step(hook);
                    }
                    Err(error) => {
                        tracing::warn!(%error, "failed to build the io pattern");
                        self.complete_state(code::OUT_OF_RESOURCES);
                    }
                }
            }
            Transition::ScheduleClosing(hook) => self.schedule_step(hook),
            Transition::FinishClose { was_active } => self.finish_close(was_active),
            Transition::None => {}
        }
    }

    /// The current lifecycle phase.
    pub fn current_phase(&self) -> SocketPhase {
        SocketPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub fn is_closed(&self) -> bool {
        self.current_phase() == SocketPhase::Closed
    }

    /// Hand ownership of the transport socket to this state.
    pub fn set_socket(&self, socket: Socket) {
        self.inner.lock().socket = Some(socket);
    }

    /// Duplicate the socket handle for a transport driver. The underlying
    /// description is shared; this state keeps ownership.
    pub fn socket_clone(&self) -> Option<Socket> {
        let inner = self.inner.lock();
        inner.socket.as_ref().and_then(|s| s.try_clone().ok())
    }

    pub fn set_local_address(&self, address: SocketAddr) {
        self.inner.lock().local_address = Some(address);
    }

    pub fn local_address(&self) -> Option<SocketAddr> {
        self.inner.lock().local_address
    }

    pub fn set_target_address(&self, address: SocketAddr) {
        self.inner.lock().target_address = Some(address);
    }

    pub fn target_address(&self) -> Option<SocketAddr> {
        self.inner.lock().target_address
    }

    /// The IO pattern, present only between InitiatingIo and Closing.
    pub fn io_pattern(&self) -> Option<Arc<IoPattern>> {
        self.inner.lock().pattern.clone()
    }

    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }

    fn set_phase(&self, inner: &mut SocketInner, phase: SocketPhase) {
        tracing::trace!(from = ?inner.phase, to = ?phase, "socket phase");
        inner.phase = phase;
        self.phase.store(phase as u8, Ordering::Release);
    }

    fn enter_closing(&self, inner: &mut SocketInner, error_code: u32) -> Transition {
        let was_active = inner.phase == SocketPhase::InitiatingIo;
        inner.was_active = was_active;
        inner.teardown_code = error_code;
        self.set_phase(inner, SocketPhase::Closing);
        match &self.hooks.closing {
            Some(closing) => Transition::ScheduleClosing(Arc::clone(closing)),
            None => Transition::FinishClose { was_active },
        }
    }

    /// Record the outcome, release the pattern and socket, and notify the
    /// broker. This is the only place a state reaches Closed.
    fn finish_close(self: &Arc<Self>, was_active: bool) {
        let (pattern, teardown_code) = {
            let mut inner = self.inner.lock();
            if inner.phase == SocketPhase::Closed {
                return;
            }
            self.set_phase(&mut inner, SocketPhase::Closed);
            inner.socket = None;
            (inner.pattern.take(), inner.teardown_code)
        };

        if was_active {
            metrics::CONNECTIONS_ACTIVE.decrement();
        }

        let protocol_error = pattern.as_ref().is_some_and(|p| p.protocol_error());
        if teardown_code == code::OK {
            metrics::CONNECTIONS_COMPLETED.increment();
            tracing::debug!(target_address = ?self.target_address(), "connection completed");
        } else if protocol_error {
            // Already counted by the pattern when the violation surfaced.
            tracing::debug!(teardown_code, "connection failed the transfer protocol");
        } else {
            metrics::CONNECTION_ERRORS.increment();
            tracing::debug!(teardown_code, "connection failed");
        }

        if let Some(pattern) = pattern {
            pattern.finalize();
        }

        if let Some(broker) = self.broker.upgrade() {
            broker.closing(was_active);
        }
    }

    /// Run a step function on a worker. A panicking step is converted into
    /// a resource-exhaustion completion so the lifecycle still terminates.
    fn schedule_step(self: &Arc<Self>, hook: StepFn) {
        let weak = Arc::downgrade(self);
        self.runtime.spawn(move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                hook(weak.clone());
            }));
            if result.is_err() {
                tracing::error!("lifecycle step panicked");
                if let Some(state) = weak.upgrade() {
                    state.complete_state(code::OUT_OF_RESOURCES);
                }
            }
        });
    }
}
