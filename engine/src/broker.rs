//! Population control.
//!
//! The broker owns every [`SocketState`] in the run. It fills the pool up
//! to the pending cap at start, then wakes on a periodic tick to reap
//! closed states and create replacements until the configured total is
//! exhausted. Counter underflow here means a socket state double-notified
//! and is fatal.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::config::Settings;
use crate::id_pool::IdPool;
use crate::metrics;
use crate::runtime::Runtime;
use crate::socket::{SocketState, StepFunctions};

/// How often the broker reaps and refills its pool.
const TICK: Duration = Duration::from_millis(333);

struct BrokerInner {
    sockets: Vec<Arc<SocketState>>,
    /// Connections still to be created over the whole run; `None` is
    /// unbounded.
    total_remaining: Option<u64>,
    pending: u32,
    active: u32,
    pending_limit: u32,
}

/// Creates and reaps the run's socket states.
pub struct Broker {
    inner: Mutex<BrokerInner>,
    done: Mutex<bool>,
    done_wake: Condvar,
    /// Operator interrupt: stop creating, let in-flight connections finish.
    shutdown: Arc<AtomicBool>,
    settings: Arc<Settings>,
    runtime: Arc<Runtime>,
    pool: Arc<IdPool>,
    hooks: Arc<StepFunctions>,
}

impl Broker {
    pub fn new(
        settings: Arc<Settings>,
        runtime: Arc<Runtime>,
        pool: Arc<IdPool>,
        hooks: Arc<StepFunctions>,
        shutdown: Arc<AtomicBool>,
    ) -> Arc<Self> {
        let total_remaining = settings.total_connections();
        let mut pending_limit = settings.pending_limit();
        // The pending cap can never exceed the total work to do.
        if let Some(total) = total_remaining {
            pending_limit = pending_limit.min(total.min(u32::MAX as u64) as u32);
        }

        Arc::new(Self {
            inner: Mutex::new(BrokerInner {
                sockets: Vec::new(),
                total_remaining,
                pending: 0,
                active: 0,
                pending_limit,
            }),
            done: Mutex::new(false),
            done_wake: Condvar::new(),
            shutdown,
            settings,
            runtime,
            pool,
            hooks,
        })
    }

    /// Create the initial socket population and start the periodic tick.
    pub fn start(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock();
            tracing::debug!(
                total_remaining = ?inner.total_remaining,
                pending_limit = inner.pending_limit,
                "starting broker"
            );
            self.fill(&mut inner);
        }
        self.schedule_tick();
    }

    /// A socket state moved into its IO phase.
    pub fn initiating_io(&self) {
        let mut inner = self.inner.lock();
        assert!(
            inner.pending > 0,
            "pending socket count underflow (active {})",
            inner.active
        );
        inner.pending -= 1;
        inner.active += 1;
        metrics::CONNECTIONS_PENDING.decrement();
    }

    /// A socket state closed; `was_active` tells which counter it held.
    pub fn closing(&self, was_active: bool) {
        let mut inner = self.inner.lock();
        if was_active {
            assert!(
                inner.active > 0,
                "active socket count underflow (pending {})",
                inner.pending
            );
            inner.active -= 1;
        } else {
            assert!(
                inner.pending > 0,
                "pending socket count underflow (active {})",
                inner.active
            );
            inner.pending -= 1;
            metrics::CONNECTIONS_PENDING.decrement();
        }
    }

    /// Block until the run finishes or the operator interrupts; false on
    /// timeout.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut done = self.done.lock();
        loop {
            if *done || self.shutdown.load(Ordering::Relaxed) {
                return true;
            }
            // Short slices so an operator interrupt is noticed promptly.
            let slice = Duration::from_millis(100);
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    self.done_wake
                        .wait_for(&mut done, (deadline - now).min(slice));
                }
                None => {
                    self.done_wake.wait_for(&mut done, slice);
                }
            }
        }
    }

    /// Ask the run to wind down: no new connections are created and
    /// waiters return once in-flight connections finish.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.done_wake.notify_all();
    }

    /// Current (pending, active) counters.
    pub fn counters(&self) -> (u32, u32) {
        let inner = self.inner.lock();
        (inner.pending, inner.active)
    }

    /// Reap closed states, refill the pool, and signal done when all work
    /// is finished. Skips a round instead of stalling IO callbacks when the
    /// lock is contended.
    fn tick(self: &Arc<Self>) {
        let mut reaped = Vec::new();
        let mut finished = false;

        if let Some(mut inner) = self.inner.try_lock() {
            let before = inner.sockets.len();
            let mut kept = Vec::with_capacity(before);
            for socket in inner.sockets.drain(..) {
                if socket.is_closed() {
                    reaped.push(socket);
                } else {
                    kept.push(socket);
                }
            }
            inner.sockets = kept;

            let exhausted = inner.total_remaining == Some(0)
                || self.shutdown.load(Ordering::Relaxed);
            if exhausted && inner.pending == 0 && inner.active == 0 {
                finished = true;
            } else if !self.shutdown.load(Ordering::Relaxed) {
                self.fill(&mut inner);
            }
        }

        // Closed states drop outside the broker lock.
        drop(reaped);

        if finished {
            tracing::debug!("broker done");
            *self.done.lock() = true;
            self.done_wake.notify_all();
            return;
        }
        self.schedule_tick();
    }

    /// Create socket states until the pending cap (and, for clients, the
    /// connection and throttle caps) is reached.
    fn fill(self: &Arc<Self>, inner: &mut BrokerInner) {
        let is_server = self.hooks.is_server();
        while inner.total_remaining != Some(0) && inner.pending < inner.pending_limit {
            // Servers are not throttled on accepts; outgoing connects are
            // capped to keep the connect storm bounded.
            if !is_server {
                if inner.pending + inner.active >= self.settings.connection_limit {
                    break;
                }
                if inner.pending >= self.settings.connection_throttle_limit {
                    break;
                }
            }

            let socket = SocketState::new(
                Arc::downgrade(self),
                Arc::clone(&self.settings),
                Arc::clone(&self.runtime),
                Arc::clone(&self.pool),
                Arc::clone(&self.hooks),
            );
            socket.start();
            inner.sockets.push(socket);
            inner.pending += 1;
            metrics::CONNECTIONS_PENDING.increment();
            if let Some(total) = &mut inner.total_remaining {
                *total -= 1;
            }
        }
    }

    fn schedule_tick(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.runtime.schedule(TICK, move || {
            if let Some(broker) = weak.upgrade() {
                broker.tick();
            }
        });
    }
}
