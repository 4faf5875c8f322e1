//! Worker pool and one-shot timers.
//!
//! The engine's step functions run as short jobs on a small pool of named
//! worker threads, and delayed work (rate-limit offsets, the broker tick)
//! goes through a timer thread that releases jobs onto the pool when their
//! deadline passes. Panics inside a job are caught at the job boundary so a
//! misbehaving callback cannot take the pool down.

use std::collections::BinaryHeap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::mpsc::{Receiver, Sender, channel};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct TimerEntry {
    deadline: Instant,
    job: Job,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}
impl Eq for TimerEntry {}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reversed so the heap pops the earliest deadline first.
        other.deadline.cmp(&self.deadline)
    }
}

struct TimerState {
    heap: BinaryHeap<TimerEntry>,
    shutdown: bool,
}

/// Shared worker pool with a timer thread.
pub struct Runtime {
    sender: Mutex<Option<Sender<Job>>>,
    timer: Mutex<TimerState>,
    timer_wake: Condvar,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Runtime {
    /// Spin up `threads` workers plus the timer thread.
    pub fn new(threads: usize) -> Arc<Self> {
        let threads = threads.max(1);
        let (sender, receiver) = channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));

        let runtime = Arc::new(Self {
            sender: Mutex::new(Some(sender)),
            timer: Mutex::new(TimerState { heap: BinaryHeap::new(), shutdown: false }),
            timer_wake: Condvar::new(),
            workers: Mutex::new(Vec::new()),
        });

        let mut handles = Vec::with_capacity(threads + 1);
        for id in 0..threads {
            let receiver = Arc::clone(&receiver);
            let handle = std::thread::Builder::new()
                .name(format!("engine-worker-{id}"))
                .spawn(move || worker_loop(receiver))
                .expect("failed to spawn engine worker");
            handles.push(handle);
        }

        let timer_runtime = Arc::clone(&runtime);
        let handle = std::thread::Builder::new()
            .name("engine-timer".to_string())
            .spawn(move || timer_loop(timer_runtime))
            .expect("failed to spawn engine timer");
        handles.push(handle);

        *runtime.workers.lock() = handles;
        runtime
    }

    /// Run a job on the pool as soon as a worker is free.
    pub fn spawn(&self, job: impl FnOnce() + Send + 'static) {
        let sender = self.sender.lock();
        if let Some(sender) = sender.as_ref() {
            // Send fails only during shutdown; dropping the job then is fine.
            let _ = sender.send(Box::new(job));
        }
    }

    /// Run a job on the pool after `delay`. A zero delay degenerates to
    /// [`spawn`](Self::spawn).
    pub fn schedule(&self, delay: Duration, job: impl FnOnce() + Send + 'static) {
        if delay.is_zero() {
            self.spawn(job);
            return;
        }
        let mut timer = self.timer.lock();
        if timer.shutdown {
            return;
        }
        timer.heap.push(TimerEntry {
            deadline: Instant::now() + delay,
            job: Box::new(job),
        });
        self.timer_wake.notify_one();
    }

    /// Stop accepting work and join every thread. Pending timers are
    /// dropped; queued jobs drain first.
    pub fn shutdown(&self) {
        {
            let mut timer = self.timer.lock();
            timer.shutdown = true;
            timer.heap.clear();
            self.timer_wake.notify_one();
        }
        // Dropping the sender ends the worker loops once the queue drains.
        self.sender.lock().take();

        let handles = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            let _ = handle.join();
        }
    }
}

fn worker_loop(receiver: Arc<Mutex<Receiver<Job>>>) {
    loop {
        let job = {
            let receiver = receiver.lock();
            receiver.recv()
        };
        match job {
            Ok(job) => {
                // A panicking callback is contained here; the caller sees it
                // as a failed connection, not a dead worker.
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
                    let what = payload
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| payload.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "non-string panic".to_string());
                    tracing::error!(panic = %what, "engine job panicked");
                }
            }
            Err(_) => return,
        }
    }
}

fn timer_loop(runtime: Arc<Runtime>) {
    let mut timer = runtime.timer.lock();
    loop {
        if timer.shutdown {
            return;
        }
        let now = Instant::now();
        // Release everything due, then sleep until the next deadline.
        while timer.heap.peek().is_some_and(|e| e.deadline <= now) {
            let entry = timer.heap.pop().expect("peeked entry");
            drop(timer);
            runtime.spawn(entry.job);
            timer = runtime.timer.lock();
            if timer.shutdown {
                return;
            }
        }
        match timer.heap.peek().map(|e| e.deadline) {
            Some(deadline) => {
                let wait = deadline.saturating_duration_since(Instant::now());
                if !wait.is_zero() {
                    runtime.timer_wake.wait_for(&mut timer, wait);
                }
            }
            None => {
                runtime.timer_wake.wait(&mut timer);
            }
        }
    }
}
