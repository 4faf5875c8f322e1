//! TCP step functions.
//!
//! Each connection's IO phase runs on its own driver thread: the driver
//! asks the pattern for a task, performs it on the socket, feeds the
//! completion back, and repeats until the pattern reports a terminal
//! status. Rate-limit delays are honored by sleeping before the send is
//! issued.

use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use socket2::{Domain, Protocol as SocketProtocol, Socket, Type};

use engine::config::{PatternKind, Settings};
use engine::error::{code, code_from_io};
use engine::pattern::{IoCompletion, IoDirection, IoStatus};
use engine::socket::{SocketState, StepFn};
use engine::task::TaskAction;

/// Cap on a single blocking connect attempt.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Cap on a single blocking read or write. A server parked in its FIN-wait
/// treats this timeout as a valid session end.
const IO_TIMEOUT: Duration = Duration::from_secs(60);

/// Back-off while the pattern has no task for this loop because another
/// loop's task is still in flight.
const POLL_IDLE: Duration = Duration::from_millis(1);

/// Client create step: build the socket and pick the next target address
/// round-robin.
pub fn create(settings: Arc<Settings>, next_target: Arc<AtomicUsize>) -> StepFn {
    Arc::new(move |weak| {
        let Some(state) = weak.upgrade() else { return };
        let index = next_target.fetch_add(1, Ordering::Relaxed);
        let target = settings.target_addresses[index % settings.target_addresses.len()];

        match new_stream_socket(target) {
            Ok(socket) => {
                state.set_target_address(target);
                state.set_socket(socket);
                state.complete_state(code::OK);
            }
            Err(e) => {
                tracing::debug!(error = %e, "socket creation failed");
                state.complete_state(code_from_io(&e));
            }
        }
    })
}

/// Server create step: the socket arrives later from the accept engine.
pub fn create_passive() -> StepFn {
    Arc::new(move |weak| {
        if let Some(state) = weak.upgrade() {
            state.complete_state(code::OK);
        }
    })
}

/// Client connect step: blocking connect on a short-lived thread.
pub fn connect() -> StepFn {
    Arc::new(move |weak| {
        let Some(state) = weak.upgrade() else { return };
        spawn_driver("connect", move || {
            let (Some(socket), Some(target)) = (state.socket_clone(), state.target_address())
            else {
                state.complete_state(code::CONNECTION_ABORTED);
                return;
            };

            match socket.connect_timeout(&target.into(), CONNECT_TIMEOUT) {
                Ok(()) => {
                    if let Ok(local) = socket.local_addr()
                        && let Some(local) = local.as_socket()
                    {
                        state.set_local_address(local);
                    }
                    state.complete_state(code::OK);
                }
                Err(e) => {
                    tracing::debug!(%target, error = %e, "connect failed");
                    state.complete_state(code_from_io(&e));
                }
            }
        });
    })
}

/// IO step: drive the pattern loop on a dedicated thread. Duplex gets a
/// second loop so one side of the connection is always able to drain.
pub fn io(settings: Arc<Settings>) -> StepFn {
    Arc::new(move |weak| {
        let Some(state) = weak.upgrade() else { return };
        let settings = Arc::clone(&settings);
        spawn_driver("tcp-io", move || {
            let code = if settings.pattern == PatternKind::Duplex {
                drive_duplex(&state, &settings)
            } else {
                drive_stream(&state, &settings, None)
            };
            state.complete_state(code);
        });
    })
}

/// Duplex moves bytes both ways at once, so it gets one loop per
/// direction: the receive loop keeps draining while the send loop blocks
/// in a full-buffer write. A single serial loop here would let both peers
/// block in symmetric sends with nobody reading. The loops share nothing
/// but the pattern, which hands each one only its own half's tasks.
fn drive_duplex(state: &Arc<SocketState>, settings: &Arc<Settings>) -> u32 {
    let recv_state = Arc::clone(state);
    let recv_settings = Arc::clone(settings);
    let recv_loop = std::thread::Builder::new()
        .name("tcp-io-recv".to_string())
        .spawn(move || drive_stream(&recv_state, &recv_settings, Some(IoDirection::Recv)));

    let recv_loop = match recv_loop {
        Ok(handle) => handle,
        // Without a receive loop the symmetric-send hazard is back, so
        // refuse to run the transfer at all.
        Err(e) => {
            tracing::warn!(error = %e, "failed to spawn the duplex receive loop");
            return code::OUT_OF_RESOURCES;
        }
    };

    let send_code = drive_stream(state, settings, Some(IoDirection::Send));
    let recv_code = recv_loop.join().unwrap_or(code::IO_FAILED);
    if send_code != code::OK { send_code } else { recv_code }
}

fn drive_stream(
    state: &Arc<SocketState>,
    settings: &Settings,
    direction: Option<IoDirection>,
) -> u32 {
    let Some(pattern) = state.io_pattern() else {
        return code::CONNECTION_ABORTED;
    };
    let Some(socket) = state.socket_clone() else {
        return code::CONNECTION_ABORTED;
    };
    if let Err(e) = socket.set_read_timeout(Some(IO_TIMEOUT)) {
        return code_from_io(&e);
    }
    if let Err(e) = socket.set_write_timeout(Some(IO_TIMEOUT)) {
        return code_from_io(&e);
    }

    let mut scratch = vec![0u8; settings.max_buffer_size];
    loop {
        let task = match direction {
            Some(direction) => pattern.initiate_io_directed(direction),
            None => pattern.initiate_io(),
        };
        let status = match task.action {
            TaskAction::None => {
                // Terminal, or waiting on a task another loop holds.
                if pattern.is_complete() {
                    return pattern.last_error();
                }
                std::thread::sleep(POLL_IDLE);
                continue;
            }
            TaskAction::Send => {
                if task.time_offset_ms > 0 {
                    std::thread::sleep(Duration::from_millis(task.time_offset_ms));
                }
                match (&socket).write_all(task.payload()) {
                    Ok(()) => pattern.complete_io(
                        &task,
                        IoCompletion::Sent { bytes: task.length() },
                        code::OK,
                    ),
                    Err(e) => {
                        pattern.complete_io(&task, IoCompletion::Sent { bytes: 0 }, code_from_io(&e))
                    }
                }
            }
            TaskAction::Recv => {
                let want = task.length().min(scratch.len());
                match (&socket).read(&mut scratch[..want]) {
                    Ok(n) => pattern.complete_io(
                        &task,
                        IoCompletion::Received { data: &scratch[..n] },
                        code::OK,
                    ),
                    Err(e) => pattern.complete_io(
                        &task,
                        IoCompletion::Received { data: &[] },
                        code_from_io(&e),
                    ),
                }
            }
            TaskAction::GracefulShutdown => {
                let result = socket.shutdown(Shutdown::Write);
                let error = result.err().map(|e| code_from_io(&e)).unwrap_or(code::OK);
                pattern.complete_io(&task, IoCompletion::Shutdown, error)
            }
            TaskAction::HardShutdown => {
                // Linger zero turns the upcoming close into a RST.
                let result = socket.set_linger(Some(Duration::ZERO));
                let error = result.err().map(|e| code_from_io(&e)).unwrap_or(code::OK);
                pattern.complete_io(&task, IoCompletion::Shutdown, error)
            }
        };

        match status {
            IoStatus::ContinueIo => {}
            IoStatus::CompletedIo => return code::OK,
            IoStatus::FailedIo => {
                return match pattern.last_error() {
                    code::OK => code::IO_FAILED,
                    error => error,
                };
            }
        }
    }
}

fn new_stream_socket(target: SocketAddr) -> std::io::Result<Socket> {
    let domain = if target.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::STREAM, Some(SocketProtocol::TCP))?;
    socket.set_nodelay(true)?;
    Ok(socket)
}

pub(crate) fn spawn_driver(name: &str, body: impl FnOnce() + Send + 'static) {
    // Driver threads are detached; the broker observes their outcome
    // through complete_state.
    let _ = std::thread::Builder::new()
        .name(name.to_string())
        .spawn(body);
}
