//! UDP media-stream step functions.
//!
//! The server side listens for START control messages and answers each new
//! peer with a dedicated connected socket sharing the listen port, so every
//! stream gets its own socket state. The client side connects, lets its
//! pattern send START, and then receives and classifies datagrams.

use std::collections::{HashSet, VecDeque};
use std::io::Read;
use std::net::{SocketAddr, UdpSocket};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use socket2::{Domain, Protocol as SocketProtocol, Socket, Type};

use engine::accept::{AcceptSink, AcceptedConnection};
use engine::config::Settings;
use engine::error::{code, code_from_io};
use engine::media_stream::{MAX_DATAGRAM_BYTES, START_MESSAGE};
use engine::pattern::{IoCompletion, IoStatus};
use engine::socket::{SocketState, StepFn};
use engine::task::TaskAction;

use super::tcp::spawn_driver;

/// Poll cadence for the nonblocking START listener.
const LISTEN_POLL: Duration = Duration::from_millis(50);

/// Cap on waiting for the next datagram of an in-flight stream.
const RECV_TIMEOUT: Duration = Duration::from_secs(10);

struct UdpAcceptInner {
    ready: VecDeque<Result<AcceptedConnection, u32>>,
    waiting: VecDeque<Weak<dyn AcceptSink>>,
    /// Peers already answered; retransmitted STARTs are dropped.
    known_peers: HashSet<SocketAddr>,
    shutting_down: bool,
}

/// Listens for START messages and hands out per-peer connected sockets.
pub struct UdpAcceptor {
    inner: Mutex<UdpAcceptInner>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
    local_addresses: Vec<SocketAddr>,
}

impl UdpAcceptor {
    pub fn start(settings: &Settings) -> std::io::Result<Arc<Self>> {
        assert!(
            !settings.listen_addresses.is_empty(),
            "udp acceptor started with no listen addresses"
        );

        let mut listeners = Vec::with_capacity(settings.listen_addresses.len());
        let mut local_addresses = Vec::with_capacity(settings.listen_addresses.len());
        for &address in &settings.listen_addresses {
            let listener: UdpSocket = bind_shared(address)?.into();
            listener.set_nonblocking(true)?;
            let local = listener.local_addr()?;
            tracing::info!(address = %local, "listening for media streams");
            local_addresses.push(local);
            listeners.push(listener);
        }

        let acceptor = Arc::new(Self {
            inner: Mutex::new(UdpAcceptInner {
                ready: VecDeque::new(),
                waiting: VecDeque::new(),
                known_peers: HashSet::new(),
                shutting_down: false,
            }),
            listeners: Mutex::new(Vec::new()),
            local_addresses,
        });

        let mut handles = Vec::with_capacity(listeners.len());
        for (index, listener) in listeners.into_iter().enumerate() {
            let local = listener.local_addr()?;
            let acceptor_for_thread = Arc::clone(&acceptor);
            let handle = std::thread::Builder::new()
                .name(format!("udp-acceptor-{index}"))
                .spawn(move || acceptor_for_thread.listen_loop(listener, local))?;
            handles.push(handle);
        }
        *acceptor.listeners.lock() = handles;

        Ok(acceptor)
    }

    /// The bound listener addresses, with ephemeral ports resolved.
    pub fn local_addresses(&self) -> &[SocketAddr] {
        &self.local_addresses
    }

    /// Request the next started stream, queued or future.
    pub fn request(&self, consumer: Weak<dyn AcceptSink>) {
        let handoff = {
            let mut inner = self.inner.lock();
            if inner.shutting_down {
                Some(Err(code::CONNECTION_ABORTED))
            } else if let Some(result) = inner.ready.pop_front() {
                Some(result)
            } else {
                inner.waiting.push_back(consumer.clone());
                None
            }
        };

        if let Some(result) = handoff
            && let Some(sink) = consumer.upgrade()
        {
            sink.deliver(result);
        }
    }

    pub fn shutdown(&self) {
        let waiting = {
            let mut inner = self.inner.lock();
            inner.shutting_down = true;
            inner.ready.clear();
            std::mem::take(&mut inner.waiting)
        };
        for consumer in waiting {
            if let Some(sink) = consumer.upgrade() {
                sink.deliver(Err(code::CONNECTION_ABORTED));
            }
        }
        let handles = std::mem::take(&mut *self.listeners.lock());
        for handle in handles {
            let _ = handle.join();
        }
    }

    fn listen_loop(self: Arc<Self>, listener: UdpSocket, local: SocketAddr) {
        let mut buffer = [0u8; 64];
        loop {
            if self.inner.lock().shutting_down {
                return;
            }
            match listener.recv_from(&mut buffer) {
                Ok((len, peer)) => {
                    if &buffer[..len] != START_MESSAGE {
                        tracing::debug!(%peer, len, "ignoring non-START datagram on the listener");
                        continue;
                    }
                    self.on_start(local, peer);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(LISTEN_POLL);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "listener recv failed");
                    std::thread::sleep(LISTEN_POLL);
                }
            }
        }
    }

    /// A new stream request: connect a dedicated socket to the peer and
    /// classify it like an accepted connection.
    fn on_start(&self, local: SocketAddr, peer: SocketAddr) {
        {
            let inner = self.inner.lock();
            if inner.known_peers.contains(&peer) {
                return;
            }
        }

        let result = connect_peer_socket(local, peer).map_err(|e| {
            tracing::warn!(%peer, error = %e, "failed to build a per-peer socket");
            code_from_io(&e)
        });

        let sink = {
            let mut inner = self.inner.lock();
            if inner.shutting_down {
                return;
            }
            inner.known_peers.insert(peer);
            loop {
                match inner.waiting.pop_front() {
                    Some(consumer) => {
                        if let Some(sink) = consumer.upgrade() {
                            break Some(sink);
                        }
                    }
                    None => {
                        inner.ready.push_back(result);
                        return;
                    }
                }
            }
        };

        if let Some(sink) = sink {
            sink.deliver(result);
        }
    }
}

/// Client create step: a bound datagram socket aimed at the next target.
pub fn create(settings: Arc<Settings>) -> StepFn {
    Arc::new(move |weak| {
        let Some(state) = weak.upgrade() else { return };
        let target = settings.target_addresses[0];

        let built = (|| -> std::io::Result<Socket> {
            let domain = if target.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
            let socket = Socket::new(domain, Type::DGRAM, Some(SocketProtocol::UDP))?;
            let any: SocketAddr = if target.is_ipv4() {
                "0.0.0.0:0".parse().expect("static address")
            } else {
                "[::]:0".parse().expect("static address")
            };
            socket.bind(&any.into())?;
            Ok(socket)
        })();

        match built {
            Ok(socket) => {
                state.set_target_address(target);
                state.set_socket(socket);
                state.complete_state(code::OK);
            }
            Err(e) => {
                tracing::debug!(error = %e, "udp socket creation failed");
                state.complete_state(code_from_io(&e));
            }
        }
    })
}

/// Client connect step: associate the socket with its target.
pub fn connect() -> StepFn {
    Arc::new(move |weak| {
        let Some(state) = weak.upgrade() else { return };
        let (Some(socket), Some(target)) = (state.socket_clone(), state.target_address()) else {
            state.complete_state(code::CONNECTION_ABORTED);
            return;
        };
        match socket.connect(&target.into()) {
            Ok(()) => {
                if let Ok(local) = socket.local_addr()
                    && let Some(local) = local.as_socket()
                {
                    state.set_local_address(local);
                }
                state.complete_state(code::OK);
            }
            Err(e) => state.complete_state(code_from_io(&e)),
        }
    })
}

/// IO step for either side: drive the datagram pattern loop on its own
/// thread.
pub fn io() -> StepFn {
    Arc::new(move |weak| {
        let Some(state) = weak.upgrade() else { return };
        spawn_driver("udp-io", move || {
            let code = drive_datagrams(&state);
            state.complete_state(code);
        });
    })
}

fn drive_datagrams(state: &Arc<SocketState>) -> u32 {
    let Some(pattern) = state.io_pattern() else {
        return code::CONNECTION_ABORTED;
    };
    let Some(socket) = state.socket_clone() else {
        return code::CONNECTION_ABORTED;
    };
    if let Err(e) = socket.set_read_timeout(Some(RECV_TIMEOUT)) {
        return code_from_io(&e);
    }

    let mut scratch = vec![0u8; MAX_DATAGRAM_BYTES];
    loop {
        let task = pattern.initiate_io();
        let status = match task.action {
            TaskAction::None => {
                if pattern.is_complete() {
                    return pattern.last_error();
                }
                std::thread::sleep(LISTEN_POLL);
                continue;
            }
            TaskAction::Send => {
                if task.time_offset_ms > 0 {
                    std::thread::sleep(Duration::from_millis(task.time_offset_ms));
                }
                match socket.send(task.payload()) {
                    Ok(n) => {
                        pattern.complete_io(&task, IoCompletion::Sent { bytes: n }, code::OK)
                    }
                    Err(e) => {
                        pattern.complete_io(&task, IoCompletion::Sent { bytes: 0 }, code_from_io(&e))
                    }
                }
            }
            TaskAction::Recv => {
                // One read returns one datagram on a connected socket. The
                // read is capped at the task's length so the transfer
                // accounting never sees more bytes than were requested.
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
            // Streams have no TCP shutdown handshake.
            TaskAction::GracefulShutdown | TaskAction::HardShutdown => {
                pattern.complete_io(&task, IoCompletion::Shutdown, code::OK)
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

/// Bind a datagram socket with address and port sharing enabled, so the
/// listener and its per-peer sockets can coexist on the listen port.
fn bind_shared(address: SocketAddr) -> std::io::Result<Socket> {
    let domain = if address.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::DGRAM, Some(SocketProtocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.bind(&address.into())?;
    Ok(socket)
}

fn connect_peer_socket(local: SocketAddr, peer: SocketAddr) -> std::io::Result<AcceptedConnection> {
    let socket = bind_shared(local)?;
    socket.connect(&peer.into())?;
    Ok(AcceptedConnection {
        socket,
        local_address: local,
        remote_address: peer,
    })
}
