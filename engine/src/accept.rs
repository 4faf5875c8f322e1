//! Server-side accept pool.
//!
//! One listener per configured listen address, each drained by an acceptor
//! thread that keeps up to `pending_accepts` connections queued ahead of
//! demand. An accepted connection is classified exactly once: if a consumer
//! is waiting it is handed off directly and the listener re-arms; otherwise
//! it parks in the ready queue and the listener pauses until a consumer
//! drains it.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use socket2::{Domain, Protocol as SocketProtocol, Socket, Type};

use crate::config::Settings;
use crate::error::{code, code_from_io};
use crate::socket::SocketState;

/// Accepts kept queued ahead of consumer demand, per engine.
pub const PENDING_ACCEPTS: usize = 100;

/// Poll cadence for the nonblocking accept loop.
const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// An accepted connection with its resolved addresses.
pub struct AcceptedConnection {
    pub socket: Socket,
    pub local_address: SocketAddr,
    pub remote_address: SocketAddr,
}

/// A consumer of accepted connections.
///
/// The engine holds consumers weakly; a consumer that disappears before a
/// connection arrives is skipped.
pub trait AcceptSink: Send + Sync {
    fn deliver(self: Arc<Self>, result: Result<AcceptedConnection, u32>);
}

impl AcceptSink for SocketState {
    fn deliver(self: Arc<Self>, result: Result<AcceptedConnection, u32>) {
        match result {
            Ok(connection) => {
                self.set_local_address(connection.local_address);
                self.set_target_address(connection.remote_address);
                self.set_socket(connection.socket);
                self.complete_state(code::OK);
            }
            Err(error_code) => self.complete_state(error_code),
        }
    }
}

struct AcceptInner {
    ready: VecDeque<Result<AcceptedConnection, u32>>,
    waiting: VecDeque<Weak<dyn AcceptSink>>,
    shutting_down: bool,
}

/// Pool of pre-armed accepts across every listen address.
pub struct AcceptEngine {
    inner: Mutex<AcceptInner>,
    /// Wakes paused acceptor threads when the ready queue drains.
    resume: Condvar,
    pending_accepts: usize,
    acceptors: Mutex<Vec<JoinHandle<()>>>,
    local_addresses: Vec<SocketAddr>,
}

impl AcceptEngine {
    /// Bind and listen on every configured address and start one acceptor
    /// thread per listener.
    pub fn start(settings: &Settings) -> io::Result<Arc<Self>> {
        assert!(
            !settings.listen_addresses.is_empty(),
            "accept engine started with no listen addresses"
        );

        let mut listeners = Vec::with_capacity(settings.listen_addresses.len());
        let mut local_addresses = Vec::with_capacity(settings.listen_addresses.len());
        for &address in &settings.listen_addresses {
            let listener = bind_listener(address)?;
            let local = listener
                .local_addr()?
                .as_socket()
                .expect("listener has an inet address");
            tracing::info!(address = %local, "listening");
            local_addresses.push(local);
            listeners.push(listener);
        }

        let engine = Arc::new(Self {
            inner: Mutex::new(AcceptInner {
                ready: VecDeque::new(),
                waiting: VecDeque::new(),
                shutting_down: false,
            }),
            resume: Condvar::new(),
            pending_accepts: PENDING_ACCEPTS,
            acceptors: Mutex::new(Vec::new()),
            local_addresses,
        });

        let mut handles = Vec::with_capacity(listeners.len());
        for (index, listener) in listeners.into_iter().enumerate() {
            let engine_for_thread = Arc::clone(&engine);
            let handle = std::thread::Builder::new()
                .name(format!("acceptor-{index}"))
                .spawn(move || engine_for_thread.acceptor_loop(listener))?;
            handles.push(handle);
        }
        *engine.acceptors.lock() = handles;

        Ok(engine)
    }

    /// The bound listener addresses, with ephemeral ports resolved.
    pub fn local_addresses(&self) -> &[SocketAddr] {
        &self.local_addresses
    }

    /// Request an accepted connection: a queued one is delivered
    /// synchronously, otherwise the consumer waits for the next accept.
    pub fn request(&self, consumer: Weak<dyn AcceptSink>) {
        let handoff = {
            let mut inner = self.inner.lock();
            if inner.shutting_down {
                Some(Err(code::CONNECTION_ABORTED))
            } else if let Some(result) = inner.ready.pop_front() {
                // Draining the queue lets a paused listener re-arm.
                self.resume.notify_all();
                Some(result)
            } else {
                inner.waiting.push_back(consumer.clone());
                None
            }
        };

        if let Some(result) = handoff {
            match consumer.upgrade() {
                Some(sink) => sink.deliver(result),
                None => self.requeue(result),
            }
        }
    }

    /// Fail waiting consumers and drop queued connections.
    pub fn shutdown(&self) {
        let waiting = {
            let mut inner = self.inner.lock();
            inner.shutting_down = true;
            inner.ready.clear();
            self.resume.notify_all();
            std::mem::take(&mut inner.waiting)
        };

        for consumer in waiting {
            if let Some(sink) = consumer.upgrade() {
                sink.deliver(Err(code::CONNECTION_ABORTED));
            }
        }

        let handles = std::mem::take(&mut *self.acceptors.lock());
        for handle in handles {
            let _ = handle.join();
        }
    }

    fn acceptor_loop(self: Arc<Self>, listener: Socket) {
        loop {
            // Pause instead of re-arming while a full backlog waits.
            {
                let mut inner = self.inner.lock();
                while inner.ready.len() >= self.pending_accepts && !inner.shutting_down {
                    self.resume.wait(&mut inner);
                }
                if inner.shutting_down {
                    return;
                }
            }

            match listener.accept() {
                Ok((socket, remote)) => {
                    let result = resolve_accepted(socket, &remote);
                    self.dispatch(result);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(ACCEPT_POLL);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    self.dispatch(Err(code_from_io(&e)));
                }
            }
        }
    }

    /// Classify one accept result: hand off to a waiting consumer or park
    /// it in the ready queue.
    fn dispatch(&self, result: Result<AcceptedConnection, u32>) {
        let sink = {
            let mut inner = self.inner.lock();
            if inner.shutting_down {
                return;
            }
            loop {
                match inner.waiting.pop_front() {
                    Some(consumer) => {
                        if let Some(sink) = consumer.upgrade() {
                            break Some(sink);
                        }
                        // Stale consumer; try the next one.
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

    /// Return a connection whose consumer vanished between dequeue and
    /// delivery.
    fn requeue(&self, result: Result<AcceptedConnection, u32>) {
        let mut inner = self.inner.lock();
        if !inner.shutting_down {
            inner.ready.push_front(result);
        }
    }
}

fn bind_listener(address: SocketAddr) -> io::Result<Socket> {
    let domain = if address.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::STREAM, Some(SocketProtocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&address.into())?;
    socket.listen(1024)?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// Fill in the accepted socket's addresses and restore blocking mode (the
/// accepted handle inherits nonblocking from the listener on some
/// platforms).
fn resolve_accepted(
    socket: Socket,
    remote: &socket2::SockAddr,
) -> Result<AcceptedConnection, u32> {
    let remote_address = match remote.as_socket() {
        Some(addr) => addr,
        None => return Err(code::CONNECTION_ABORTED),
    };
    let local_address = socket
        .local_addr()
        .ok()
        .and_then(|a| a.as_socket())
        .ok_or(code::CONNECTION_ABORTED)?;
    if let Err(e) = socket.set_nonblocking(false) {
        return Err(code_from_io(&e));
    }
    Ok(AcceptedConnection { socket, local_address, remote_address })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpStream;
    use std::sync::mpsc;

    struct ChannelSink {
        sender: Mutex<mpsc::Sender<Result<(SocketAddr, SocketAddr), u32>>>,
    }

    impl AcceptSink for ChannelSink {
        fn deliver(self: Arc<Self>, result: Result<AcceptedConnection, u32>) {
            let summary = result.map(|c| (c.local_address, c.remote_address));
            let _ = self.sender.lock().send(summary);
        }
    }

    fn test_engine() -> (Arc<AcceptEngine>, SocketAddr) {
        let settings = Settings {
            role: crate::config::Role::Listen,
            listen_addresses: vec!["127.0.0.1:0".parse().unwrap()],
            ..Settings::default()
        };
        let engine = AcceptEngine::start(&settings).unwrap();
        let address = engine.local_addresses()[0];
        (engine, address)
    }

    fn channel_sink() -> (Arc<ChannelSink>, mpsc::Receiver<Result<(SocketAddr, SocketAddr), u32>>) {
        let (sender, receiver) = mpsc::channel();
        (Arc::new(ChannelSink { sender: Mutex::new(sender) }), receiver)
    }

    #[test]
    fn request_then_accept_hands_off() {
        let (engine, address) = test_engine();
        let (sink, receiver) = channel_sink();

        let sink_dyn: Arc<dyn AcceptSink> = sink.clone();
        let weak: Weak<dyn AcceptSink> = Arc::downgrade(&sink_dyn);
        engine.request(weak);

        let client = TcpStream::connect(address).unwrap();
        let delivered = receiver
            .recv_timeout(Duration::from_secs(5))
            .unwrap()
            .unwrap();
        assert_eq!(delivered.0, address);
        assert_eq!(delivered.1, client.local_addr().unwrap());

        engine.shutdown();
    }

    #[test]
    fn accept_then_request_pops_synchronously() {
        let (engine, address) = test_engine();
        let _client = TcpStream::connect(address).unwrap();

        // Wait for the acceptor to queue the connection.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while engine.inner.lock().ready.is_empty() {
            assert!(std::time::Instant::now() < deadline, "accept never arrived");
            std::thread::sleep(Duration::from_millis(10));
        }

        let (sink, receiver) = channel_sink();
        let sink_dyn: Arc<dyn AcceptSink> = sink.clone();
        let weak: Weak<dyn AcceptSink> = Arc::downgrade(&sink_dyn);
        engine.request(weak);
        let delivered = receiver
            .recv_timeout(Duration::from_secs(1))
            .unwrap()
            .unwrap();
        assert_eq!(delivered.0, address);

        engine.shutdown();
    }

    #[test]
    fn shutdown_fails_waiting_consumers() {
        let (engine, _address) = test_engine();
        let (sink, receiver) = channel_sink();
        let sink_dyn: Arc<dyn AcceptSink> = sink.clone();
        let weak: Weak<dyn AcceptSink> = Arc::downgrade(&sink_dyn);
        engine.request(weak);

        engine.shutdown();
        let delivered = receiver.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(delivered, Err(code::CONNECTION_ABORTED));
    }
}
