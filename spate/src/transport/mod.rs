//! Socket transport: the concrete step functions the engine drives.
//!
//! Assembles the create/connect/accept/io functions for the configured
//! protocol and role. Every function upholds the engine contract: it
//! eventually calls `complete_state` exactly once on its socket state.

mod tcp;
mod udp;

use std::io;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;

use engine::accept::{AcceptEngine, AcceptSink};
use engine::config::{Protocol, Role, Settings};
use engine::socket::{SocketState, StepFn, StepFunctions};

pub use udp::UdpAcceptor;

/// Owns the server-side acceptors and builds the step functions.
pub struct Transport {
    settings: Arc<Settings>,
    tcp_accept: Option<Arc<AcceptEngine>>,
    udp_accept: Option<Arc<UdpAcceptor>>,
    next_target: Arc<AtomicUsize>,
}

impl Transport {
    /// Bind listeners (server roles) and prepare the transport.
    pub fn start(settings: Arc<Settings>) -> io::Result<Self> {
        let (tcp_accept, udp_accept) = match (settings.protocol, settings.role) {
            (Protocol::Tcp, Role::Listen) => (Some(AcceptEngine::start(&settings)?), None),
            (Protocol::Udp, Role::Listen) => (None, Some(UdpAcceptor::start(&settings)?)),
            _ => (None, None),
        };
        Ok(Self {
            settings,
            tcp_accept,
            udp_accept,
            next_target: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// The step functions the broker injects into every socket state.
    pub fn step_functions(&self) -> Arc<StepFunctions> {
        let hooks = match (self.settings.protocol, self.settings.role) {
            (Protocol::Tcp, Role::Connect) => StepFunctions::client(
                tcp::create(Arc::clone(&self.settings), Arc::clone(&self.next_target)),
                tcp::connect(),
                tcp::io(Arc::clone(&self.settings)),
            ),
            (Protocol::Tcp, Role::Listen) => {
                let engine = Arc::clone(self.tcp_accept.as_ref().expect("tcp accept engine"));
                StepFunctions::server(
                    tcp::create_passive(),
                    request_accept(move |sink| engine.request(sink)),
                    tcp::io(Arc::clone(&self.settings)),
                )
            }
            (Protocol::Udp, Role::Connect) => StepFunctions::client(
                udp::create(Arc::clone(&self.settings)),
                udp::connect(),
                udp::io(),
            ),
            (Protocol::Udp, Role::Listen) => {
                let acceptor = Arc::clone(self.udp_accept.as_ref().expect("udp acceptor"));
                StepFunctions::server(
                    tcp::create_passive(),
                    request_accept(move |sink| acceptor.request(sink)),
                    udp::io(),
                )
            }
        };
        Arc::new(hooks)
    }

    /// The bound listener addresses for server roles, with ephemeral ports
    /// resolved.
    pub fn local_addresses(&self) -> Vec<std::net::SocketAddr> {
        if let Some(engine) = &self.tcp_accept {
            engine.local_addresses().to_vec()
        } else if let Some(acceptor) = &self.udp_accept {
            acceptor.local_addresses().to_vec()
        } else {
            Vec::new()
        }
    }

    /// Stop the acceptors, failing any consumers still waiting.
    pub fn shutdown(&self) {
        if let Some(engine) = &self.tcp_accept {
            engine.shutdown();
        }
        if let Some(acceptor) = &self.udp_accept {
            acceptor.shutdown();
        }
    }
}

/// Wrap an accept-request call as a step function.
fn request_accept(
    request: impl Fn(std::sync::Weak<dyn AcceptSink>) + Send + Sync + 'static,
) -> StepFn {
    Arc::new(move |weak: std::sync::Weak<SocketState>| {
        request(weak);
    })
}
