// Copyright 2024 Cobalt Network Foundation
// This file is part of the cobalt library.

// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at:

// http://www.apache.org/licenses/LICENSE-2.0

// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The peer-to-peer gateway of a Cobalt node.
//!
//! The gateway maintains a bounded mesh of authenticated peer connections
//! and multiplexes application-level RPCs over them. Higher-level modules
//! (consensus, transaction pool, wallet) register RPC handlers with it and
//! call peers through it; the node-discovery subsystem feeds it addresses
//! and persists its node set and blocklist through the [`Store`] hooks.

#![forbid(unsafe_code)]

pub mod address;
pub mod bandwidth;
mod barrier;
pub mod codec;
mod config;
mod errors;
mod handshake;
mod nodes;
mod peers;
mod rpc;
mod store;

pub use address::NetAddress;
pub use bandwidth::{BandwidthMonitor, Limits, RateLimit};
pub use config::*;
pub use errors::{Error, Result};
pub use nodes::Node;
pub use peers::PeerInfo;
pub use rpc::PeerConn;
pub use store::{MemoryStore, Store};

use std::{
    collections::HashSet,
    io,
    net::SocketAddr,
    ops::Deref,
    sync::{
        atomic::{AtomicUsize, Ordering::SeqCst},
        Arc,
    },
};

use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use semver::Version;
use tokio::net::{TcpListener, TcpStream};
use tracing::*;

use crate::{
    barrier::ShutdownBarrier,
    handshake::{GatewayId, SessionHeader},
    peers::Peer,
    rpc::RpcFunc,
};

// A sequential numeric identifier assigned to gateways that were not
// provided with a name.
static SEQUENTIAL_GATEWAY_ID: AtomicUsize = AtomicUsize::new(0);

/// Produces transport connections for outbound dials. The default
/// implementation is plain TCP; tests and onion-routed deployments inject
/// their own.
#[async_trait]
pub trait Dial: Send + Sync + 'static {
    async fn dial(&self, addr: &NetAddress) -> io::Result<TcpStream>;
}

/// The default dialer: a TCP connection to a literal IP address.
pub struct TcpDialer;

#[async_trait]
impl Dial for TcpDialer {
    async fn dial(&self, addr: &NetAddress) -> io::Result<TcpStream> {
        let socket_addr =
            addr.to_socket_addr().map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        TcpStream::connect(socket_addr).await
    }
}

/// Everything guarded by the gateway's one readers-writer lock: the peer
/// table, the node table, the blocklist, and the advertised address. The
/// lock is never held across I/O.
pub(crate) struct State {
    pub(crate) my_addr: NetAddress,
    pub(crate) peers: IndexMap<NetAddress, Peer>,
    pub(crate) nodes: IndexMap<NetAddress, Node>,
    pub(crate) blocklist: HashSet<String>,
}

/// The central object responsible for peer connections.
#[derive(Clone)]
pub struct Gateway(Arc<InnerGateway>);

impl Deref for Gateway {
    type Target = Arc<InnerGateway>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[doc(hidden)]
pub struct InnerGateway {
    /// The tracing span.
    pub(crate) span: Span,
    /// The gateway's configuration.
    pub(crate) config: Config,
    /// The socket address the listener is bound to.
    listening_addr: SocketAddr,
    /// The random per-process identifier, used to detect self-connections.
    pub(crate) unique_id: GatewayId,
    /// The parsed version floor applied to remote peers.
    pub(crate) minimum_version: Version,
    /// The lock-guarded tables.
    pub(crate) state: RwLock<State>,
    /// Addresses with a dial in flight, so concurrent dials cannot race.
    pub(crate) connecting: Mutex<HashSet<NetAddress>>,
    /// The registered RPC handlers.
    pub(crate) rpcs: RwLock<IndexMap<String, RpcFunc>>,
    /// The RPCs replayed against every new outbound peer.
    pub(crate) init_rpcs: RwLock<IndexMap<String, RpcFunc>>,
    /// The injected rate limits and bandwidth monitor.
    pub(crate) limits: Limits,
    /// The injected persistence hooks.
    pub(crate) store: Arc<dyn Store>,
    /// The injected dialer.
    pub(crate) dialer: Arc<dyn Dial>,
    /// The shutdown barrier every spawned task registers with.
    pub(crate) barrier: ShutdownBarrier,
}

impl Gateway {
    /// Creates a new [`Gateway`]: binds the listener and spawns the
    /// listener loop.
    pub async fn new(config: Config, store: Arc<dyn Store>, limits: Limits) -> Result<Self> {
        Self::with_dialer(config, store, limits, Arc::new(TcpDialer)).await
    }

    /// As [`Gateway::new`], with a custom [`Dial`] implementation.
    pub async fn with_dialer(
        mut config: Config,
        store: Arc<dyn Store>,
        limits: Limits,
        dialer: Arc<dyn Dial>,
    ) -> Result<Self> {
        // If there is no pre-configured name, assign a sequential numeric
        // identifier.
        if config.name.is_none() {
            config.name = Some(SEQUENTIAL_GATEWAY_ID.fetch_add(1, SeqCst).to_string());
        }
        let span = create_span(config.name.as_deref().unwrap());

        let minimum_version = Version::parse(&config.minimum_acceptable_peer_version)
            .map_err(|_| Error::InvalidVersion(config.minimum_acceptable_peer_version.clone()))?;

        // Procure the listening socket.
        let listener = match config.desired_listening_port {
            Some(port) => {
                let desired_listening_addr = SocketAddr::new(config.listener_ip, port);
                match TcpListener::bind(desired_listening_addr).await {
                    Ok(listener) => listener,
                    Err(e) if config.allow_random_port => {
                        warn!(parent: &span, "trying any port, the desired one is unavailable: {e}");
                        let random_available_addr = SocketAddr::new(config.listener_ip, 0);
                        TcpListener::bind(random_available_addr)
                            .await
                            .map_err(Error::io("failed to bind the listener"))?
                    }
                    Err(e) => {
                        error!(parent: &span, "the desired port is unavailable: {e}");
                        return Err(Error::Io("failed to bind the listener", e));
                    }
                }
            }
            None => TcpListener::bind(SocketAddr::new(config.listener_ip, 0))
                .await
                .map_err(Error::io("failed to bind the listener"))?,
        };
        let listening_addr = listener.local_addr().map_err(Error::io("failed to read the listener address"))?;
        let my_addr = NetAddress::from(SocketAddr::new(config.listener_ip, listening_addr.port()));

        let gateway = Gateway(Arc::new(InnerGateway {
            span,
            config,
            listening_addr,
            unique_id: rand::random(),
            minimum_version,
            state: RwLock::new(State {
                my_addr,
                peers: IndexMap::new(),
                nodes: IndexMap::new(),
                blocklist: HashSet::new(),
            }),
            connecting: Default::default(),
            rpcs: Default::default(),
            init_rpcs: Default::default(),
            limits,
            store,
            dialer,
            barrier: ShutdownBarrier::new(),
        }));

        // The barrier is fresh, so registration cannot fail.
        let guard = gateway.barrier.register().expect("registered on a fresh barrier");
        tokio::spawn(gateway.clone().listener_loop(listener, guard));

        debug!(parent: gateway.span(), "gateway listening on {}", gateway.listening_addr);
        Ok(gateway)
    }

    /// Returns the name assigned to the gateway.
    #[inline]
    pub fn name(&self) -> &str {
        // Safe; can be set as None in Config, but receives a default value
        // on gateway creation.
        self.config.name.as_deref().unwrap()
    }

    /// Returns a reference to the gateway's config.
    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the tracing [`Span`] associated with the gateway.
    #[inline]
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Returns the socket address the listener is bound to.
    pub fn listening_addr(&self) -> SocketAddr {
        self.listening_addr
    }

    /// Returns the gateway's advertised listening address.
    pub fn address(&self) -> NetAddress {
        self.state.read().my_addr.clone()
    }

    /// Returns the total `(received, sent)` byte counts observed by the
    /// bandwidth monitor.
    pub fn bandwidth(&self) -> (u64, u64) {
        self.limits.monitor.totals()
    }

    /// The session header this gateway presents during handshakes.
    pub(crate) fn our_header(&self) -> SessionHeader {
        SessionHeader {
            genesis_id: self.config.genesis_id,
            unique_id: self.unique_id,
            net_address: self.state.read().my_addr.clone(),
        }
    }

    /// Gracefully shuts the gateway down: no new work is admitted, every
    /// spawned task is waited for, and every session is closed.
    pub async fn close(&self) {
        debug!(parent: &self.span, "shutting down");
        self.barrier.stop().await;

        // Peer tasks remove their own entries on the way out; sessions whose
        // task never got to run are swept here.
        let leftover: Vec<Peer> = {
            let mut state = self.state.write();
            state.peers.drain(..).map(|(_, peer)| peer).collect()
        };
        for peer in leftover {
            peer.sess.close();
        }
        debug!(parent: &self.span, "shutdown complete");
    }
}

/// Creates the gateway's tracing span based on its name.
fn create_span(gateway_name: &str) -> Span {
    let mut span = trace_span!("gateway", name = gateway_name);
    if !span.is_disabled() {
        return span;
    } else {
        span = debug_span!("gateway", name = gateway_name);
    }
    if !span.is_disabled() {
        return span;
    } else {
        span = info_span!("gateway", name = gateway_name);
    }
    if !span.is_disabled() {
        return span;
    } else {
        span = warn_span!("gateway", name = gateway_name);
    }
    if !span.is_disabled() {
        span
    } else {
        error_span!("gateway", name = gateway_name)
    }
}
