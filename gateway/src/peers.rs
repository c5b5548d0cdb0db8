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

//! The peer table, the admission policy, and the connection paths feeding
//! them: the listener loop for inbound peers and the dialer for outbound
//! ones.

use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use cobalt_mux::Session;
use rand::seq::SliceRandom;
use tokio::{
    net::{TcpListener, TcpStream},
    time::timeout,
};
use tracing::*;

use crate::{
    bandwidth::{Monitored, RateLimit},
    barrier::BarrierGuard,
    errors::compose,
    handshake::{
        accept_version_handshake,
        connect_version_handshake,
        exchange_our_header,
        exchange_remote_header,
    },
    Error,
    Gateway,
    NetAddress,
    Result,
    State,
};

/// The public snapshot of a connected peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerInfo {
    /// The address the peer is tabled under. For inbound peers this is the
    /// reconstructed remote address: the socket IP combined with the
    /// advertised listening port.
    pub net_address: NetAddress,
    /// The protocol version the peer advertised.
    pub version: String,
    /// Whether the peer was produced by the listener.
    pub inbound: bool,
    /// Whether the peer's address is a local one.
    ///
    /// Local may be true even if the advertised address is not actually
    /// reachable.
    pub local: bool,
}

/// A connected peer: its identity, its session, and its rate-limit hook.
/// The peer table is the sole owner; removing the entry implies closing the
/// session.
pub(crate) struct Peer {
    pub info: PeerInfo,
    pub sess: Arc<Session>,
    pub rl: Arc<RateLimit>,
}

/// Releases the claim on an address being connected to.
struct ConnectingGuard<'a> {
    gateway: &'a Gateway,
    addr: NetAddress,
}

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        self.gateway.connecting.lock().remove(&self.addr);
    }
}

impl Gateway {
    /// Returns the peers currently connected to the gateway.
    pub fn peers(&self) -> Vec<PeerInfo> {
        self.state.read().peers.values().map(|peer| peer.info.clone()).collect()
    }

    /// Returns the number of peers currently connected to the gateway.
    pub fn num_peers(&self) -> usize {
        self.state.read().peers.len()
    }

    /// Returns `true` if the gateway is connected to the wider internet,
    /// i.e. maintains at least one non-local peer. A development gateway
    /// always reports itself online.
    pub fn online(&self) -> bool {
        self.config.is_dev || self.state.read().peers.values().any(|peer| !peer.info.local)
    }

    /// Returns the hosts currently barred from peering.
    pub fn blocklist(&self) -> Vec<String> {
        self.state.read().blocklist_snapshot()
    }

    /// Establishes a persistent connection to a peer and adds it to the
    /// peer table.
    pub async fn connect(&self, addr: NetAddress) -> Result<()> {
        let _guard = self.barrier.register()?;
        self.managed_connect(addr).await
    }

    /// Terminates the connection to a peer and removes it from the peer
    /// table.
    pub async fn disconnect(&self, addr: NetAddress) -> Result<()> {
        let _guard = self.barrier.register()?;

        let sess = self
            .state
            .read()
            .peers
            .get(&addr)
            .map(|peer| peer.sess.clone())
            .ok_or(Error::NotConnected)?;

        sess.close();
        {
            // The node entry goes too, so the address is not immediately
            // re-dialed while the node finder looks for a replacement.
            let mut state = self.state.write();
            state.peers.shift_remove(&addr);
            state.remove_node(&addr);
        }

        info!(parent: &self.span, "disconnected from peer {addr}");
        Ok(())
    }

    /// Connects to a peer at the user's explicit request, first clearing its
    /// host from the blocklist.
    pub async fn connect_manual(&self, addr: NetAddress) -> Result<()> {
        debug!(parent: &self.span, "attempting to manually connect to {addr}");

        let unblock_err = {
            let mut state = self.state.write();
            if state.blocklist.remove(addr.host()) {
                let (nodes, hosts) = (state.nodes_snapshot(), state.blocklist_snapshot());
                self.store.save_sync(&nodes, &hosts).err().map(|e| Error::Io("failed to save the blocklist", e))
            } else {
                None
            }
        };

        match compose(unblock_err, self.connect(addr).await.err()) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Disconnects from a peer at the user's explicit request and bars its
    /// host from peering until [`Gateway::connect_manual`] clears it.
    pub async fn disconnect_manual(&self, addr: NetAddress) -> Result<()> {
        debug!(parent: &self.span, "attempting to manually disconnect from {addr}");
        self.disconnect(addr.clone()).await?;

        // The user asked for a durable change; failing to persist it is an
        // error even though the disconnect already happened.
        let mut state = self.state.write();
        state.blocklist.insert(addr.host().to_string());
        let (nodes, hosts) = (state.nodes_snapshot(), state.blocklist_snapshot());
        self.store.save_sync(&nodes, &hosts).map_err(Error::io("failed to save the blocklist"))
    }

    async fn managed_connect(&self, addr: NetAddress) -> Result<()> {
        debug!(parent: &self.span, "attempting to connect to {addr}");

        // Validate the dial target against a snapshot of the gateway state.
        if addr == self.state.read().my_addr {
            return Err(Error::OurAddress);
        }
        addr.is_std_valid()?;
        if addr.host().parse::<IpAddr>().is_err() {
            return Err(Error::InvalidAddress(format!("the host of {addr} must be a literal IP")));
        }
        {
            let state = self.state.read();
            if state.blocklist.contains(addr.host()) {
                return Err(Error::Blocklisted);
            }
            if state.peers.contains_key(&addr) {
                return Err(Error::PeerExists);
            }
        }

        // Claim the address, so concurrent dials cannot both proceed.
        if !self.connecting.lock().insert(addr.clone()) {
            return Err(Error::PeerExists);
        }
        let _connecting = ConnectingGuard { gateway: self, addr: addr.clone() };

        let (sess, remote_version) = self.dial_and_handshake(&addr).await?;

        {
            let mut state = self.state.write();
            // An inbound handshake for the same address may have won the race.
            if state.peers.contains_key(&addr) {
                sess.close();
                return Err(Error::PeerExists);
            }
            self.add_peer(&mut state, Peer {
                info: PeerInfo {
                    net_address: addr.clone(),
                    version: remote_version.clone(),
                    inbound: false,
                    local: addr.is_local(),
                },
                sess,
                rl: self.limits.gateway.clone(),
            });
            state.add_node(addr.clone());
            if let Some(node) = state.nodes.get_mut(&addr) {
                node.was_outbound_peer = true;
            }
            if let Err(e) = self.store.save_sync_nodes(&state.nodes_snapshot()) {
                error!(parent: &self.span, "unable to save the new outbound peer: {e}");
            }
        }

        debug!(parent: &self.span, "connected to new peer {addr} (v{remote_version})");
        self.call_init_rpcs(addr);
        Ok(())
    }

    /// Dials the address and drives the initiator side of the handshake,
    /// all under the connection deadline. The deadline only covers the
    /// handshake; the returned session outlives it.
    async fn dial_and_handshake(&self, addr: &NetAddress) -> Result<(Arc<Session>, String)> {
        let dial = async {
            let stream = timeout(self.config.dial_timeout, self.dialer.dial(addr))
                .await
                .map_err(|_| Error::Timeout)?
                .map_err(Error::io("failed to dial"))?;
            let mut conn = Monitored::new(stream, self.limits.monitor.clone());

            let handshake = async {
                let remote_version =
                    connect_version_handshake(&mut conn, &self.config.protocol_version, &self.minimum_version)
                        .await?;

                // Header exchange: the initiator writes its header first.
                let ours = self.our_header();
                exchange_our_header(&mut conn, &ours).await?;
                exchange_remote_header(&mut conn, &ours).await?;

                Ok::<_, Error>(remote_version)
            };
            let remote_version =
                timeout(self.config.conn_std_deadline, handshake).await.map_err(|_| Error::Timeout)??;

            Ok((Arc::new(Session::client(conn, &remote_version)), remote_version))
        };

        let stop = self.barrier.stop_signal();
        tokio::select! {
            _ = stop.cancelled() => Err(Error::Stopped),
            result = dial => result,
        }
    }

    /// The listener loop: accepts inbound connections and hands each to the
    /// admission pipeline, pausing between accepts so a flood of newcomers
    /// cannot displace the existing mesh all at once.
    pub(crate) async fn listener_loop(self, listener: TcpListener, _guard: BarrierGuard) {
        let stop = self.barrier.stop_signal();
        loop {
            let (stream, socket_addr) = tokio::select! {
                _ = stop.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!(parent: &self.span, "couldn't accept a connection: {e}");
                        continue;
                    }
                },
            };

            debug!(parent: &self.span, "{socket_addr} wants to connect");
            let gateway = self.clone();
            tokio::spawn(async move { gateway.handle_inbound_conn(stream, socket_addr).await });

            // Sleep after each accept, so existing peers get a chance to
            // gossip before newcomers can kick them out.
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(self.config.accept_interval) => {}
            }
        }
        trace!(parent: &self.span, "closing the listener");
    }

    async fn handle_inbound_conn(self, stream: TcpStream, socket_addr: SocketAddr) {
        let Ok(_guard) = self.barrier.register() else {
            return;
        };

        // The blocklist is keyed by host and consulted before any bytes are
        // exchanged.
        if self.state.read().blocklist.contains(&socket_addr.ip().to_string()) {
            debug!(parent: &self.span, "{socket_addr} was rejected (blocklisted)");
            return;
        }

        let conn = Monitored::new(stream, self.limits.monitor.clone());
        let stop = self.barrier.stop_signal();
        let result = tokio::select! {
            _ = stop.cancelled() => return,
            result = timeout(self.config.conn_std_deadline, self.managed_accept_conn(conn, socket_addr)) => result,
        };
        match result {
            Ok(Ok((addr, version))) => {
                debug!(parent: &self.span, "accepted connection from new peer {addr} (v{version})");
            }
            Ok(Err(e)) => {
                debug!(parent: &self.span, "{socket_addr} wanted to connect, but failed: {e}");
            }
            Err(_) => {
                debug!(parent: &self.span, "{socket_addr} wanted to connect, but the handshake timed out");
            }
        }
    }

    /// Drives the responder side of the handshake and admits the peer on
    /// success. The deadline is the caller's; it is lifted once this
    /// returns and the session takes over the connection.
    async fn managed_accept_conn(
        &self,
        mut conn: Monitored<TcpStream>,
        socket_addr: SocketAddr,
    ) -> Result<(NetAddress, String)> {
        let remote_version =
            accept_version_handshake(&mut conn, &self.config.protocol_version, &self.minimum_version).await?;

        // Header exchange: the responder reads the remote header first.
        let ours = self.our_header();
        let theirs = exchange_remote_header(&mut conn, &ours).await?;
        exchange_our_header(&mut conn, &ours).await?;

        // The peer is recorded under its reconstructed address: the socket
        // IP combined with the advertised listening port. The advertised
        // host is ignored, but the port lets us call back.
        let remote_addr = NetAddress::join(&socket_addr.ip().to_string(), theirs.net_address.port());

        let peer = Peer {
            info: PeerInfo {
                net_address: remote_addr.clone(),
                version: remote_version.clone(),
                inbound: true,
                // Locality follows the reconstructed address, not the
                // advertised one.
                local: remote_addr.is_local(),
            },
            sess: Arc::new(Session::server(conn, &remote_version)),
            rl: self.limits.gateway.clone(),
        };
        {
            let mut state = self.state.write();
            self.accept_peer(&mut state, peer);
        }

        // Probe the reconstructed address in the background; if a compatible
        // gateway answers there, the address becomes a known node.
        // Deliberately fire-and-forget.
        let gateway = self.clone();
        let ping_addr = remote_addr.clone();
        tokio::spawn(async move {
            let Ok(_guard) = gateway.barrier.register() else {
                return;
            };
            let stop = gateway.barrier.stop_signal();
            let pinged = tokio::select! {
                _ = stop.cancelled() => return,
                pinged = gateway.ping_node(&ping_addr) => pinged,
            };
            if pinged.is_ok() {
                gateway.state.write().add_node(ping_addr);
            }
        });

        Ok((remote_addr, remote_version))
    }

    /// Makes room for the peer if necessary by kicking an existing one, then
    /// adds the peer to the table. Called with the state lock held after a
    /// successful inbound handshake.
    pub(crate) fn accept_peer(&self, state: &mut State, peer: Peer) {
        // If the table is not fully connected, add the peer without kicking
        // anyone out.
        if state.peers.len() < self.config.fully_connected_threshold {
            self.add_peer(state, peer);
            return;
        }

        // Select a peer to kick. Outbound peers and local peers are never
        // kicked; an inbound peer on the candidate's own host is preferred.
        let mut addrs = Vec::new();
        let mut preferred_addrs = Vec::new();
        for (addr, other) in &state.peers {
            if !other.info.inbound || other.info.local {
                continue;
            }
            if addr.host() == peer.info.net_address.host() {
                preferred_addrs.push(addr.clone());
            } else {
                addrs.push(addr.clone());
            }
        }
        if !preferred_addrs.is_empty() {
            addrs = preferred_addrs;
        }

        // Of the remaining options, kick one at random; with nobody suitable
        // the table may temporarily exceed the threshold.
        let Some(kick) = addrs.choose(&mut rand::thread_rng()).cloned() else {
            self.add_peer(state, peer);
            return;
        };
        if let Some(victim) = state.peers.shift_remove(&kick) {
            victim.sess.close();
        }
        info!(parent: &self.span, "disconnected from {kick} to make room for {}", peer.info.net_address);
        self.add_peer(state, peer);
    }

    /// Inserts the peer into the table and spawns the task that owns all
    /// subsequent reads from its session.
    pub(crate) fn add_peer(&self, state: &mut State, peer: Peer) {
        let addr = peer.info.net_address.clone();
        let sess = peer.sess.clone();
        let rl = peer.rl.clone();
        if let Some(replaced) = state.peers.insert(addr.clone(), peer) {
            // A concurrent handshake for the same address lost the race; a
            // closed session must never sit in the table.
            replaced.sess.close();
        }
        tokio::spawn(self.clone().listen_peer(addr, sess, rl));
    }

    /// Removes the peer's table entry, but only if it still holds the given
    /// session; the address may have been re-taken by a newer connection.
    pub(crate) fn remove_peer_if_session(&self, addr: &NetAddress, sess: &Arc<Session>) {
        let mut state = self.state.write();
        if state.peers.get(addr).map_or(false, |peer| Arc::ptr_eq(&peer.sess, sess)) {
            state.peers.shift_remove(addr);
            debug!(parent: &self.span, "removed peer {addr}");
        }
    }
}
