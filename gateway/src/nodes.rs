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

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::*;

use crate::{
    bandwidth::Monitored,
    codec::{read_object, write_object},
    handshake::{acceptable_session_header, connect_version_handshake, exchange_our_header, SessionHeader},
    Error,
    Gateway,
    NetAddress,
    Result,
    State,
    MAX_ENCODED_SESSION_HEADER_SIZE,
    STOP_RESPONSE,
};

/// An entry in the discovery table: an address we know about, whether or not
/// we are currently peered with it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// The node's advertised listening address.
    pub net_address: NetAddress,
    /// Whether this node has ever been connected to as an outbound peer.
    pub was_outbound_peer: bool,
}

impl State {
    /// Inserts an address into the node table, if it is not already present.
    pub(crate) fn add_node(&mut self, addr: NetAddress) {
        self.nodes
            .entry(addr.clone())
            .or_insert(Node { net_address: addr, was_outbound_peer: false });
    }

    /// Removes an address from the node table.
    pub(crate) fn remove_node(&mut self, addr: &NetAddress) {
        self.nodes.shift_remove(addr);
    }

    /// Returns a copy of the node table, for persistence and inspection.
    pub(crate) fn nodes_snapshot(&self) -> Vec<Node> {
        self.nodes.values().cloned().collect()
    }

    /// Returns a copy of the blocklist, for persistence and inspection.
    pub(crate) fn blocklist_snapshot(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self.blocklist.iter().cloned().collect();
        hosts.sort();
        hosts
    }
}

impl Gateway {
    /// Returns the nodes currently known to the gateway.
    pub fn nodes(&self) -> Vec<Node> {
        self.state.read().nodes_snapshot()
    }

    /// Returns the address of a random outbound peer, for the discovery
    /// subsystem to lean on.
    pub fn random_outbound_peer(&self) -> Result<NetAddress> {
        let state = self.state.read();
        let outbound: Vec<&NetAddress> =
            state.peers.values().filter(|peer| !peer.info.inbound).map(|peer| &peer.info.net_address).collect();
        outbound.choose(&mut rand::thread_rng()).map(|addr| (*addr).clone()).ok_or(Error::NoPeers)
    }

    /// Probes the given address for a compatible gateway: dials it, performs
    /// the full handshake, then declines the connection with the stop
    /// sentinel. Success is what admits an advertised address into the node
    /// table.
    pub(crate) async fn ping_node(&self, addr: &NetAddress) -> Result<()> {
        addr.is_std_valid()?;

        let stream = timeout(self.config.dial_timeout, self.dialer.dial(addr))
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(Error::io("failed to dial"))?;
        let mut conn = Monitored::new(stream, self.limits.monitor.clone());

        let ours = self.our_header();
        let probe = async {
            connect_version_handshake(&mut conn, &self.config.protocol_version, &self.minimum_version).await?;
            exchange_our_header(&mut conn, &ours).await?;
            let theirs: SessionHeader = read_object(&mut conn, MAX_ENCODED_SESSION_HEADER_SIZE).await?;
            acceptable_session_header(&ours, &theirs)?;
            // This was only a reachability probe; decline the connection.
            write_object(&mut conn, STOP_RESPONSE).await?;
            Ok(())
        };

        let result = timeout(self.config.conn_std_deadline, probe).await.map_err(|_| Error::Timeout)?;
        if let Err(ref e) = result {
            trace!(parent: &self.span, "pinging node {addr} failed: {e}");
        }
        result
    }
}
