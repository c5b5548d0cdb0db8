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

mod common;
use common::*;

use cobalt_gateway::{Error, NetAddress};

#[tokio::test]
async fn happy_outbound() {
    let node0 = gateway().await;
    let node1 = gateway().await;

    node0.connect(node1.address()).await.unwrap();
    settle().await;

    // The dialer sees an outbound peer under the dialed address.
    let peers0 = node0.peers();
    assert_eq!(peers0.len(), 1);
    assert_eq!(peers0[0].net_address, node1.address());
    assert!(!peers0[0].inbound);
    assert!(peers0[0].local);

    // The listener sees an inbound peer under the reconstructed address:
    // the socket IP combined with the advertised listening port.
    let peers1 = node1.peers();
    assert_eq!(peers1.len(), 1);
    assert_eq!(peers1[0].net_address, node0.address());
    assert!(peers1[0].inbound);

    // The dialer records the node as a former outbound peer; the listener
    // learns the address through the post-accept ping.
    let nodes0 = node0.nodes();
    assert!(nodes0.iter().any(|n| n.net_address == node1.address() && n.was_outbound_peer));
    let nodes1 = node1.nodes();
    assert!(nodes1.iter().any(|n| n.net_address == node0.address() && !n.was_outbound_peer));

    node0.close().await;
    node1.close().await;
}

#[tokio::test]
async fn wrong_chain_is_rejected() {
    let node0 = gateway().await;
    let mut config = test_config();
    config.genesis_id = [9u8; 32];
    let node1 = gateway_with(config).await;

    let error = node0.connect(node1.address()).await.unwrap_err();
    match error {
        Error::HeaderRejected(reason) => assert!(reason.contains("different blockchain")),
        other => panic!("unexpected error: {other}"),
    }
    settle().await;

    assert!(node0.peers().is_empty());
    assert!(node1.peers().is_empty());

    node0.close().await;
    node1.close().await;
}

#[tokio::test]
async fn version_floor_initiator_side() {
    let node0 = gateway().await;
    // The remote gateway speaks a version below our floor.
    let mut config = test_config();
    config.protocol_version = "0.4.0".into();
    config.minimum_acceptable_peer_version = "0.1.0".into();
    let node1 = gateway_with(config).await;

    let error = node0.connect(node1.address()).await.unwrap_err();
    assert!(matches!(error, Error::InsufficientVersion(v) if v == "0.4.0"));
    settle().await;

    assert!(node0.peers().is_empty());
    assert!(node1.peers().is_empty());

    node0.close().await;
    node1.close().await;
}

#[tokio::test]
async fn version_floor_responder_side() {
    // Our own version is below the remote's floor; the responder answers
    // with the reject sentinel.
    let mut config = test_config();
    config.protocol_version = "0.4.0".into();
    config.minimum_acceptable_peer_version = "0.1.0".into();
    let node0 = gateway_with(config).await;
    let node1 = gateway().await;

    let error = node0.connect(node1.address()).await.unwrap_err();
    assert!(matches!(error, Error::PeerRejectedConn));
    settle().await;

    assert!(node0.peers().is_empty());
    assert!(node1.peers().is_empty());

    node0.close().await;
    node1.close().await;
}

#[tokio::test]
async fn self_connect_is_rejected() {
    let node0 = gateway().await;

    let error = node0.connect(node0.address()).await.unwrap_err();
    assert!(matches!(error, Error::OurAddress));
    assert!(node0.peers().is_empty());

    node0.close().await;
}

#[tokio::test]
async fn duplicate_connect_is_rejected() {
    let node0 = gateway().await;
    let node1 = gateway().await;

    node0.connect(node1.address()).await.unwrap();
    let error = node0.connect(node1.address()).await.unwrap_err();
    assert!(matches!(error, Error::PeerExists));
    assert_eq!(node0.num_peers(), 1);

    node0.close().await;
    node1.close().await;
}

#[tokio::test]
async fn concurrent_connects_yield_one_peer() {
    let node0 = gateway().await;
    let node1 = gateway().await;

    let addr = node1.address();
    let (first, second) = tokio::join!(node0.connect(addr.clone()), node0.connect(addr));

    let results = [first, second];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results.iter().any(|r| matches!(r, Err(Error::PeerExists))));
    assert_eq!(node0.num_peers(), 1);

    node0.close().await;
    node1.close().await;
}

#[tokio::test]
async fn disconnect_removes_peer_and_node() {
    let node0 = gateway().await;
    let node1 = gateway().await;

    node0.connect(node1.address()).await.unwrap();
    assert_eq!(node0.num_peers(), 1);

    node0.disconnect(node1.address()).await.unwrap();
    assert!(node0.peers().is_empty());
    // The node entry goes too, unlike on a session failure.
    assert!(!node0.nodes().iter().any(|n| n.net_address == node1.address()));

    // A reachable peer can be reconnected right away.
    node0.connect(node1.address()).await.unwrap();
    assert_eq!(node0.num_peers(), 1);

    node0.close().await;
    node1.close().await;
}

#[tokio::test]
async fn disconnect_unknown_peer_fails() {
    let node0 = gateway().await;

    let error = node0.disconnect(NetAddress::from("8.8.8.8:4000")).await.unwrap_err();
    assert!(matches!(error, Error::NotConnected));

    node0.close().await;
}

#[tokio::test]
async fn dial_validation() {
    let node0 = gateway().await;

    // DNS names are rejected at dial time.
    let error = node0.connect(NetAddress::from("localhost:4000")).await.unwrap_err();
    assert!(matches!(error, Error::InvalidAddress(_)));

    // Malformed addresses are rejected outright.
    let error = node0.connect(NetAddress::from("garbage")).await.unwrap_err();
    assert!(matches!(error, Error::InvalidAddress(_)));

    // A well-formed, unreachable address fails in the transport.
    let error = node0.connect(NetAddress::from("127.0.0.1:1")).await.unwrap_err();
    assert!(matches!(error, Error::Io(..)));

    node0.close().await;
}

#[tokio::test]
async fn online_reflects_peer_locality() {
    let mut config = test_config();
    config.is_dev = false;
    let node0 = gateway_with(config).await;
    let node1 = gateway().await;

    // No peers: offline.
    assert!(!node0.online());

    // A loopback peer is local and does not make the gateway online.
    node0.connect(node1.address()).await.unwrap();
    assert!(!node0.online());

    // A development gateway always reports itself online.
    assert!(node1.online());

    node0.close().await;
    node1.close().await;
}
