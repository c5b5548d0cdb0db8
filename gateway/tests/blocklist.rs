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

use cobalt_gateway::Error;

#[tokio::test]
async fn manual_disconnect_blocks_the_host() {
    let (node0, store) = gateway_with_store(test_config()).await;
    let node1 = gateway().await;

    node0.connect(node1.address()).await.unwrap();
    assert_eq!(node0.num_peers(), 1);

    // A manual disconnect drops the peer and bars its host.
    node0.disconnect_manual(node1.address()).await.unwrap();
    assert!(node0.peers().is_empty());
    assert_eq!(node0.blocklist(), vec![node1.address().host().to_string()]);
    // The blocklist change is persisted.
    assert_eq!(store.blocklist(), vec![node1.address().host().to_string()]);

    // Outbound dials to the blocked host are refused.
    let error = node0.connect(node1.address()).await.unwrap_err();
    assert!(matches!(error, Error::Blocklisted));

    // Inbound connections from the blocked host are refused before any
    // bytes are exchanged; the dialer only sees its handshake die.
    assert!(node1.connect(node0.address()).await.is_err());
    settle().await;
    assert!(node0.peers().is_empty());

    // A manual connect lifts the block and reconnects.
    node0.connect_manual(node1.address()).await.unwrap();
    assert_eq!(node0.num_peers(), 1);
    assert!(node0.blocklist().is_empty());
    assert!(store.blocklist().is_empty());

    node0.close().await;
    node1.close().await;
}

#[tokio::test]
async fn blocklist_is_keyed_by_host() {
    let (node0, _store) = gateway_with_store(test_config()).await;
    let node1 = gateway().await;
    let node2 = gateway().await;

    node0.connect(node1.address()).await.unwrap();
    node0.disconnect_manual(node1.address()).await.unwrap();

    // Every other loopback gateway shares the blocked host, whatever its
    // port.
    let error = node0.connect(node2.address()).await.unwrap_err();
    assert!(matches!(error, Error::Blocklisted));

    node0.close().await;
    node1.close().await;
    node2.close().await;
}

#[tokio::test]
async fn manual_disconnect_of_a_stranger_does_not_block() {
    let node0 = gateway().await;
    let node1 = gateway().await;

    let error = node0.disconnect_manual(node1.address()).await.unwrap_err();
    assert!(matches!(error, Error::NotConnected));
    assert!(node0.blocklist().is_empty());

    node0.close().await;
    node1.close().await;
}
