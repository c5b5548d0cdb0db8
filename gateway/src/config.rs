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

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

/// The version of the gateway protocol spoken by this build.
pub const PROTOCOL_VERSION: &str = "0.6.0";

/// The oldest peer version this build is willing to talk to.
pub const MINIMUM_ACCEPTABLE_PEER_VERSION: &str = "0.5.0";

/// The genesis block ID of the Cobalt mainnet.
pub const GENESIS_ID: [u8; 32] = [
    0x2c, 0x97, 0x4f, 0x1e, 0x8a, 0x5b, 0xd3, 0x60, 0x11, 0xfa, 0x3e, 0x52, 0xc9, 0x07, 0xb4, 0x8d,
    0x6e, 0x21, 0xd5, 0x9c, 0x44, 0xb8, 0x0a, 0xf3, 0x7d, 0x38, 0xe6, 0x95, 0x50, 0x1b, 0xa2, 0xc6,
];

/// The maximum encoded length of a version string during the version
/// exchange.
pub const MAX_ENCODED_VERSION_LENGTH: u64 = 16;

/// The maximum encoded length of a session header. The advertised net
/// address dominates the bound.
pub const MAX_ENCODED_SESSION_HEADER_SIZE: u64 = 40 + MAX_ENCODED_NET_ADDRESS_LENGTH;

/// The maximum encoded length of a net address.
pub const MAX_ENCODED_NET_ADDRESS_LENGTH: u64 = 266;

/// The maximum encoded length of a short handshake response.
pub const MAX_ENCODED_RESPONSE_LENGTH: u64 = 100;

/// The maximum encoded length of the RPC name opening a substream.
pub const MAX_ENCODED_RPC_NAME_LENGTH: u64 = 56;

/// The response sent to accept a session header.
pub const ACCEPT_RESPONSE: &str = "accept";

/// The response sent to decline a connection after a successful handshake,
/// e.g. when the exchange was only a reachability probe.
pub const STOP_RESPONSE: &str = "stop";

/// The gateway's configuration. See the source of [`Config::default`] for
/// the defaults.
#[derive(Clone, Debug)]
pub struct Config {
    /// A user-friendly identifier of the gateway, visible in the logs. If set
    /// to `None`, a sequential numeric identifier is assigned on creation.
    pub name: Option<String>,
    /// The IP address the connection listener binds to.
    pub listener_ip: IpAddr,
    /// The desired listening port. If [`Config::allow_random_port`] is set,
    /// the gateway falls back to a random port when the desired one is
    /// unavailable.
    pub desired_listening_port: Option<u16>,
    /// Allow listening on a random port if the desired one is unavailable.
    pub allow_random_port: bool,
    /// The genesis block ID peers must share to be admitted.
    pub genesis_id: [u8; 32],
    /// The protocol version advertised during the version exchange.
    pub protocol_version: String,
    /// The version floor applied to remote peers.
    pub minimum_acceptable_peer_version: String,
    /// The peer-table capacity; an inbound acceptance beyond it triggers the
    /// kick policy.
    pub fully_connected_threshold: usize,
    /// The minimum time between two inbound acceptances.
    pub accept_interval: Duration,
    /// The deadline applied to a connection for the whole handshake.
    pub conn_std_deadline: Duration,
    /// The time allowed for an outbound dial to complete.
    pub dial_timeout: Duration,
    /// Whether the gateway runs in development mode; a dev gateway reports
    /// itself online even with only local peers.
    pub is_dev: bool,
}

impl Config {
    /// Initializes a new configuration with a listener address and the
    /// default values.
    pub fn new(listener_address: SocketAddr) -> Self {
        Self {
            listener_ip: listener_address.ip(),
            desired_listening_port: Some(listener_address.port()),
            ..Default::default()
        }
    }
}

impl Default for Config {
    /// Initializes a new configuration with the default values.
    fn default() -> Self {
        Self {
            name: None,
            listener_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            desired_listening_port: None,
            allow_random_port: true,
            genesis_id: GENESIS_ID,
            protocol_version: PROTOCOL_VERSION.into(),
            minimum_acceptable_peer_version: MINIMUM_ACCEPTABLE_PEER_VERSION.into(),
            fully_connected_threshold: 128,
            accept_interval: Duration::from_secs(3),
            conn_std_deadline: Duration::from_secs(5 * 60),
            dial_timeout: Duration::from_secs(3 * 60),
            is_dev: false,
        }
    }
}
