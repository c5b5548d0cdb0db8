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
    fmt,
    net::{IpAddr, Ipv6Addr, SocketAddr},
};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A textual `host:port` network address.
///
/// The host may be a literal IP or a DNS name; IPv6 hosts are bracketed.
/// Outbound dialing additionally requires a literal IP, which is checked at
/// dial time rather than here.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NetAddress(String);

impl NetAddress {
    /// Forms an address from a host and a port, bracketing IPv6 hosts.
    pub fn join(host: &str, port: u16) -> Self {
        if host.contains(':') && !host.starts_with('[') {
            Self(format!("[{host}]:{port}"))
        } else {
            Self(format!("{host}:{port}"))
        }
    }

    /// Splits the address into its host and port, if well-formed.
    fn split(&self) -> Option<(&str, u16)> {
        let (host, port) = self.0.rsplit_once(':')?;
        if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let port: u16 = port.parse().ok()?;

        let bracketed = host.starts_with('[');
        let host = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')).unwrap_or(host);
        if host.is_empty() || host.contains(['[', ']']) {
            return None;
        }
        // A bare (unbracketed) IPv6 host makes the port ambiguous.
        if host.contains(':') && !bracketed {
            return None;
        }

        Some((host, port))
    }

    /// Returns the host part of the address, or an empty string if the
    /// address is malformed.
    pub fn host(&self) -> &str {
        self.split().map(|(host, _)| host).unwrap_or("")
    }

    /// Returns the port part of the address, or 0 if the address is
    /// malformed.
    pub fn port(&self) -> u16 {
        self.split().map(|(_, port)| port).unwrap_or(0)
    }

    /// Checks that the address is a syntactically well-formed `host:port`
    /// with a non-empty host and a non-zero numeric port.
    pub fn is_std_valid(&self) -> Result<()> {
        match self.split() {
            None => Err(Error::InvalidAddress(format!("{} is not of the form host:port", self.0))),
            Some((_, 0)) => Err(Error::InvalidAddress(format!("{} has port 0", self.0))),
            Some(_) => Ok(()),
        }
    }

    /// Checks whether the host is a loopback, private, link-local, or
    /// unspecified IP.
    pub fn is_local(&self) -> bool {
        let Ok(ip) = self.host().parse::<IpAddr>() else {
            return false;
        };
        match ip {
            IpAddr::V4(ip) => {
                ip.is_loopback() || ip.is_private() || ip.is_link_local() || ip.is_unspecified()
            }
            IpAddr::V6(ip) => ip.is_loopback() || ip.is_unspecified() || is_unique_local(ip),
        }
    }

    /// Resolves the address to a socket address; fails unless the host is a
    /// literal IP.
    pub fn to_socket_addr(&self) -> Result<SocketAddr> {
        let (host, port) = self
            .split()
            .ok_or_else(|| Error::InvalidAddress(format!("{} is not of the form host:port", self.0)))?;
        let ip: IpAddr = host
            .parse()
            .map_err(|_| Error::InvalidAddress(format!("the host of {} is not a literal IP", self.0)))?;
        Ok(SocketAddr::new(ip, port))
    }

    /// Returns the address as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// fc00::/7
fn is_unique_local(ip: Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xfe00) == 0xfc00
}

impl fmt::Display for NetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<SocketAddr> for NetAddress {
    fn from(addr: SocketAddr) -> Self {
        Self(addr.to_string())
    }
}

impl From<&str> for NetAddress {
    fn from(addr: &str) -> Self {
        Self(addr.into())
    }
}

impl From<String> for NetAddress {
    fn from(addr: String) -> Self {
        Self(addr)
    }
}
