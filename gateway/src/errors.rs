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

use std::io;

use thiserror::Error;

/// A specialized result type for gateway operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The errors emitted by the gateway.
#[derive(Debug, Error)]
pub enum Error {
    /// The remote peer's session header carries a different genesis ID.
    #[error("peer is on a different blockchain")]
    PeerGenesisId,
    /// The remote peer is this gateway (matching unique ID), or the dialed
    /// address is our own.
    #[error("can't connect to our own address")]
    OurAddress,
    /// The address is not a syntactically valid `host:port`, or violates a
    /// dial-time requirement.
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    /// The remote version does not parse as a version literal.
    #[error("invalid version: {0}")]
    InvalidVersion(String),
    /// The remote version is below the minimum acceptable peer version.
    #[error("unacceptable version: {0}")]
    InsufficientVersion(String),
    /// The remote peer answered the version exchange with the reject
    /// sentinel.
    #[error("peer rejected connection")]
    PeerRejectedConn,
    /// The remote peer answered the header exchange with the stop sentinel.
    #[error("peer did not want a connection")]
    PeerStopped,
    /// The remote peer rejected our session header with the given reason.
    #[error("peer rejected our header: {0}")]
    HeaderRejected(String),
    /// The peer is already in the peer table (or is being connected to).
    #[error("already connected to this peer")]
    PeerExists,
    /// The host is on the blocklist.
    #[error("can't connect to blocklisted address")]
    Blocklisted,
    /// The address is not in the peer table.
    #[error("not connected to that node")]
    NotConnected,
    /// The gateway has no peer matching the request.
    #[error("no peers")]
    NoPeers,
    /// The requested RPC is not registered.
    #[error("unknown rpc: {0}")]
    UnknownRpc(String),
    /// A framed object exceeded the caller-supplied size bound.
    #[error("encoded object exceeds size limit")]
    ObjectTooLarge,
    /// The handshake or dial did not complete within the deadline.
    #[error("connection timed out")]
    Timeout,
    /// The gateway is shutting down and refuses new work.
    #[error("the gateway is shutting down")]
    Stopped,
    /// A transport failure, wrapped with the operation that hit it.
    #[error("{0}: {1}")]
    Io(&'static str, #[source] io::Error),
    /// Two independent failures surfaced by one operation.
    #[error("{0}; {1}")]
    Composed(Box<Error>, Box<Error>),
}

impl Error {
    /// Wraps a transport error with the operation that produced it.
    pub(crate) fn io(context: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |e| Self::Io(context, e)
    }
}

/// Folds two optional errors into one, keeping both messages when both are
/// present.
pub(crate) fn compose(first: Option<Error>, second: Option<Error>) -> Option<Error> {
    match (first, second) {
        (Some(a), Some(b)) => Some(Error::Composed(a.into(), b.into())),
        (a, None) => a,
        (None, b) => b,
    }
}
