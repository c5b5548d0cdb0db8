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

//! The two-phase connection handshake.
//!
//! Phase A exchanges and validates protocol versions; it lets either side
//! reject a connection cheaply, before any session state is allocated.
//! Phase B exchanges session headers, which prevents peers of different
//! blockchains from connecting to each other and detects self-connections.
//! Both phases are pure functions over a raw connection; the caller owns the
//! deadline and the socket.

use semver::Version;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    codec::{read_object, write_object},
    Error,
    NetAddress,
    Result,
    ACCEPT_RESPONSE,
    MAX_ENCODED_RESPONSE_LENGTH,
    MAX_ENCODED_SESSION_HEADER_SIZE,
    MAX_ENCODED_VERSION_LENGTH,
    STOP_RESPONSE,
};

/// The version-exchange response that refuses the connection outright.
const REJECT_RESPONSE: &str = "reject";

/// The random in-memory identifier distinguishing this gateway process.
pub(crate) type GatewayId = [u8; 8];

/// Sent after the initial version exchange. It prevents peers on different
/// blockchains from connecting to each other, and prevents the gateway from
/// connecting to itself.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct SessionHeader {
    pub genesis_id: [u8; 32],
    pub unique_id: GatewayId,
    pub net_address: NetAddress,
}

/// Checks a remote version against the minimum, returning the parsed version.
pub(crate) fn acceptable_version(version: &str, minimum: &Version) -> Result<Version> {
    let parsed = Version::parse(version).map_err(|_| Error::InvalidVersion(version.into()))?;
    if parsed < *minimum {
        return Err(Error::InsufficientVersion(version.into()));
    }
    Ok(parsed)
}

/// Performs the version exchange on the side making the connection request.
/// The remote version is only returned if it is acceptable.
pub(crate) async fn connect_version_handshake<S>(conn: &mut S, version: &str, minimum: &Version) -> Result<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Send our version.
    write_object(conn, version).await?;
    // Read the remote version.
    let remote_version: String = read_object(conn, MAX_ENCODED_VERSION_LENGTH).await?;
    // The responder replies with the reject sentinel instead of a version if
    // it does not accept ours.
    if remote_version == REJECT_RESPONSE {
        return Err(Error::PeerRejectedConn);
    }
    acceptable_version(&remote_version, minimum)?;
    Ok(remote_version)
}

/// Performs the version exchange on the side accepting a connection request.
/// The remote version is only returned if it is acceptable; otherwise the
/// reject sentinel is written before failing.
pub(crate) async fn accept_version_handshake<S>(conn: &mut S, version: &str, minimum: &Version) -> Result<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Read the remote version.
    let remote_version: String = read_object(conn, MAX_ENCODED_VERSION_LENGTH).await?;
    if let Err(e) = acceptable_version(&remote_version, minimum) {
        write_object(conn, REJECT_RESPONSE).await?;
        return Err(e);
    }
    // Send our version.
    write_object(conn, version).await?;
    Ok(remote_version)
}

/// Checks whether the remote session header describes a peer we may connect
/// to.
pub(crate) fn acceptable_session_header(ours: &SessionHeader, theirs: &SessionHeader) -> Result<()> {
    if theirs.genesis_id != ours.genesis_id {
        return Err(Error::PeerGenesisId);
    }
    if theirs.unique_id == ours.unique_id {
        return Err(Error::OurAddress);
    }
    theirs.net_address.is_std_valid()
}

/// Writes our session header and reads the remote's short response.
pub(crate) async fn exchange_our_header<S>(conn: &mut S, ours: &SessionHeader) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_object(conn, ours).await?;

    let response: String = read_object(conn, MAX_ENCODED_RESPONSE_LENGTH).await?;
    match response.as_str() {
        ACCEPT_RESPONSE => Ok(()),
        STOP_RESPONSE => Err(Error::PeerStopped),
        _ => Err(Error::HeaderRejected(response)),
    }
}

/// Reads the remote session header and writes a short acceptance or
/// rejection response.
pub(crate) async fn exchange_remote_header<S>(conn: &mut S, ours: &SessionHeader) -> Result<SessionHeader>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let theirs: SessionHeader = read_object(conn, MAX_ENCODED_SESSION_HEADER_SIZE).await?;

    if let Err(e) = acceptable_session_header(ours, &theirs) {
        // The response is advisory; the rejection stands either way.
        let _ = write_object(conn, &e.to_string()).await;
        return Err(e);
    }
    write_object(conn, ACCEPT_RESPONSE).await?;

    Ok(theirs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimum() -> Version {
        Version::parse("0.5.0").unwrap()
    }

    fn header(genesis_id: [u8; 32], unique_id: GatewayId, addr: &str) -> SessionHeader {
        SessionHeader { genesis_id, unique_id, net_address: NetAddress::from(addr) }
    }

    #[test]
    fn version_floor() {
        assert!(acceptable_version("0.5.0", &minimum()).is_ok());
        assert!(acceptable_version("1.0.0", &minimum()).is_ok());
        assert!(matches!(acceptable_version("0.4.9", &minimum()), Err(Error::InsufficientVersion(_))));
        assert!(matches!(acceptable_version("junk", &minimum()), Err(Error::InvalidVersion(_))));
        assert!(matches!(acceptable_version("reject", &minimum()), Err(Error::InvalidVersion(_))));
    }

    #[tokio::test]
    async fn version_exchange() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let min = minimum();

        let (initiator, responder) = tokio::join!(
            connect_version_handshake(&mut a, "0.6.0", &min),
            accept_version_handshake(&mut b, "0.6.1", &min),
        );
        assert_eq!(initiator.unwrap(), "0.6.1");
        assert_eq!(responder.unwrap(), "0.6.0");
    }

    #[tokio::test]
    async fn responder_rejects_old_version() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let min = minimum();

        let (initiator, responder) = tokio::join!(
            connect_version_handshake(&mut a, "0.4.0", &min),
            accept_version_handshake(&mut b, "0.6.0", &min),
        );
        assert!(matches!(initiator, Err(Error::PeerRejectedConn)));
        assert!(matches!(responder, Err(Error::InsufficientVersion(_))));
    }

    #[tokio::test]
    async fn initiator_rejects_old_version() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        // The responder's own version is below the initiator's minimum; the
        // responder cannot tell and reports success.
        let min = minimum();
        let low = Version::parse("0.1.0").unwrap();
        let (initiator, responder) = tokio::join!(
            connect_version_handshake(&mut a, "0.6.0", &min),
            accept_version_handshake(&mut b, "0.4.0", &low),
        );
        assert!(matches!(initiator, Err(Error::InsufficientVersion(_))));
        assert!(responder.is_ok());
    }

    #[tokio::test]
    async fn header_exchange() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        let ours = header([1; 32], [1; 8], "1.2.3.4:1111");
        let theirs = header([1; 32], [2; 8], "5.6.7.8:2222");

        let ours_clone = ours.clone();
        let theirs_clone = theirs.clone();
        let initiator = async move {
            exchange_our_header(&mut a, &ours_clone).await?;
            exchange_remote_header(&mut a, &ours_clone).await
        };
        let responder = async move {
            let read = exchange_remote_header(&mut b, &theirs_clone).await?;
            exchange_our_header(&mut b, &theirs_clone).await?;
            Ok::<_, Error>(read)
        };

        let (got_theirs, got_ours) = tokio::join!(initiator, responder);
        assert_eq!(got_theirs.unwrap(), theirs);
        assert_eq!(got_ours.unwrap(), ours);
    }

    #[tokio::test]
    async fn header_exchange_rejects_genesis_mismatch() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        let ours = header([1; 32], [1; 8], "1.2.3.4:1111");
        let theirs = header([9; 32], [2; 8], "5.6.7.8:2222");

        let (initiator, responder) = tokio::join!(
            exchange_our_header(&mut a, &ours),
            exchange_remote_header(&mut b, &theirs),
        );
        assert!(matches!(responder, Err(Error::PeerGenesisId)));
        match initiator {
            Err(Error::HeaderRejected(reason)) => assert!(reason.contains("different blockchain")),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn header_exchange_detects_self_connection() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        let ours = header([1; 32], [1; 8], "1.2.3.4:1111");

        let (initiator, responder) = tokio::join!(
            exchange_our_header(&mut a, &ours),
            exchange_remote_header(&mut b, &ours),
        );
        assert!(matches!(responder, Err(Error::OurAddress)));
        assert!(matches!(initiator, Err(Error::HeaderRejected(_))));
    }

    #[tokio::test]
    async fn header_exchange_rejects_invalid_address() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        let ours = header([1; 32], [1; 8], "1.2.3.4:1111");
        let theirs = header([1; 32], [2; 8], "not an address");

        let (initiator, responder) = tokio::join!(
            exchange_our_header(&mut a, &theirs),
            exchange_remote_header(&mut b, &ours),
        );
        assert!(matches!(responder, Err(Error::InvalidAddress(_))));
        assert!(matches!(initiator, Err(Error::HeaderRejected(_))));
    }

    #[tokio::test]
    async fn stop_response_is_distinct() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        let ours = header([1; 32], [1; 8], "1.2.3.4:1111");

        let initiator = exchange_our_header(&mut a, &ours);
        let responder = async move {
            let _: SessionHeader = read_object(&mut b, MAX_ENCODED_SESSION_HEADER_SIZE).await?;
            write_object(&mut b, STOP_RESPONSE).await
        };

        let (initiator, responder) = tokio::join!(initiator, responder);
        assert!(responder.is_ok());
        assert!(matches!(initiator, Err(Error::PeerStopped)));
    }
}
